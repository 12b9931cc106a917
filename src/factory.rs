//! Engine builder: validated wiring of every moving part
//!
//! Each slot is set independently; `build()` refuses to produce a runner
//! while any required slot is empty and names every missing one. There are
//! no defaults for required slots.

use anyhow::Result;
use std::sync::Arc;

use crate::calculator::Calculator;
use crate::data::DataManager;
use crate::error::EngineError;
use crate::pool::{Worker, WorkerPool};
use crate::ranker::{Ranker, RankerFactory};
use crate::runner::Runner;
use crate::scheduler::Scheduler;

/// Assembles a [`Runner`] from its parts.
#[derive(Default)]
pub struct EngineBuilder {
    data: Option<DataManager>,
    truth: Option<Arc<dyn Calculator>>,
    initial_ranker: Option<Box<dyn Ranker>>,
    ranker: Option<Box<dyn RankerFactory>>,
    ncpus: Option<usize>,
    threshold: u64,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate catalogue, state machine and result sink.
    pub fn data_manager(mut self, data: DataManager) -> Self {
        self.data = Some(data);
        self
    }

    /// The external truth calculator, shared by every worker.
    pub fn truth(mut self, truth: Arc<dyn Calculator>) -> Self {
        self.truth = Some(truth);
        self
    }

    /// Ranker used once, synchronously, to order the queue before any truth
    /// data exists.
    pub fn initial_ranker(mut self, ranker: Box<dyn Ranker>) -> Self {
        self.initial_ranker = Some(ranker);
        self
    }

    /// Factory for the per-worker active rankers.
    pub fn active_ranker(mut self, factory: Box<dyn RankerFactory>) -> Self {
        self.ranker = Some(factory);
        self
    }

    /// Number of worker slots.
    pub fn pool_size(mut self, ncpus: usize) -> Self {
        self.ncpus = Some(ncpus);
        self
    }

    /// Dirty-count ceiling above which a re-ranking is requested.
    /// Optional; zero re-ranks after every truth result.
    pub fn threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Validate every slot and wire the runner. Runs the initial ranking.
    pub fn build(self) -> Result<Runner> {
        let mut missing = Vec::new();
        if self.data.is_none() {
            missing.push("data_manager".to_string());
        }
        if self.truth.is_none() {
            missing.push("truth".to_string());
        }
        if self.initial_ranker.is_none() {
            missing.push("initial_ranker".to_string());
        }
        if self.ranker.is_none() {
            missing.push("active_ranker".to_string());
        }
        if self.ncpus.is_none() {
            missing.push("pool_size".to_string());
        }

        let (Some(data), Some(truth), Some(mut initial_ranker), Some(ranker), Some(ncpus)) = (
            self.data,
            self.truth,
            self.initial_ranker,
            self.ranker,
            self.ncpus,
        ) else {
            return Err(EngineError::MissingFields(missing).into());
        };

        validate_schemas(&data, truth.as_ref(), initial_ranker.as_ref())?;

        let worker_factory = {
            let truth = truth.clone();
            move || -> Result<Worker> { Ok(Worker::new(truth.clone(), ranker.build())) }
        };
        let pool = WorkerPool::new(ncpus, Box::new(worker_factory))?;
        let scheduler = Scheduler::new(data, initial_ranker.as_mut(), self.threshold)?;
        Ok(Runner::new(scheduler, pool))
    }
}

fn validate_schemas(
    data: &DataManager,
    truth: &dyn Calculator,
    initial_ranker: &dyn Ranker,
) -> Result<(), EngineError> {
    let truth_schema = truth.schema();
    if truth_schema.first_target().is_none() {
        return Err(EngineError::SchemaMismatch(
            "truth calculator declares no target field".to_string(),
        ));
    }
    if &truth_schema != data.truth_schema() {
        return Err(EngineError::SchemaMismatch(
            "data manager and truth calculator disagree on the truth schema".to_string(),
        ));
    }
    if initial_ranker.schema() != data.surrogate_schema() {
        return Err(EngineError::SchemaMismatch(
            "initial ranker schema does not match the surrogate store".to_string(),
        ));
    }
    Ok(())
}
