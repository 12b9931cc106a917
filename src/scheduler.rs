//! Scheduler: pending queue, dirty counter, selection
//!
//! Keeps the ranked queue of candidates still worth calculating and decides
//! when enough new truth results have accumulated to ask for a re-ranking.
//! All state here is mutated from the coordinator thread only.

use anyhow::{Context, Result};
use tracing::debug;

use crate::calculator::SerializedOpaque;
use crate::data::DataManager;
use crate::error::{EngineError, Index};
use crate::ranker::{Ranker, SurrogateInput};

/// Queue bookkeeping: ranked pending indices, the consumption pointer and
/// the dirty counter that drives re-ranking requests.
#[derive(Debug, Default)]
struct QueueState {
    ptr: usize,
    dirty_count: u64,
    threshold: u64,
    ranked_unknown_indices: Vec<Index>,
}

impl QueueState {
    fn next(&mut self) -> Result<Index, EngineError> {
        let index = self
            .ranked_unknown_indices
            .get(self.ptr)
            .copied()
            .ok_or(EngineError::Exhausted)?;
        self.ptr += 1;
        Ok(index)
    }

    fn reset(&mut self, ranks: Vec<Index>) {
        self.dirty_count = 0;
        self.ptr = 0;
        self.ranked_unknown_indices = ranks;
    }

    fn is_dirty(&self) -> bool {
        self.dirty_count > self.threshold
    }

    fn mark_dirty(&mut self) {
        self.dirty_count += 1;
    }
}

/// Map a ranker's local permutation back to global candidate indices.
/// `None` if the ranker produced an index outside its input.
pub fn map_rank_to_global(global: &[Index], local: &[usize]) -> Option<Vec<Index>> {
    local.iter().map(|&l| global.get(l).copied()).collect()
}

/// The scheduler proper. Constructed with an already-populated data manager
/// and an initial ranker, which runs synchronously before any worker exists.
#[derive(Debug)]
pub struct Scheduler {
    data: DataManager,
    state: QueueState,
}

impl Scheduler {
    /// Build the scheduler and compute the initial ranking. The initial
    /// ranker declining to rank leaves the scheduler without a queue, which
    /// is a configuration-time failure.
    pub fn new(data: DataManager, initial_ranker: &mut dyn Ranker, threshold: u64) -> Result<Self> {
        let mut scheduler = Self {
            data,
            state: QueueState::default(),
        };

        let (global, input) = scheduler.ranker_inputs();
        initial_ranker
            .fit(input.known_x(), input.known_y())
            .context("initial ranker failed to fit")?;
        let local = initial_ranker
            .rank(input.unknown_x())
            .context("initial ranker failed to rank")?
            .ok_or(EngineError::NoInitialRanking)?;
        let ranked = map_rank_to_global(&global, &local)
            .context("initial ranker returned indices out of range")?;

        scheduler.state.reset(ranked);
        scheduler.state.threshold = threshold;
        debug!(
            candidates = scheduler.data.len(),
            threshold, "initial ranking computed"
        );
        Ok(scheduler)
    }

    /// True once more truth results have arrived since the last ranking
    /// than the configured threshold.
    pub fn needs_new_ranking(&self) -> bool {
        self.state.is_dirty()
    }

    /// Snapshot for one fit-and-rank job: the global indices still
    /// available, plus the known/unknown split at this instant. The global
    /// list and `unknown_x` always pair up elementwise.
    pub fn ranker_inputs(&self) -> (Vec<Index>, SurrogateInput) {
        let indices = self.data.available_for_calculation();
        let unknown_x = self.data.unknown();
        let (known_x, known_y) = self.data.known();
        debug_assert_eq!(indices.len(), unknown_x.len());
        (indices, SurrogateInput::new(known_x, known_y, unknown_x))
    }

    /// Consume the best pending candidate.
    pub fn next(&mut self) -> Result<Index, EngineError> {
        self.state.next()
    }

    /// Truth-job parameters for `index`; this is the point where the
    /// candidate is marked in flight.
    pub fn parameters(&mut self, index: Index) -> Result<SerializedOpaque> {
        let params = self.data.parameters(index)?;
        Ok(params.ok_or(EngineError::MissingParameters(index))?)
    }

    /// Record a truth outcome (`None` = the job failed) and count it
    /// toward the next re-ranking.
    pub fn set_result(&mut self, index: Index, value: Option<&SerializedOpaque>) -> Result<()> {
        self.data.set_result(index, value)?;
        self.state.mark_dirty();
        Ok(())
    }

    /// Install a new pending queue, or decline. A decline leaves the queue
    /// and pointer untouched; the dirty count still clears, so the next
    /// request waits for new truth data.
    ///
    /// The ranking was computed from a snapshot; candidates dispatched from
    /// the old queue while it was in flight are no longer available and are
    /// dropped here, so an in-flight index is never handed back to select.
    pub fn set_ranks(&mut self, ranks: Option<Vec<Index>>) {
        match ranks {
            Some(ranks) => {
                let before = ranks.len();
                let ranks: Vec<Index> = ranks
                    .into_iter()
                    .filter(|&index| self.data.is_available(index))
                    .collect();
                debug!(
                    len = ranks.len(),
                    dropped = before - ranks.len(),
                    "pending queue replaced"
                );
                self.state.reset(ranks);
            }
            None => {
                self.state.dirty_count = 0;
            }
        }
    }

    #[allow(dead_code)]
    pub fn data(&self) -> &DataManager {
        &self.data
    }
}
