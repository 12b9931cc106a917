//! Runner: the event loop
//!
//! Fills the worker pool, waits for any completion, reports it into the
//! scheduler and schedules the next job. A truth job debits the quota at
//! submission; a ranking job never does. At most one fit-and-rank is in
//! flight at any time.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Index};
use crate::pool::{Executor, JobHandle, JobOutput, WorkerPool};
use crate::scheduler::{map_rank_to_global, Scheduler};

/// Which submission a live handle belongs to.
#[derive(Debug, Clone)]
enum JobTag {
    Truth(Index),
    Ranking,
}

/// Tally of one run, printed by the CLI when the loop drains.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Truth jobs submitted (and debited from the quota).
    pub dispatched: u64,
    /// Truth jobs whose worker returned output.
    pub succeeded: u64,
    /// Truth jobs that failed in the worker.
    pub failed: u64,
    /// Rankings that replaced the pending queue.
    pub rankings_applied: u64,
    /// Rankings that declined or failed, leaving the queue untouched.
    pub rankings_declined: u64,
}

/// Event-loop state for one run.
struct RunContext<'a> {
    counter: u64,
    scheduler: &'a mut Scheduler,
    executor: &'a mut Executor,
    tags: HashMap<JobHandle, JobTag>,
    /// Global indices snapshotted when the in-flight ranking was submitted;
    /// `Some` doubles as the single-ranking-in-flight guard.
    pending_rank: Option<Vec<Index>>,
    report: RunReport,
}

impl RunContext<'_> {
    /// Submit the next job, if any. Ranking requests win over truth jobs but
    /// never stack; an exhausted queue simply stops producing truth jobs so
    /// an oversized quota drains cleanly.
    fn schedule(&mut self) -> Result<Option<JobHandle>> {
        if self.counter == 0 && self.pending_rank.is_none() {
            return Ok(None);
        }

        if self.scheduler.needs_new_ranking() && self.pending_rank.is_none() {
            let (indices, input) = self.scheduler.ranker_inputs();
            let handle = self.executor.submit_fit_and_rank(input)?;
            debug!(handle = handle.id(), "fit-and-rank submitted");
            self.pending_rank = Some(indices);
            self.tags.insert(handle, JobTag::Ranking);
            return Ok(Some(handle));
        }

        if self.counter > 0 {
            let index = match self.scheduler.next() {
                Ok(index) => index,
                Err(EngineError::Exhausted) => {
                    debug!("pending queue exhausted; quota remainder dropped");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
            let params = self.scheduler.parameters(index)?;
            let handle = self.executor.submit_truth(params)?;
            debug!(handle = handle.id(), index, "truth job submitted");
            self.tags.insert(handle, JobTag::Truth(index));
            self.counter -= 1;
            self.report.dispatched += 1;
            return Ok(Some(handle));
        }

        Ok(None)
    }

    /// Fold one completed handle back into the scheduler and free its slot.
    fn report(&mut self, handle: JobHandle) -> Result<()> {
        let tag = self
            .tags
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle.id()))?;
        let outcome = self.executor.take_outcome(handle)?;
        self.executor.release(handle)?;

        match tag {
            JobTag::Truth(index) => {
                let value = match outcome {
                    Ok(JobOutput::Truth(output)) => Some(output),
                    Ok(JobOutput::Ranking(_)) => {
                        bail!("truth handle {} produced a ranking", handle.id())
                    }
                    Err(err) => {
                        warn!(index, error = %err, "truth job failed");
                        None
                    }
                };
                match value {
                    Some(_) => self.report.succeeded += 1,
                    None => self.report.failed += 1,
                }
                self.scheduler.set_result(index, value.as_ref())?;
            }
            JobTag::Ranking => {
                let snapshot = match self.pending_rank.take() {
                    Some(snapshot) => snapshot,
                    None => bail!("ranking handle {} had no snapshot", handle.id()),
                };
                let ranks = match outcome {
                    Ok(JobOutput::Ranking(Some(local))) => {
                        let mapped = map_rank_to_global(&snapshot, &local);
                        if mapped.is_none() {
                            warn!("ranker returned indices out of range; keeping current queue");
                        }
                        mapped
                    }
                    Ok(JobOutput::Ranking(None)) => None,
                    Ok(JobOutput::Truth(_)) => {
                        bail!("ranking handle {} produced truth output", handle.id())
                    }
                    Err(err) => {
                        warn!(error = %err, "ranking job failed; keeping current queue");
                        None
                    }
                };
                match ranks {
                    Some(_) => self.report.rankings_applied += 1,
                    None => self.report.rankings_declined += 1,
                }
                self.scheduler.set_ranks(ranks);
            }
        }
        Ok(())
    }
}

/// Owns the scheduler and worker pool for the duration of a run.
#[derive(Debug)]
pub struct Runner {
    scheduler: Scheduler,
    pool: WorkerPool,
}

impl Runner {
    pub fn new(scheduler: Scheduler, pool: WorkerPool) -> Self {
        Self { scheduler, pool }
    }

    #[allow(dead_code)]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Drive up to `counter` truth calculations to completion.
    pub fn run(&mut self, counter: u64) -> Result<RunReport> {
        let ncpus = self.pool.len() as u64;
        let mut executor = self.pool.enter()?;
        info!(counter, ncpus, "run started");

        let mut ctx = RunContext {
            counter,
            scheduler: &mut self.scheduler,
            executor: &mut executor,
            tags: HashMap::new(),
            pending_rank: None,
            report: RunReport::default(),
        };

        let mut in_flight: HashSet<JobHandle> = HashSet::new();
        for _ in 0..ncpus.min(counter) {
            if let Some(handle) = ctx.schedule()? {
                in_flight.insert(handle);
            }
        }

        while !in_flight.is_empty() {
            let done = ctx.executor.wait_any(&in_flight)?;
            for handle in done {
                in_flight.remove(&handle);
                ctx.report(handle)?;
                if let Some(next) = ctx.schedule()? {
                    in_flight.insert(next);
                }
            }
        }

        let report = ctx.report.clone();
        info!(
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            failed = report.failed,
            rankings_applied = report.rankings_applied,
            rankings_declined = report.rankings_declined,
            "run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{Calculator, Schema, SerializedOpaque};
    use crate::data::{DataManager, Feature, Target};
    use crate::pool::Worker;
    use crate::ranker::{KeepOrderRanker, Ranker};
    use anyhow::Context;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Deterministic truth: target is the candidate's own index.
    struct IndexCalc;

    impl Calculator for IndexCalc {
        fn calculate(&self, params: &SerializedOpaque) -> Result<SerializedOpaque> {
            let subdir = params.get_str("subdir").context("missing subdir")?;
            let mut out = SerializedOpaque::new();
            out.insert("target", subdir.as_bytes().to_vec());
            Ok(out)
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    /// Truth that always fails.
    struct AlwaysFailCalc;

    impl Calculator for AlwaysFailCalc {
        fn calculate(&self, _params: &SerializedOpaque) -> Result<SerializedOpaque> {
            anyhow::bail!("simulation crashed")
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    /// Truth that fails for one specific candidate.
    struct FailOnCalc(usize);

    impl Calculator for FailOnCalc {
        fn calculate(&self, params: &SerializedOpaque) -> Result<SerializedOpaque> {
            let subdir = params.get_str("subdir").context("missing subdir")?;
            if subdir == self.0.to_string() {
                anyhow::bail!("simulation crashed on candidate {}", subdir);
            }
            let mut out = SerializedOpaque::new();
            out.insert("target", subdir.as_bytes().to_vec());
            Ok(out)
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    /// Truth that records how many calculations overlap.
    struct GaugeCalc {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Calculator for GaugeCalc {
        fn calculate(&self, params: &SerializedOpaque) -> Result<SerializedOpaque> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.current.fetch_sub(1, Ordering::SeqCst);
            let subdir = params.get_str("subdir").context("missing subdir")?;
            let mut out = SerializedOpaque::new();
            out.insert("target", subdir.as_bytes().to_vec());
            Ok(out)
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    #[derive(Clone)]
    struct IdentityRanker;

    impl Ranker for IdentityRanker {
        fn fit(&mut self, _x: &[Feature], _y: &[Target]) -> Result<()> {
            Ok(())
        }

        fn rank(&mut self, unknown_x: &[Feature]) -> Result<Option<Vec<usize>>> {
            Ok(Some((0..unknown_x.len()).collect()))
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    #[derive(Clone)]
    struct ReverseRanker;

    impl Ranker for ReverseRanker {
        fn fit(&mut self, _x: &[Feature], _y: &[Target]) -> Result<()> {
            Ok(())
        }

        fn rank(&mut self, unknown_x: &[Feature]) -> Result<Option<Vec<usize>>> {
            Ok(Some((0..unknown_x.len()).rev().collect()))
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    /// Identity ranking that arrives late, after truth jobs from the old
    /// queue have been dispatched past the ranker's snapshot.
    #[derive(Clone)]
    struct SlowIdentityRanker;

    impl Ranker for SlowIdentityRanker {
        fn fit(&mut self, _x: &[Feature], _y: &[Target]) -> Result<()> {
            Ok(())
        }

        fn rank(&mut self, unknown_x: &[Feature]) -> Result<Option<Vec<usize>>> {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Some((0..unknown_x.len()).collect()))
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    /// Identity ranking plus overlap accounting, for the one-in-flight rule.
    #[derive(Clone)]
    struct GaugeRanker {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl GaugeRanker {
        fn new() -> Self {
            Self {
                current: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Ranker for GaugeRanker {
        fn fit(&mut self, _x: &[Feature], _y: &[Target]) -> Result<()> {
            Ok(())
        }

        fn rank(&mut self, unknown_x: &[Feature]) -> Result<Option<Vec<usize>>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Some((0..unknown_x.len()).collect()))
        }

        fn schema(&self) -> Schema {
            Schema::indexed_float()
        }
    }

    fn manager(dir: &Path, n: usize) -> DataManager {
        let list = crate::data::write_catalog(dir, n);
        DataManager::from_catalog_file(&list, Schema::indexed_float(), &dir.join("out.csv"))
            .unwrap()
    }

    fn read_sink(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("out.csv"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn runner_with(
        dir: &Path,
        n: usize,
        init: &mut dyn Ranker,
        threshold: u64,
        ncpus: usize,
        calc: Arc<dyn Calculator>,
        active: impl Ranker + Clone + Sync + 'static,
    ) -> Runner {
        let scheduler = Scheduler::new(manager(dir, n), init, threshold).unwrap();
        let factory = move || -> Result<Worker> {
            Ok(Worker::new(calc.clone(), Box::new(active.clone())))
        };
        let pool = WorkerPool::new(ncpus, Box::new(factory)).unwrap();
        Runner::new(scheduler, pool)
    }

    #[test]
    fn test_trivial_serial_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            3,
            &mut IdentityRanker,
            u64::MAX,
            1,
            Arc::new(IndexCalc),
            KeepOrderRanker,
        );
        let report = runner.run(3).unwrap();

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(read_sink(dir.path()), vec!["#AMI0.0.1", "0,0", "1,1", "2,2"]);
    }

    #[test]
    fn test_all_failures_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            3,
            &mut IdentityRanker,
            u64::MAX,
            1,
            Arc::new(AlwaysFailCalc),
            KeepOrderRanker,
        );
        let report = runner.run(3).unwrap();

        assert_eq!(report.failed, 3);
        assert_eq!(read_sink(dir.path()), vec!["#AMI0.0.1", "#0,", "#1,", "#2,"]);
    }

    #[test]
    fn test_reranking_fires() {
        // Initial queue [3,2,1,0]; after index 3 completes the active
        // identity ranker rebuilds the queue as [0,1,2].
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            4,
            &mut ReverseRanker,
            0,
            1,
            Arc::new(IndexCalc),
            IdentityRanker,
        );
        let report = runner.run(4).unwrap();

        assert_eq!(report.dispatched, 4);
        assert!(report.rankings_applied >= 1);
        assert_eq!(
            read_sink(dir.path()),
            vec!["#AMI0.0.1", "3,3", "0,0", "1,1", "2,2"]
        );
    }

    #[test]
    fn test_parallel_saturation() {
        let dir = tempfile::tempdir().unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calc = Arc::new(GaugeCalc {
            current: current.clone(),
            peak: peak.clone(),
        });
        let mut runner = runner_with(
            dir.path(),
            10,
            &mut IdentityRanker,
            u64::MAX,
            4,
            calc,
            KeepOrderRanker,
        );
        let report = runner.run(10).unwrap();

        assert_eq!(report.dispatched, 10);
        assert_eq!(report.succeeded, 10);
        assert_eq!(peak.load(Ordering::SeqCst), 4);

        // every candidate reported exactly once, in some completion order
        let mut indices: Vec<usize> = read_sink(dir.path())
            .iter()
            .skip(1)
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<usize>>());
    }

    #[test]
    fn test_ranker_decline_keeps_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            3,
            &mut IdentityRanker,
            0,
            1,
            Arc::new(IndexCalc),
            KeepOrderRanker,
        );
        let report = runner.run(3).unwrap();

        assert_eq!(report.rankings_applied, 0);
        assert!(report.rankings_declined >= 1);
        assert_eq!(read_sink(dir.path()), vec!["#AMI0.0.1", "0,0", "1,1", "2,2"]);
    }

    #[test]
    fn test_pool_drains_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            5,
            &mut IdentityRanker,
            u64::MAX,
            1,
            Arc::new(FailOnCalc(2)),
            KeepOrderRanker,
        );
        let report = runner.run(5).unwrap();

        assert_eq!(report.dispatched, 5);
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(
            read_sink(dir.path()),
            vec!["#AMI0.0.1", "0,0", "1,1", "#2,", "3,3", "4,4"]
        );
    }

    #[test]
    fn test_zero_quota_submits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            3,
            &mut IdentityRanker,
            0,
            2,
            Arc::new(IndexCalc),
            KeepOrderRanker,
        );
        let report = runner.run(0).unwrap();

        assert_eq!(report, RunReport::default());
        assert_eq!(read_sink(dir.path()), vec!["#AMI0.0.1"]);
    }

    #[test]
    fn test_single_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            1,
            &mut IdentityRanker,
            0,
            1,
            Arc::new(IndexCalc),
            KeepOrderRanker,
        );
        let report = runner.run(1).unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(read_sink(dir.path()), vec!["#AMI0.0.1", "0,0"]);
    }

    #[test]
    fn test_quota_beyond_catalogue_drains() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            3,
            &mut IdentityRanker,
            u64::MAX,
            2,
            Arc::new(IndexCalc),
            KeepOrderRanker,
        );
        let report = runner.run(10).unwrap();

        // min(counter, N) records
        assert_eq!(report.dispatched, 3);
        assert_eq!(read_sink(dir.path()).len(), 4);
    }

    #[test]
    fn test_stale_ranking_never_redispatches() {
        // While the ranking sleeps, truth jobs for indices inside its
        // snapshot are dispatched from the old queue and complete. The
        // installed queue must not hand those indices back to select.
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with(
            dir.path(),
            8,
            &mut IdentityRanker,
            0,
            2,
            Arc::new(IndexCalc),
            SlowIdentityRanker,
        );
        let report = runner.run(8).unwrap();

        assert_eq!(report.dispatched, 8);
        assert_eq!(report.succeeded, 8);

        let mut indices: Vec<usize> = read_sink(dir.path())
            .iter()
            .skip(1)
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..8).collect::<Vec<usize>>());
    }

    #[test]
    fn test_single_ranking_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = GaugeRanker::new();
        let mut runner = runner_with(
            dir.path(),
            20,
            &mut IdentityRanker,
            0,
            4,
            Arc::new(IndexCalc),
            gauge.clone(),
        );
        let report = runner.run(20).unwrap();

        assert_eq!(report.dispatched, 20);
        assert!(gauge.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }
}
