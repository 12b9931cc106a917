//! Worker pool: bounded slots, two job kinds, completion handles
//!
//! One OS thread per slot. Submission takes a worker token from the idle
//! queue (blocking while every slot is busy); the token goes back only when
//! the coordinator releases the completed handle. Workers never touch
//! scheduler state; results travel back over the completion channel.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::calculator::{Calculator, SerializedOpaque};
use crate::error::EngineError;
use crate::ranker::{Ranker, SurrogateInput};

/// Completion token for one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What a finished job produced.
#[derive(Debug)]
pub enum JobOutput {
    /// Truth calculation output, still opaque.
    Truth(SerializedOpaque),
    /// Local ranking permutation, or `None` for "keep current order".
    Ranking(Option<Vec<usize>>),
}

/// A job either produced output or failed inside the worker.
pub type JobOutcome = Result<JobOutput>;

enum Job {
    Truth(SerializedOpaque),
    FitAndRank(SurrogateInput),
}

/// One pool slot's executor-side state: a shared calculator handle plus a
/// ranker instance of its own (fitting mutates the ranker).
pub struct Worker {
    truth: Arc<dyn Calculator>,
    ranker: Box<dyn Ranker>,
}

impl Worker {
    pub fn new(truth: Arc<dyn Calculator>, ranker: Box<dyn Ranker>) -> Self {
        Self { truth, ranker }
    }

    fn execute(&mut self, job: Job) -> JobOutcome {
        match job {
            Job::Truth(params) => self.truth.calculate(&params).map(JobOutput::Truth),
            Job::FitAndRank(input) => {
                self.ranker.fit(input.known_x(), input.known_y())?;
                self.ranker.rank(input.unknown_x()).map(JobOutput::Ranking)
            }
        }
    }
}

/// Builds one worker per pool slot. Closures work directly:
/// `move || Ok(Worker::new(truth.clone(), Box::new(ranker.clone())))`.
pub trait WorkerFactory: Send + Sync {
    fn build(&self) -> Result<Worker>;
}

impl<F> WorkerFactory for F
where
    F: Fn() -> Result<Worker> + Send + Sync,
{
    fn build(&self) -> Result<Worker> {
        self()
    }
}

/// A fixed number of worker slots plus the recipe for filling them.
/// `enter()` spawns the workers; dropping the returned executor drains and
/// joins them.
pub struct WorkerPool {
    ncpus: usize,
    factory: Box<dyn WorkerFactory>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("ncpus", &self.ncpus)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(ncpus: usize, factory: Box<dyn WorkerFactory>) -> Result<Self, EngineError> {
        if ncpus == 0 {
            return Err(EngineError::EmptyPool);
        }
        Ok(Self { ncpus, factory })
    }

    pub fn len(&self) -> usize {
        self.ncpus
    }

    /// Open the pool scope: build `ncpus` workers and put every slot in the
    /// idle queue.
    pub fn enter(&self) -> Result<Executor> {
        let (completion_tx, completion_rx) = unbounded();
        let (idle_tx, idle_rx) = bounded(self.ncpus);
        let mut job_txs = Vec::with_capacity(self.ncpus);
        let mut threads = Vec::with_capacity(self.ncpus);

        for worker_id in 0..self.ncpus {
            let worker = self
                .factory
                .build()
                .with_context(|| format!("failed to build worker {}", worker_id))?;
            let (job_tx, job_rx) = unbounded::<(JobHandle, Job)>();
            let tx = completion_tx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("ami-worker-{}", worker_id))
                .spawn(move || worker_loop(worker, job_rx, tx))?;
            job_txs.push(job_tx);
            threads.push(thread);
            idle_tx
                .send(worker_id)
                .map_err(|_| EngineError::PoolDisconnected)?;
        }
        debug!(ncpus = self.ncpus, "worker pool entered");

        Ok(Executor {
            job_txs,
            completion_rx,
            idle_tx,
            idle_rx,
            busy: HashMap::new(),
            finished: HashMap::new(),
            next_handle: 0,
            threads,
        })
    }
}

fn worker_loop(
    mut worker: Worker,
    jobs: Receiver<(JobHandle, Job)>,
    completions: Sender<(JobHandle, JobOutcome)>,
) {
    while let Ok((handle, job)) = jobs.recv() {
        let outcome = match catch_unwind(AssertUnwindSafe(|| worker.execute(job))) {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("worker panicked during job {}", handle.id())),
        };
        if completions.send((handle, outcome)).is_err() {
            // coordinator is gone; nothing left to report to
            break;
        }
    }
}

/// Live pool scope. All methods are called from the coordinator thread
/// only; the executor blocks in `submit_*` (idle queue) and `wait_any`
/// (completion channel) and nowhere else.
pub struct Executor {
    job_txs: Vec<Sender<(JobHandle, Job)>>,
    completion_rx: Receiver<(JobHandle, JobOutcome)>,
    idle_tx: Sender<usize>,
    idle_rx: Receiver<usize>,
    busy: HashMap<JobHandle, usize>,
    finished: HashMap<JobHandle, JobOutcome>,
    next_handle: u64,
    threads: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Claim a slot and dispatch a truth calculation.
    pub fn submit_truth(&mut self, params: SerializedOpaque) -> Result<JobHandle> {
        self.submit(Job::Truth(params))
    }

    /// Claim a slot and dispatch a fit-and-rank job.
    pub fn submit_fit_and_rank(&mut self, input: SurrogateInput) -> Result<JobHandle> {
        self.submit(Job::FitAndRank(input))
    }

    fn submit(&mut self, job: Job) -> Result<JobHandle> {
        let worker_id = self
            .idle_rx
            .recv()
            .map_err(|_| EngineError::PoolDisconnected)?;
        let handle = JobHandle(self.next_handle);
        self.next_handle += 1;
        self.job_txs[worker_id]
            .send((handle, job))
            .map_err(|_| EngineError::PoolDisconnected)?;
        self.busy.insert(handle, worker_id);
        debug!(handle = handle.id(), worker_id, "job submitted");
        Ok(handle)
    }

    /// Block until at least one of `in_flight` has completed; return the
    /// completed subset.
    pub fn wait_any(&mut self, in_flight: &HashSet<JobHandle>) -> Result<Vec<JobHandle>> {
        loop {
            let done: Vec<JobHandle> = in_flight
                .iter()
                .copied()
                .filter(|h| self.finished.contains_key(h))
                .collect();
            if !done.is_empty() {
                return Ok(done);
            }
            let (handle, outcome) = self
                .completion_rx
                .recv()
                .map_err(|_| EngineError::PoolDisconnected)?;
            self.finished.insert(handle, outcome);
            // pick up anything else that finished in the meantime
            while let Ok((h, o)) = self.completion_rx.try_recv() {
                self.finished.insert(h, o);
            }
        }
    }

    /// Take a completed handle's outcome. Reporting an unknown or still
    /// running handle is a contract violation.
    pub fn take_outcome(&mut self, handle: JobHandle) -> Result<JobOutcome> {
        Ok(self
            .finished
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle.id()))?)
    }

    /// Give the handle's worker slot back to the idle queue.
    pub fn release(&mut self, handle: JobHandle) -> Result<()> {
        let worker_id = self
            .busy
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle.id()))?;
        self.idle_tx
            .send(worker_id)
            .map_err(|_| EngineError::PoolDisconnected)?;
        Ok(())
    }

    /// Idle slots right now. Test and diagnostics surface.
    #[allow(dead_code)]
    pub fn idle_slots(&self) -> usize {
        self.idle_rx.len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Closing the job channels stops every worker after its current
        // job; joining drains in-flight work even when unwinding.
        self.job_txs.clear();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}
