//! Ranker contract and shipped rankers
//!
//! A ranker is the cheap surrogate: fit on what is known, then order the
//! unknowns best to worst. Returned indices are local to the `unknown_x`
//! slice it was given; the scheduler maps them back to global indices.

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::calculator::Schema;
use crate::data::{Feature, Target};

/// Inputs for one fit-and-rank job: everything known so far plus the
/// features still unknown. `known_x` and `known_y` always pair up.
#[derive(Debug, Clone)]
pub struct SurrogateInput {
    known_x: Vec<Feature>,
    known_y: Vec<Target>,
    unknown_x: Vec<Feature>,
}

impl SurrogateInput {
    pub fn new(known_x: Vec<Feature>, known_y: Vec<Target>, unknown_x: Vec<Feature>) -> Self {
        assert_eq!(
            known_x.len(),
            known_y.len(),
            "known features and targets must pair up"
        );
        Self {
            known_x,
            known_y,
            unknown_x,
        }
    }

    pub fn known_x(&self) -> &[Feature] {
        &self.known_x
    }

    pub fn known_y(&self) -> &[Target] {
        &self.known_y
    }

    pub fn unknown_x(&self) -> &[Feature] {
        &self.unknown_x
    }
}

/// The surrogate model plus acquisition function, seen as one capability.
///
/// `rank` returns a permutation of `[0, unknown_x.len())` ordered best to
/// worst, or `None` when the ranker has no update and the current queue
/// should stand.
pub trait Ranker: Send {
    fn fit(&mut self, known_x: &[Feature], known_y: &[Target]) -> Result<()>;

    fn rank(&mut self, unknown_x: &[Feature]) -> Result<Option<Vec<usize>>>;

    fn schema(&self) -> Schema;
}

/// Builds one ranker per worker slot; fitting mutates the ranker, so slots
/// cannot share one. Closures work directly:
/// `|| Box::new(KeepOrderRanker) as Box<dyn Ranker>`.
pub trait RankerFactory: Send + Sync {
    fn build(&self) -> Box<dyn Ranker>;
}

impl<F> RankerFactory for F
where
    F: Fn() -> Box<dyn Ranker> + Send + Sync,
{
    fn build(&self) -> Box<dyn Ranker> {
        self()
    }
}

/// Uniform random ranking. Used as the initial ranker before any truth data
/// exists; seeded so runs are reproducible.
#[derive(Debug)]
pub struct RandomRanker {
    rng: ChaCha8Rng,
}

impl RandomRanker {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Ranker for RandomRanker {
    fn fit(&mut self, _known_x: &[Feature], _known_y: &[Target]) -> Result<()> {
        Ok(())
    }

    fn rank(&mut self, unknown_x: &[Feature]) -> Result<Option<Vec<usize>>> {
        let mut perm: Vec<usize> = (0..unknown_x.len()).collect();
        perm.shuffle(&mut self.rng);
        Ok(Some(perm))
    }

    fn schema(&self) -> Schema {
        Schema::indexed_float()
    }
}

/// Ranker that never updates: every `rank` call returns `None`, so the
/// pending queue keeps its current order. Lets the engine run without a
/// surrogate model attached.
#[derive(Debug, Default, Clone)]
pub struct KeepOrderRanker;

impl Ranker for KeepOrderRanker {
    fn fit(&mut self, _known_x: &[Feature], _known_y: &[Target]) -> Result<()> {
        Ok(())
    }

    fn rank(&mut self, _unknown_x: &[Feature]) -> Result<Option<Vec<usize>>> {
        Ok(None)
    }

    fn schema(&self) -> Schema {
        Schema::indexed_float()
    }
}
