//! Run specification: YAML file plus CLI overrides
//!
//! Everything a run needs lives in one YAML document; the CLI can override
//! the result file, the pool size and the truth-job quota.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which active ranker drives re-prioritisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankerChoice {
    /// Never reorder; the initial ranking stands for the whole run.
    #[default]
    Keep,
    /// Reshuffle the unknowns on every re-ranking; the random-screening
    /// baseline.
    Random,
}

impl std::fmt::Display for RankerChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankerChoice::Keep => write!(f, "keep"),
            RankerChoice::Random => write!(f, "random"),
        }
    }
}

impl std::str::FromStr for RankerChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" => Ok(RankerChoice::Keep),
            "random" => Ok(RankerChoice::Random),
            _ => Err(format!("Unknown ranker: {}", s)),
        }
    }
}

/// External calculator invocation: the command runs inside each job's
/// work directory with the candidate payload materialised next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatorSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

/// One screening run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Candidate list file, one payload path per line.
    pub candidates: PathBuf,
    /// Result sink path.
    pub output: PathBuf,
    /// Worker pool size.
    pub ncpus: usize,
    /// Truth-job quota for the run.
    pub count: u64,
    /// Dirty-count ceiling before a re-ranking is requested.
    #[serde(default)]
    pub threshold: u64,
    /// Seed for the initial random ranking.
    #[serde(default)]
    pub seed: u64,
    /// Active ranker driving re-prioritisation.
    #[serde(default)]
    pub ranker: RankerChoice,
    pub calculator: CalculatorSpec,
}

impl RunSpec {
    /// Load and parse a run spec from YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run spec: {}", path.display()))?;
        let spec: RunSpec = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse run spec: {}", path.display()))?;
        Ok(spec)
    }

    /// Apply the CLI's run-level overrides.
    pub fn apply_overrides(
        &mut self,
        output: Option<PathBuf>,
        ncpus: Option<usize>,
        count: Option<u64>,
    ) {
        if let Some(output) = output {
            self.output = output;
        }
        if let Some(ncpus) = ncpus {
            self.ncpus = ncpus;
        }
        if let Some(count) = count {
            self.count = count;
        }
    }
}
