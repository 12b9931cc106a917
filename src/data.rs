//! Data manager: candidate catalogue, surrogate store, result sink
//!
//! Owns the state machine and everything keyed by candidate index. The
//! scheduler talks to candidates exclusively through this module.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::calculator::{Schema, SerializedOpaque};
use crate::error::{EngineError, Index};
use crate::state::CandidateStates;

/// Feature as seen by the surrogate: the candidate's dense index. The real
/// descriptors live inside whatever model the ranker wraps.
pub type Feature = u64;

/// Scalar truth result.
pub type Target = f64;

/// The candidate catalogue: one payload file per candidate, loaded from a
/// plain-text list, one path per line.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    files: Vec<PathBuf>,
}

impl FileCatalog {
    /// Read a candidate list. Blank lines are rejected, and every listed
    /// path must exist; either problem is fatal for the run.
    pub fn from_list_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read candidate list: {}", path.display()))?;

        let mut files = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                return Err(EngineError::BlankCandidateLine(line_no + 1).into());
            }
            let p = PathBuf::from(line);
            if !p.exists() {
                return Err(EngineError::MissingCandidateFile(p).into());
            }
            files.push(p);
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn path(&self, index: Index) -> Option<&Path> {
        self.files.get(index).map(|p| p.as_path())
    }
}

/// Known/unknown feature store with one scalar target slot per candidate.
/// Features are the candidate indices themselves.
#[derive(Debug, Clone)]
pub struct SurrogateStore {
    features: Vec<Feature>,
    targets: Vec<Target>,
}

impl SurrogateStore {
    pub fn from_size(size: usize) -> Self {
        Self {
            features: (0..size as Feature).collect(),
            targets: vec![Target::NAN; size],
        }
    }

    /// (features, targets) of every successfully completed candidate.
    pub fn known(&self, states: &CandidateStates) -> (Vec<Feature>, Vec<Target>) {
        let done = states.list_done(false);
        let xs = self
            .features
            .iter()
            .zip(&done)
            .filter(|(_, &d)| d)
            .map(|(&x, _)| x)
            .collect();
        let ys = self
            .targets
            .iter()
            .zip(&done)
            .filter(|(_, &d)| d)
            .map(|(&y, _)| y)
            .collect();
        (xs, ys)
    }

    /// Features of every candidate still eligible for selection.
    pub fn unknown(&self, states: &CandidateStates) -> Vec<Feature> {
        let available = states.list_available();
        self.features
            .iter()
            .zip(&available)
            .filter(|(_, &a)| a)
            .map(|(&x, _)| x)
            .collect()
    }

    /// Store a target; absent values leave the slot untouched.
    pub fn set_target(&mut self, index: Index, value: Option<Target>) {
        if let Some(v) = value {
            self.targets[index] = v;
        }
    }

    pub fn schema(&self) -> Schema {
        Schema::indexed_float()
    }
}

/// Result sink header; the line format below it is stable.
const SINK_HEADER: &str = "#AMI0.0.1";

/// Append-only result file. One line per reported candidate, flushed per
/// record so a killed run loses nothing already reported.
#[derive(Debug)]
pub struct ResultSink {
    writer: BufWriter<File>,
}

impl ResultSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create result sink: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", SINK_HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn append_valid(&mut self, index: Index, value: Target) -> Result<()> {
        writeln!(self.writer, "{},{}", index, value)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn append_invalid(&mut self, index: Index) -> Result<()> {
        writeln!(self.writer, "#{},", index)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Owns the catalogue, the tri-state machine, the surrogate store and the
/// sink. All mutation of candidate state funnels through here.
#[derive(Debug)]
pub struct DataManager {
    states: CandidateStates,
    store: SurrogateStore,
    catalog: FileCatalog,
    sink: ResultSink,
    truth_schema: Schema,
}

impl DataManager {
    /// Assemble a data manager for the catalogue listed in `list_path`,
    /// writing results to `sink_path`. `truth_schema` is the calculator's
    /// declared shape; its first target field names the result to decode.
    pub fn from_catalog_file(list_path: &Path, truth_schema: Schema, sink_path: &Path) -> Result<Self> {
        let catalog = FileCatalog::from_list_file(list_path)?;
        let sink = ResultSink::create(sink_path)?;
        Ok(Self::new(catalog, truth_schema, sink))
    }

    pub fn new(catalog: FileCatalog, truth_schema: Schema, sink: ResultSink) -> Self {
        let size = catalog.len();
        Self {
            states: CandidateStates::from_size(size),
            store: SurrogateStore::from_size(size),
            catalog,
            sink,
            truth_schema,
        }
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn surrogate_schema(&self) -> Schema {
        self.store.schema()
    }

    pub fn truth_schema(&self) -> &Schema {
        &self.truth_schema
    }

    /// Whether `index` is still eligible for selection.
    pub fn is_available(&self, index: Index) -> bool {
        self.states.is_available(index)
    }

    /// Dense list of indices still eligible for selection.
    pub fn available_for_calculation(&self) -> Vec<Index> {
        self.states
            .list_available()
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn known(&self) -> (Vec<Feature>, Vec<Target>) {
        self.store.known(&self.states)
    }

    pub fn unknown(&self) -> Vec<Feature> {
        self.store.unknown(&self.states)
    }

    /// Truth-job parameters for one candidate. Selecting and fetching are
    /// one operation: a candidate whose parameters were handed out is in
    /// flight from that moment.
    pub fn parameters(&mut self, index: Index) -> Result<Option<SerializedOpaque>> {
        if index >= self.catalog.len() {
            return Ok(None);
        }
        self.states.select(index)?;
        // path(index) cannot miss once the bound check passed
        let path = self
            .catalog
            .path(index)
            .ok_or(EngineError::MissingParameters(index))?;
        let payload = std::fs::read(path)
            .with_context(|| format!("failed to read candidate file: {}", path.display()))?;

        let mut params = SerializedOpaque::new();
        params.insert("payload", payload);
        params.insert("subdir", index.to_string().into_bytes());
        Ok(Some(params))
    }

    /// Record a truth result. `Some` output is decoded through the truth
    /// schema and persisted as a valid record; `None` (the job failed)
    /// becomes a failure record. An output the schema cannot decode came
    /// from external software, so it is recorded as a failure rather than
    /// aborting the run.
    pub fn set_result(&mut self, index: Index, value: Option<&SerializedOpaque>) -> Result<()> {
        let target = value.and_then(|opaque| self.decode_target(index, opaque));
        self.store.set_target(index, target);
        match target {
            Some(t) => {
                self.states.set(index, true)?;
                self.sink.append_valid(index, t)?;
            }
            None => {
                self.states.set(index, false)?;
                self.sink.append_invalid(index)?;
            }
        }
        Ok(())
    }

    fn decode_target(&self, index: Index, opaque: &SerializedOpaque) -> Option<Target> {
        let field = self.truth_schema.first_target()?;
        match opaque.get_str(field).map(str::parse::<Target>) {
            Some(Ok(t)) => Some(t),
            Some(Err(_)) | None => {
                warn!(index, field, "calculator output had no decodable target");
                None
            }
        }
    }
}

/// Test fixture: a catalogue of `n` small payload files plus its list file.
#[cfg(test)]
pub(crate) fn write_catalog(dir: &Path, n: usize) -> PathBuf {
    let list = dir.join("candidates.txt");
    let mut list_fd = File::create(&list).unwrap();
    for i in 0..n {
        let p = dir.join(format!("cand_{}.dat", i));
        std::fs::write(&p, format!("{}", i)).unwrap();
        writeln!(list_fd, "{}", p.display()).unwrap();
    }
    list
}
