//! Calculator contract and the subprocess-backed implementation
//!
//! The calculator is the expensive external "truth": an opaque mapping of
//! named byte-buffers goes in, one comes back. The engine never inspects
//! either side beyond the field names its schema declares.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

/// Opaque job payload: named byte-buffers, passed end-to-end between the
/// scheduler, a worker and the calculator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedOpaque(BTreeMap<String, Vec<u8>>);

impl SerializedOpaque {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: &str, value: Vec<u8>) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    /// Fetch a field and decode it as UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Field kind in a declared schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Float,
    Str,
    Bytes,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Int => write!(f, "int"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Str => write!(f, "str"),
            FieldKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// Ordered (name, kind) pairs describing a component's feature and target
/// shapes. Only consulted when wiring components together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    feature: Vec<(String, FieldKind)>,
    target: Vec<(String, FieldKind)>,
}

impl Schema {
    pub fn new(feature: Vec<(String, FieldKind)>, target: Vec<(String, FieldKind)>) -> Self {
        Self { feature, target }
    }

    #[allow(dead_code)]
    pub fn feature(&self) -> &[(String, FieldKind)] {
        &self.feature
    }

    #[allow(dead_code)]
    pub fn target(&self) -> &[(String, FieldKind)] {
        &self.target
    }

    /// Name of the first declared target field, if any. The data manager
    /// decodes calculator output through this field.
    pub fn first_target(&self) -> Option<&str> {
        self.target.first().map(|(name, _)| name.as_str())
    }

    /// Shape of the shipped surrogate store: a candidate index in, one
    /// scalar target out.
    pub fn indexed_float() -> Self {
        Self::new(
            vec![("index".to_string(), FieldKind::Int)],
            vec![("target".to_string(), FieldKind::Float)],
        )
    }
}

/// The external truth. Implementations are shared across worker threads.
pub trait Calculator: Send + Sync {
    /// Run one truth calculation. An `Err` marks the candidate as failed;
    /// the run continues.
    fn calculate(&self, params: &SerializedOpaque) -> Result<SerializedOpaque>;

    /// Declared input/output shape, consulted at wiring time.
    fn schema(&self) -> Schema;
}

/// Manifest dropped next to each job's inputs so a run directory is
/// self-describing.
#[derive(Debug, Serialize, Deserialize)]
struct JobManifest {
    command: String,
    args: Vec<String>,
    payload_file: String,
}

/// Calculator that shells out to an external simulation binary.
///
/// The candidate payload is written to `<workdir>/<subdir>/candidate.dat`,
/// the command runs with that directory as cwd, and the last whitespace
/// token of stdout is parsed as the target value.
#[derive(Debug, Clone)]
pub struct SubprocessCalculator {
    command: String,
    args: Vec<String>,
    workdir: PathBuf,
}

const PAYLOAD_FILE: &str = "candidate.dat";

impl SubprocessCalculator {
    pub fn new(command: String, args: Vec<String>, workdir: PathBuf) -> Self {
        Self {
            command,
            args,
            workdir,
        }
    }

    fn parse_stdout(stdout: &str) -> Result<f64> {
        let token = stdout
            .split_whitespace()
            .last()
            .context("calculator produced no output")?;
        token
            .parse::<f64>()
            .with_context(|| format!("calculator output is not a number: {}", token))
    }
}

impl Calculator for SubprocessCalculator {
    fn calculate(&self, params: &SerializedOpaque) -> Result<SerializedOpaque> {
        let subdir = params
            .get_str("subdir")
            .context("parameters missing 'subdir' field")?;
        let payload = params
            .get("payload")
            .context("parameters missing 'payload' field")?;

        let dir = self.workdir.join(subdir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create work directory {}", dir.display()))?;
        std::fs::write(dir.join(PAYLOAD_FILE), payload)
            .with_context(|| format!("failed to write payload in {}", dir.display()))?;

        let manifest = JobManifest {
            command: self.command.clone(),
            args: self.args.clone(),
            payload_file: PAYLOAD_FILE.to_string(),
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(dir.join("job.json"), manifest_json)?;

        let output = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&dir)
            .output()
            .with_context(|| format!("failed to spawn calculator '{}'", self.command))?;

        if !output.status.success() {
            bail!(
                "calculator '{}' exited with {} in {}",
                self.command,
                output.status,
                dir.display()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let target = Self::parse_stdout(&stdout)?;

        let mut result = SerializedOpaque::new();
        result.insert("target", target.to_string().into_bytes());
        Ok(result)
    }

    fn schema(&self) -> Schema {
        Schema::new(
            vec![
                ("payload".to_string(), FieldKind::Bytes),
                ("subdir".to_string(), FieldKind::Str),
            ],
            vec![("target".to_string(), FieldKind::Float)],
        )
    }
}
