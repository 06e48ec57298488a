use std::{
  collections::BTreeMap,
  fs::{self, OpenOptions},
  io::Write,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn bytes_to_mb(bytes: u64) -> f64 {
  bytes as f64 / BYTES_PER_MB
}

/// One fully resolved benchmark invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
  pub script: String,
  pub version: String,
  pub exporter: String,
  pub count: u64,
  pub processes: u32,
  pub iteration: u32,
}

impl RunConfig {
  /// Stable file-name-safe identity of this run.
  pub fn key(&self) -> String {
    format!(
      "{}__{}__{}__c{}__p{}__i{}",
      sanitize(&self.script),
      sanitize(&self.version),
      sanitize(&self.exporter),
      self.count,
      self.processes,
      self.iteration,
    )
  }
}

pub(crate) fn sanitize(part: &str) -> String {
  part
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') { c } else { '_' })
    .collect()
}

/// A single memory reading, `t` seconds after launch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
  pub t: f64,
  pub mb: f64,
}

/// What the benchmarked engine reports about its own run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
  pub records: u64,
  pub exporter: String,
  #[serde(default)]
  pub elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
  ProcessLaunchFailure,
  ProcessTimeout,
  ProcessFailed,
  ResultUnreadable,
  SamplingGap,
  InvalidMeasurement,
}

/// Why a run could not produce usable measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct RunFailure {
  pub kind: FailureKind,
  pub detail: String,
}

impl RunFailure {
  pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
    Self {
      kind,
      detail: detail.into(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
  ResultMismatch,
  SamplingGap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
  pub kind: WarningKind,
  pub detail: String,
}

/// Raw measurements collected while a run was being watched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
  pub elapsed_secs: f64,
  pub memory: Vec<Sample>,
  /// Per-worker series keyed by spawn order. Empty for single-process runs.
  pub workers: BTreeMap<usize, Vec<Sample>>,
  pub gaps: usize,
  pub incomplete: bool,
}

/// The immutable result of one benchmark invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
  pub config: RunConfig,
  pub success: bool,
  pub elapsed_secs: f64,
  pub throughput: Option<f64>,
  pub peak_memory_mb: f64,
  pub avg_memory_mb: f64,
  pub memory: Vec<Sample>,
  #[serde(default)]
  pub workers: BTreeMap<usize, Vec<Sample>>,
  pub incomplete: bool,
  pub sampling_gaps: usize,
  pub engine: Option<EngineResult>,
  #[serde(default)]
  pub warnings: Vec<Warning>,
  pub failure: Option<RunFailure>,
}

impl RunRecord {
  /// Builds the record of a run that exited cleanly. Throughput is derived
  /// here and nowhere else; a measurement that cannot carry it yields a failed
  /// record instead.
  pub fn completed(
    config: RunConfig,
    measurement: Measurement,
    engine: EngineResult,
    mut warnings: Vec<Warning>,
  ) -> Self {
    if !(measurement.elapsed_secs > 0.0) {
      let failure = RunFailure::new(
        FailureKind::InvalidMeasurement,
        format!("elapsed time {}s is not positive", measurement.elapsed_secs),
      );
      return Self::failed(config, failure, measurement);
    }

    if measurement.memory.is_empty() {
      let failure = RunFailure::new(FailureKind::SamplingGap, "no memory samples were collected");
      return Self::failed(config, failure, measurement);
    }

    if measurement.gaps > 0 {
      warnings.push(Warning {
        kind: WarningKind::SamplingGap,
        detail: format!("{} poll ticks produced no sample", measurement.gaps),
      });
    }

    let throughput = config.count as f64 / measurement.elapsed_secs;
    let mut record = Self::from_measurement(config, measurement);
    record.success = true;
    record.throughput = Some(throughput);
    record.engine = Some(engine);
    record.warnings = warnings;

    record
  }

  /// Builds a failed record, keeping whatever partial series was collected.
  pub fn failed(config: RunConfig, failure: RunFailure, measurement: Measurement) -> Self {
    let mut record = Self::from_measurement(config, measurement);
    record.failure = Some(failure);

    record
  }

  fn from_measurement(config: RunConfig, measurement: Measurement) -> Self {
    let peak_memory_mb = measurement.memory.iter().map(|s| s.mb).fold(0.0, f64::max);
    let avg_memory_mb = if measurement.memory.is_empty() {
      0.0
    } else {
      measurement.memory.iter().map(|s| s.mb).sum::<f64>() / measurement.memory.len() as f64
    };

    Self {
      config,
      success: false,
      elapsed_secs: measurement.elapsed_secs,
      throughput: None,
      peak_memory_mb,
      avg_memory_mb,
      memory: measurement.memory,
      workers: measurement.workers,
      incomplete: measurement.incomplete,
      sampling_gaps: measurement.gaps,
      engine: None,
      warnings: Vec::new(),
      failure: None,
    }
  }

  /// Peak resident memory of each worker, in MB.
  pub fn worker_peaks(&self) -> BTreeMap<usize, f64> {
    self
      .workers
      .iter()
      .filter(|(_, series)| !series.is_empty())
      .map(|(&worker, series)| (worker, series.iter().map(|s| s.mb).fold(0.0, f64::max)))
      .collect()
  }

  /// Writes this record as a new file under `dir`. Never overwrites.
  pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(format!("{}.json", self.config.key()));
    let json = serde_json::to_string_pretty(self).context("serialize")?;

    let mut file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&path)
      .with_context(|| format!("create {path:?}"))?;
    file.write_all(json.as_bytes()).with_context(|| format!("write {path:?}"))?;

    Ok(path)
  }
}

/// Removes the records a previous batch left under `dir`, so every file name
/// of the coming batch is free. Returns how many were removed.
pub fn clear_records(dir: &Path) -> Result<usize> {
  let mut removed = 0;
  for entry in fs::read_dir(dir).with_context(|| format!("read dir {dir:?}"))? {
    let path = entry?.path();
    if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
      fs::remove_file(&path).with_context(|| format!("remove {path:?}"))?;
      removed += 1;
    }
  }

  Ok(removed)
}

/// Reads every persisted record under `dir`, ordered by file name.
pub fn load_records(dir: &Path) -> Result<Vec<RunRecord>> {
  let mut paths = fs::read_dir(dir)
    .with_context(|| format!("read dir {dir:?}"))?
    .map(|entry| Ok(entry?.path()))
    .collect::<Result<Vec<PathBuf>>>()?;
  paths.retain(|path| path.extension().is_some_and(|ext| ext == "json"));
  paths.sort();

  paths
    .iter()
    .map(|path| {
      let json = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
      serde_json::from_str(&json).with_context(|| format!("parse {path:?}"))
    })
    .collect()
}
