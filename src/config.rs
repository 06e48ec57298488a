use std::{
  collections::HashMap,
  fs,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
  dataset::{label, split_label},
  interpolate::Domain,
  record::sanitize,
};

pub const DEFAULT_COUNTS: [u64; 2] = [10_000, 100_000];
pub const DEFAULT_EXPORTER: &str = "NoExporter";
pub const DEFAULT_PROCESSES: [u32; 2] = [1, 4];
pub const DEFAULT_VERSION: &str = "current";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_INTERVAL_MS: u64 = 50;
pub const DEFAULT_CLIP: f64 = 20.0;
pub const DEFAULT_STEP: f64 = 1.0;
pub const DEFAULT_RECORDS_DIR: &str = "./results";

/// Everything a benchmark batch needs to know, with named defaults for each
/// axis of the configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
  pub scripts: Vec<String>,
  pub counts: Vec<u64>,
  pub exporters: Vec<String>,
  pub processes: Vec<u32>,
  pub versions: Vec<String>,
  pub iterations: u32,
  /// Configurations benchmarked at the same time.
  pub jobs: usize,
  pub timeout_secs: u64,
  pub interval_ms: u64,
  pub clip: f64,
  pub step: f64,
  pub records_dir: PathBuf,
  /// Engine command line; see `TemplateLauncher` for the placeholders.
  pub command: Vec<String>,
}

impl Default for BenchConfig {
  fn default() -> Self {
    Self {
      scripts: Vec::new(),
      counts: DEFAULT_COUNTS.to_vec(),
      exporters: vec![DEFAULT_EXPORTER.to_string()],
      processes: DEFAULT_PROCESSES.to_vec(),
      versions: vec![DEFAULT_VERSION.to_string()],
      iterations: 1,
      jobs: 1,
      timeout_secs: DEFAULT_TIMEOUT_SECS,
      interval_ms: DEFAULT_INTERVAL_MS,
      clip: DEFAULT_CLIP,
      step: DEFAULT_STEP,
      records_dir: PathBuf::from(DEFAULT_RECORDS_DIR),
      command: ["datamimic", "run", "{script}"].map(String::from).to_vec(),
    }
  }
}

impl BenchConfig {
  /// Reads a JSON config file. Missing fields keep their defaults.
  pub fn load(path: &Path) -> Result<Self> {
    let json = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

    serde_json::from_str(&json).with_context(|| format!("parse {path:?}"))
  }

  pub fn validate(&self) -> Result<()> {
    for (axis, empty) in [
      ("scripts", self.scripts.is_empty()),
      ("counts", self.counts.is_empty()),
      ("exporters", self.exporters.is_empty()),
      ("processes", self.processes.is_empty()),
      ("versions", self.versions.is_empty()),
      ("command", self.command.is_empty()),
    ] {
      if empty {
        anyhow::bail!("no {axis} configured");
      }
    }

    for (axis, values) in [
      ("scripts", &self.scripts),
      ("versions", &self.versions),
      ("exporters", &self.exporters),
    ] {
      let mut seen: HashMap<String, &str> = HashMap::new();
      for value in values {
        match seen.insert(sanitize(value), value) {
          Some(other) if other != value.as_str() => {
            anyhow::bail!("{axis} {other:?} and {value:?} would share record files")
          }
          _ => {}
        }
      }
    }
    for script in &self.scripts {
      for version in &self.versions {
        if split_label(&label(script, version)) != Some((script.as_str(), version.as_str())) {
          anyhow::bail!("script {script:?} and version {version:?} cannot be told apart in chart labels");
        }
      }
    }

    if self.processes.contains(&0) {
      anyhow::bail!("process counts must be at least 1");
    }
    if self.iterations == 0 {
      anyhow::bail!("iterations must be at least 1");
    }
    if self.jobs == 0 {
      anyhow::bail!("jobs must be at least 1");
    }
    if self.interval_ms == 0 {
      anyhow::bail!("sample interval must be positive");
    }
    self.domain().validate()?;

    Ok(())
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms)
  }

  pub fn domain(&self) -> Domain {
    Domain {
      clip: self.clip,
      step: self.step,
    }
  }
}
