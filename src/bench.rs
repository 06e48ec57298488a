use std::fs;

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use tempfile::TempDir;

use crate::{
  config::BenchConfig,
  launch::Launcher,
  record::{self, RunConfig, RunFailure, RunRecord},
  run::Executor,
};

/// One point of the configuration space, before iterations are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
  pub script: String,
  pub version: String,
  pub exporter: String,
  pub count: u64,
  pub processes: u32,
}

impl Configuration {
  pub fn iteration(&self, iteration: u32) -> RunConfig {
    RunConfig {
      script: self.script.clone(),
      version: self.version.clone(),
      exporter: self.exporter.clone(),
      count: self.count,
      processes: self.processes,
      iteration,
    }
  }
}

/// Every record a batch produced, failed ones included.
#[derive(Debug, Default)]
pub struct Batch {
  pub records: Vec<RunRecord>,
}

impl Batch {
  pub fn successful(&self) -> impl Iterator<Item = &RunRecord> {
    self.records.iter().filter(|record| record.success)
  }

  pub fn failures(&self) -> impl Iterator<Item = (&RunConfig, &RunFailure)> {
    self
      .records
      .iter()
      .filter_map(|record| record.failure.as_ref().map(|failure| (&record.config, failure)))
  }
}

pub struct Bench<L> {
  config: BenchConfig,
  launcher: L,
  /// Scratch space for the engines' result artifacts.
  tempdir: TempDir,
}

impl<L: Launcher> Bench<L> {
  pub fn new(config: BenchConfig, launcher: L) -> Result<Self> {
    config.validate().context("validate config")?;
    let tempdir = TempDir::with_prefix("datagen-bench-").context("tempdir")?;

    Ok(Self {
      config,
      launcher,
      tempdir,
    })
  }

  /// The cartesian product of all configured axes, versions outermost.
  /// Repeated axis values are benchmarked once.
  pub fn plan(&self) -> Vec<Configuration> {
    let c = &self.config;
    let (scripts, counts, exporters) = (distinct(&c.scripts), distinct(&c.counts), distinct(&c.exporters));
    let processes = distinct(&c.processes);

    let mut plan = Vec::new();
    for version in &distinct(&c.versions) {
      for script in &scripts {
        for &count in &counts {
          for exporter in &exporters {
            for &processes in &processes {
              plan.push(Configuration {
                script: script.clone(),
                version: version.clone(),
                exporter: exporter.clone(),
                count,
                processes,
              });
            }
          }
        }
      }
    }

    plan
  }

  /// Runs every configuration and persists each record as soon as it exists.
  /// A failed run never stops the batch; only a failing result store does.
  pub fn bench(&self) -> Result<Batch> {
    fs::create_dir_all(&self.config.records_dir)
      .with_context(|| format!("create {:?}", self.config.records_dir))?;
    let removed = record::clear_records(&self.config.records_dir).context("clear previous records")?;
    if removed > 0 {
      info!("removed {removed} records of a previous batch from {:?}", self.config.records_dir);
    }

    let plan = self.plan();
    info!(
      "benchmarking {} configurations x {} iterations on {} jobs",
      plan.len(),
      self.config.iterations,
      self.config.jobs
    );

    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(self.config.jobs)
      .build()
      .context("thread pool")?;

    let batches = pool.install(|| {
      plan
        .par_iter()
        .map(|configuration| self.bench_configuration(configuration))
        .collect::<Result<Vec<_>>>()
    })?;

    let batch = Batch {
      records: batches.into_iter().flatten().collect(),
    };
    info!(
      "finished: {} succeeded, {} failed",
      batch.successful().count(),
      batch.failures().count()
    );

    Ok(batch)
  }

  /// Iterations of one configuration run strictly one after another.
  fn bench_configuration(&self, configuration: &Configuration) -> Result<Vec<RunRecord>> {
    let executor = Executor::new(
      &self.launcher,
      self.tempdir.path(),
      self.config.interval(),
      self.config.timeout(),
    );

    (1..=self.config.iterations)
      .map(|iteration| {
        let run = configuration.iteration(iteration);
        info!(
          "[{}] iteration {iteration} | count={}, exporter={}, processes={} for {}",
          run.version, run.count, run.exporter, run.processes, run.script
        );

        let record = executor.execute(&run);
        if let Some(failure) = &record.failure {
          warn!("{}: {failure}", run.key());
        }

        let path = record.persist(&self.config.records_dir).context("persist record")?;
        info!("{}: wrote {path:?}", run.key());

        Ok(record)
      })
      .collect()
  }
}

/// `values` without repeats, in first-seen order.
fn distinct<T: Clone + PartialEq>(values: &[T]) -> Vec<T> {
  let mut unique = Vec::with_capacity(values.len());
  for value in values {
    if !unique.contains(value) {
      unique.push(value.clone());
    }
  }

  unique
}
