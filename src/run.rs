use std::{
  fs,
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::{
  ext::{ChildExt, CommandExt, ExitStatusExt, NamedTempFileExt},
  launch::{self, Launcher},
  record::{EngineResult, FailureKind, Measurement, RunConfig, RunFailure, RunRecord, Warning, WarningKind},
  sampler::{Probe, Sampler, SysProbe, Watch},
};

/// Lines of captured stderr kept in the record of a failed run.
const STDERR_TAIL_LINES: usize = 20;

/// Runs single benchmark invocations and turns them into records.
pub struct Executor<'a, L: ?Sized> {
  launcher: &'a L,
  /// Where engines write their result artifacts.
  scratch: PathBuf,
  interval: Duration,
  timeout: Duration,
}

impl<'a, L: Launcher + ?Sized> Executor<'a, L> {
  pub fn new(launcher: &'a L, scratch: &Path, interval: Duration, timeout: Duration) -> Self {
    Self {
      launcher,
      scratch: scratch.to_path_buf(),
      interval,
      timeout,
    }
  }

  /// Runs `config` once, sampling the engine's process tree from the OS.
  pub fn execute(&self, config: &RunConfig) -> RunRecord {
    self.execute_with(config, SysProbe::new())
  }

  /// Runs `config` once. Never fails: anything that goes wrong ends up in the
  /// returned record.
  pub fn execute_with<P: Probe>(&self, config: &RunConfig, probe: P) -> RunRecord {
    let launch_failed = |err: anyhow::Error| {
      RunRecord::failed(
        config.clone(),
        RunFailure::new(FailureKind::ProcessLaunchFailure, format!("{err:#}")),
        Measurement::default(),
      )
    };

    let artifact = self.scratch.join(format!("{}.result.json", config.key()));
    let prepared = self.clear_artifact(&artifact).and_then(|()| {
      let stderr = NamedTempFile::with_suffix(".stderr")?;
      let command = self.launcher.command(config, &artifact)?;
      Ok((stderr, command))
    });
    let (stderr, mut command) = match prepared {
      Ok(prepared) => prepared,
      Err(err) => return launch_failed(err),
    };

    debug!("{}: {command:?}", config.key());

    let start = Instant::now();
    let mut child = match command.spawn_captured(&stderr) {
      Ok(child) => child,
      Err(err) => return launch_failed(err),
    };

    let track_workers = config.processes > 1;
    let watch = match Sampler::new(probe, self.interval, self.timeout, track_workers).watch(&mut child, start) {
      Ok(watch) => watch,
      Err(err) => {
        if let Err(kill_err) = child.kill_and_reap() {
          warn!("{}: could not reap engine: {kill_err:#}", config.key());
        }
        return RunRecord::failed(
          config.clone(),
          RunFailure::new(FailureKind::ProcessFailed, format!("watch: {err:#}")),
          Measurement::default(),
        );
      }
    };

    conclude(config, watch, launch::read_artifact(&artifact), || stderr.tail(STDERR_TAIL_LINES))
  }

  fn clear_artifact(&self, artifact: &Path) -> Result<()> {
    if artifact.exists() {
      fs::remove_file(artifact).with_context(|| format!("remove stale {artifact:?}"))?;
    }

    Ok(())
  }
}

/// Turns a finished watch into a record. `artifact` is what the engine left
/// behind; `stderr_tail` is only consulted when the process failed.
fn conclude(
  config: &RunConfig,
  watch: Watch,
  artifact: Result<EngineResult>,
  stderr_tail: impl FnOnce() -> String,
) -> RunRecord {
  let Watch { status, measurement } = watch;

  let Some(status) = status else {
    let failure = RunFailure::new(
      FailureKind::ProcessTimeout,
      format!("killed after {:.1}s", measurement.elapsed_secs),
    );
    return RunRecord::failed(config.clone(), failure, measurement);
  };

  if !status.success() {
    let failure = RunFailure::new(
      FailureKind::ProcessFailed,
      format!("{}\n{}", status.describe(), stderr_tail()),
    );
    return RunRecord::failed(config.clone(), failure, measurement);
  }

  let engine = match artifact {
    Ok(engine) => engine,
    Err(err) => {
      let failure = RunFailure::new(FailureKind::ResultUnreadable, format!("{err:#}"));
      return RunRecord::failed(config.clone(), failure, measurement);
    }
  };

  let mut warnings = Vec::new();
  if engine.records != config.count {
    warnings.push(Warning {
      kind: WarningKind::ResultMismatch,
      detail: format!("requested {} records, engine processed {}", config.count, engine.records),
    });
  }
  // the engine may echo back either the name or the argument it was given
  if launch::exporter_arg(&engine.exporter) != launch::exporter_arg(&config.exporter) {
    warnings.push(Warning {
      kind: WarningKind::ResultMismatch,
      detail: format!("requested exporter {:?}, engine used {:?}", config.exporter, engine.exporter),
    });
  }
  for warning in &warnings {
    warn!("{}: {}", config.key(), warning.detail);
  }

  RunRecord::completed(config.clone(), measurement, engine, warnings)
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::{
    launch::TemplateLauncher,
    record::tests::config,
    sampler::{TreeUsage, WorkerUsage},
  };

  /// Reports a fixed tree on every tick.
  struct FixedProbe(TreeUsage);

  impl Probe for FixedProbe {
    fn usage(&mut self, _root: u32) -> Option<TreeUsage> {
      Some(self.0.clone())
    }

    fn processes(&mut self, _pids: &[u32]) -> Vec<WorkerUsage> {
      Vec::new()
    }

    fn kill_descendants(&mut self, _root: u32) {}

    fn kill_trees(&mut self, _pids: &[u32]) {}
  }

  fn probe() -> FixedProbe {
    FixedProbe(TreeUsage {
      root_bytes: 8 * 1024 * 1024,
      workers: Vec::new(),
    })
  }

  /// Launches `sh -c <script>` with the artifact path in `$BENCH_RESULT_PATH`.
  fn shell(script: &str) -> TemplateLauncher {
    TemplateLauncher::new(&["sh", "-c", script].map(String::from)).unwrap()
  }

  fn executor<'a>(launcher: &'a TemplateLauncher, scratch: &Path, timeout: Duration) -> Executor<'a, TemplateLauncher> {
    Executor::new(launcher, scratch, Duration::from_millis(20), timeout)
  }

  const WRITE_RESULT: &str = r#"sleep 0.1; echo '{"records": 100, "exporter": "NoExporter"}' > "$BENCH_RESULT_PATH""#;

  #[test]
  fn successful_run() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell(WRITE_RESULT);

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert!(record.success, "{record:?}");
    assert!(record.elapsed_secs > 0.0);
    assert_eq!(record.throughput, Some(100.0 / record.elapsed_secs));
    assert_eq!(record.peak_memory_mb, 8.0);
    assert!(record.warnings.is_empty());
    assert_eq!(record.engine.unwrap().records, 100);
  }

  #[test]
  fn count_mismatch_is_only_a_warning() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell(WRITE_RESULT);

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 250, 1, 1), probe());

    assert!(record.success);
    assert_eq!(record.warnings.len(), 1);
    assert_eq!(record.warnings[0].kind, WarningKind::ResultMismatch);
    assert_eq!(record.throughput, Some(250.0 / record.elapsed_secs));
  }

  #[test]
  fn exporter_mismatch_is_only_a_warning() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell(r#"echo '{"records": 100, "exporter": "CSV"}' > "$BENCH_RESULT_PATH""#);

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert!(record.success);
    assert_eq!(record.warnings.len(), 1);
    assert_eq!(record.warnings[0].kind, WarningKind::ResultMismatch);
    assert!(record.warnings[0].detail.contains("CSV"));
  }

  #[test]
  fn empty_exporter_matches_no_exporter() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell(r#"echo '{"records": 100, "exporter": ""}' > "$BENCH_RESULT_PATH""#);

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert!(record.success);
    assert!(record.warnings.is_empty(), "{:?}", record.warnings);
  }

  #[test]
  fn non_zero_exit_keeps_stderr_tail() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell("echo boom >&2; exit 3");

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    let failure = record.failure.unwrap();
    assert!(!record.success);
    assert_eq!(record.throughput, None);
    assert_eq!(failure.kind, FailureKind::ProcessFailed);
    assert!(failure.detail.contains("exit code 3"));
    assert!(failure.detail.contains("boom"));
  }

  #[test]
  fn missing_artifact_is_unreadable() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell("true");

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert_eq!(record.failure.unwrap().kind, FailureKind::ResultUnreadable);
  }

  #[test]
  fn malformed_artifact_is_unreadable() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell(r#"echo 'not json' > "$BENCH_RESULT_PATH""#);

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert_eq!(record.failure.unwrap().kind, FailureKind::ResultUnreadable);
  }

  #[test]
  fn unknown_program_fails_to_launch() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = TemplateLauncher::new(&["/nonexistent/engine".to_string()]).unwrap();

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert_eq!(record.failure.unwrap().kind, FailureKind::ProcessLaunchFailure);
    assert!(record.memory.is_empty());
  }

  #[test]
  fn timeout_is_recorded_with_partial_series() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell("sleep 30");

    let record = executor(&launcher, scratch.path(), Duration::from_millis(200))
      .execute_with(&config("a.xml", "1.0", 100, 1, 1), probe());

    assert!(!record.success);
    assert!(record.incomplete);
    assert!(!record.memory.is_empty());
    assert_eq!(record.throughput, None);
    assert_eq!(record.failure.unwrap().kind, FailureKind::ProcessTimeout);
  }

  #[test]
  fn multi_process_run_keeps_worker_series_apart() {
    let scratch = tempfile::tempdir().unwrap();
    let launcher = shell(WRITE_RESULT);
    let workers = (0..4)
      .map(|i| WorkerUsage {
        pid: 1000 + i,
        start_time: 0,
        bytes: (i as u64 + 1) * 1024 * 1024,
      })
      .collect();
    let probe = FixedProbe(TreeUsage {
      root_bytes: 1024 * 1024,
      workers,
    });

    let record = executor(&launcher, scratch.path(), Duration::from_secs(10))
      .execute_with(&config("a.xml", "1.0", 100, 4, 1), probe);

    assert!(record.success);
    assert_eq!(record.workers.len(), 4);
    assert_eq!(
      record.worker_peaks().into_values().collect::<Vec<_>>(),
      vec![1.0, 2.0, 3.0, 4.0]
    );
    assert_eq!(record.peak_memory_mb, 11.0);
  }
}
