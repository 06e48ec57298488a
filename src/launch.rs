use std::{fs, path::Path, process::Command};

use anyhow::{Context, Result};

use crate::record::{EngineResult, RunConfig};

/// Environment variable through which the engine learns where to write its
/// result artifact.
pub const RESULT_PATH_ENV: &str = "BENCH_RESULT_PATH";

/// Exporter name that stands for "no exporter at all".
const NO_EXPORTER: &str = "NoExporter";

/// The exporter argument the engine receives for `exporter`.
pub fn exporter_arg(exporter: &str) -> &str {
  if exporter == NO_EXPORTER {
    ""
  } else {
    exporter
  }
}

/// Knows how to start the benchmarked engine for one run.
pub trait Launcher: Sync {
  /// Builds the command for `config`. The engine is expected to write its
  /// result artifact to `artifact`.
  fn command(&self, config: &RunConfig, artifact: &Path) -> Result<Command>;
}

/// Launches a fixed command line, substituting run parameters into
/// `{script}`, `{version}`, `{count}`, `{exporter}`, `{processes}`,
/// `{multiprocessing}`, `{iteration}` and `{result}`.
#[derive(Debug, Clone)]
pub struct TemplateLauncher {
  program: String,
  args: Vec<String>,
}

impl TemplateLauncher {
  pub fn new(template: &[String]) -> Result<Self> {
    let (program, args) = template.split_first().context("empty command template")?;

    Ok(Self {
      program: program.clone(),
      args: args.to_vec(),
    })
  }

  fn expand(template: &str, config: &RunConfig, artifact: &Path) -> String {
    template
      .replace("{script}", &config.script)
      .replace("{version}", &config.version)
      .replace("{count}", &config.count.to_string())
      .replace("{exporter}", exporter_arg(&config.exporter))
      .replace("{processes}", &config.processes.to_string())
      .replace("{multiprocessing}", &(config.processes > 1).to_string())
      .replace("{iteration}", &config.iteration.to_string())
      .replace("{result}", &artifact.to_string_lossy())
  }
}

impl Launcher for TemplateLauncher {
  fn command(&self, config: &RunConfig, artifact: &Path) -> Result<Command> {
    let mut command = Command::new(Self::expand(&self.program, config, artifact));
    command
      .args(self.args.iter().map(|arg| Self::expand(arg, config, artifact)))
      .env(RESULT_PATH_ENV, artifact);

    Ok(command)
  }
}

/// Reads the result artifact the engine wrote for its run.
pub fn read_artifact(path: &Path) -> Result<EngineResult> {
  let json = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

  serde_json::from_str(&json).with_context(|| format!("parse {path:?}"))
}
