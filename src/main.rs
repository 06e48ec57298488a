mod aggregate;
mod bench;
mod config;
mod dataset;
mod ext;
mod format;
mod interpolate;
mod launch;
mod record;
mod run;
mod sampler;
mod summary;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use log::info;

use self::{aggregate::Aggregate, bench::Bench, config::BenchConfig, launch::TemplateLauncher};

#[derive(Parser)]
#[command(name = "datagen-bench", about = "Benchmark a data generation engine and build chart datasets")]
struct Args {
  #[command(subcommand)]
  command: Command,
}

/// Overrides applied on top of the config file.
#[derive(ClapArgs, Debug)]
struct RunArgs {
  /// JSON config file; flags below override its fields.
  #[arg(long)]
  config: Option<PathBuf>,
  #[arg(short, long = "script")]
  scripts: Vec<String>,
  #[arg(short, long = "count")]
  counts: Vec<u64>,
  #[arg(short, long = "exporter")]
  exporters: Vec<String>,
  #[arg(short, long = "processes")]
  processes: Vec<u32>,
  #[arg(short = 'v', long = "engine-version")]
  versions: Vec<String>,
  #[arg(short, long)]
  iterations: Option<u32>,
  /// Configurations benchmarked at the same time.
  #[arg(short, long)]
  jobs: Option<usize>,
  #[arg(long)]
  timeout_secs: Option<u64>,
  #[arg(long)]
  interval_ms: Option<u64>,
  #[arg(long)]
  records_dir: Option<PathBuf>,
  /// Where to write the chart payload. If omitted, prints to stdout.
  #[arg(long)]
  out: Option<PathBuf>,
  /// Engine command line, e.g. `-- datamimic run {script}`.
  #[arg(last = true)]
  command: Vec<String>,
}

impl RunArgs {
  fn resolve(self) -> Result<(BenchConfig, Option<PathBuf>)> {
    let mut config = match &self.config {
      Some(path) => BenchConfig::load(path).context("load config")?,
      None => BenchConfig::default(),
    };

    fn replace<T>(target: &mut Vec<T>, values: Vec<T>) {
      if !values.is_empty() {
        *target = values;
      }
    }

    replace(&mut config.scripts, self.scripts);
    replace(&mut config.counts, self.counts);
    replace(&mut config.exporters, self.exporters);
    replace(&mut config.processes, self.processes);
    replace(&mut config.versions, self.versions);
    replace(&mut config.command, self.command);
    config.iterations = self.iterations.unwrap_or(config.iterations);
    config.jobs = self.jobs.unwrap_or(config.jobs);
    config.timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);
    config.interval_ms = self.interval_ms.unwrap_or(config.interval_ms);
    config.records_dir = self.records_dir.unwrap_or(config.records_dir);

    Ok((config, self.out))
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run every configuration, persist the records and build the payload.
  Run(RunArgs),
  /// Build the payload from previously persisted records.
  Report {
    #[arg(long, default_value = config::DEFAULT_RECORDS_DIR)]
    records_dir: PathBuf,
    /// Largest x of the smoothed throughput curves.
    #[arg(long, default_value_t = config::DEFAULT_CLIP)]
    clip: f64,
    /// Distance between samples of the smoothed curves.
    #[arg(long, default_value_t = config::DEFAULT_STEP)]
    step: f64,
    /// Where to write the chart payload. If omitted, prints to stdout.
    #[arg(long)]
    out: Option<PathBuf>,
  },
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  match Args::parse().command {
    Command::Run(args) => {
      let (config, out) = args.resolve()?;
      let domain = config.domain();
      let launcher = TemplateLauncher::new(&config.command).context("launcher")?;

      let bench = Bench::new(config, launcher).context("Bench::new")?;
      let batch = bench.bench().context("bench")?;

      // stdout may carry the payload
      eprintln!("{}", format::format(&batch).context("format")?);

      let payload = dataset::assemble(&Aggregate::from_records(batch.successful()), &domain);
      dataset::write(&payload, out.as_deref()).context("write payload")?;
    }
    Command::Report {
      records_dir,
      clip,
      step,
      out,
    } => {
      let domain = interpolate::Domain { clip, step };
      domain.validate()?;

      let records = record::load_records(&records_dir).context("load records")?;
      info!("loaded {} records from {records_dir:?}", records.len());

      let payload = dataset::assemble(&Aggregate::from_records(&records), &domain);
      dataset::write(&payload, out.as_deref()).context("write payload")?;
    }
  }

  Ok(())
}
