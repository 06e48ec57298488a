use std::fmt::Write;

use anyhow::Result;

use crate::{bench::Batch, record::RunRecord};

const COLUMN_WIDTH: usize = 14;
const COLUMN_PADDING: &str = "  ";
const COLUMNS: [&str; 8] = ["script", "version", "exporter", "count", "processes", "iteration", "status", "detail"];

fn format_row<'a, I: IntoIterator<Item = &'a str>>(cols: I) -> String {
  cols
    .into_iter()
    .map(|col| format!("{col:<COLUMN_WIDTH$}"))
    .collect::<Vec<_>>()
    .join(COLUMN_PADDING)
    .trim_end()
    .to_string()
}

fn format_header() -> String {
  let header = format_row(COLUMNS);

  format!("{header}\n{}", "=".repeat(header.len()))
}

fn status(record: &RunRecord) -> (String, String) {
  match &record.failure {
    Some(failure) => {
      let first_line = failure.detail.lines().next().unwrap_or_default();
      (format!("{:?}", failure.kind), first_line.to_string())
    }
    None => {
      let throughput = record.throughput.map(|t| format!("{t:.1}/s")).unwrap_or_default();
      let status = if record.warnings.is_empty() { "ok" } else { "ok (warned)" };
      (status.to_string(), throughput)
    }
  }
}

/// Renders the per-run table and the final tally of a batch.
pub fn format(batch: &Batch) -> Result<String> {
  let mut table = String::new();

  writeln!(table, "{}", format_header())?;
  for record in &batch.records {
    let c = &record.config;
    let (status, detail) = status(record);
    let count = c.count.to_string();
    let processes = c.processes.to_string();
    let iteration = c.iteration.to_string();

    let row = format_row([
      c.script.as_str(),
      c.version.as_str(),
      c.exporter.as_str(),
      count.as_str(),
      processes.as_str(),
      iteration.as_str(),
      status.as_str(),
      detail.as_str(),
    ]);
    writeln!(table, "{row}")?;
  }

  writeln!(table)?;
  writeln!(
    table,
    "succeeded: {}, failed: {}",
    batch.successful().count(),
    batch.failures().count()
  )?;

  Ok(table)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{
    tests::{config, measurement, record},
    FailureKind, RunFailure,
  };

  #[test]
  fn table_lists_runs_and_tally() {
    let batch = Batch {
      records: vec![
        record("a.xml", "1.0", 100, 1, 1, 2.0, 1.0),
        RunRecord::failed(
          config("a.xml", "1.0", 100, 1, 2),
          RunFailure::new(FailureKind::ProcessFailed, "exit code 1\ntraceback"),
          measurement(1.0, &[1.0]),
        ),
      ],
    };

    let table = format(&batch).unwrap();
    let lines = table.lines().collect::<Vec<_>>();

    assert!(lines[0].starts_with("script"));
    assert!(lines[1].chars().all(|c| c == '='));
    assert!(lines[2].contains("50.0/s"));
    assert!(lines[3].contains("ProcessFailed"));
    assert!(lines[3].ends_with("exit code 1"));
    assert_eq!(lines.last(), Some(&"succeeded: 1, failed: 1"));
  }
}
