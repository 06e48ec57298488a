//! Chart-ready payload consumed by the report renderer.
//!
//! Every dataset label starts with `script - version`, so the renderer can
//! recover the grouping with [`split_label`] instead of re-reading records.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
  aggregate::{Aggregate, Point, SeriesKey},
  interpolate::{interpolate, Domain},
  summary::{self, VersionSummary, VersionThroughput},
};

pub const LABEL_DELIMITER: &str = " - ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
  Scatter,
  Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDataset {
  pub label: String,
  pub data: Vec<Point>,
  #[serde(rename = "type")]
  pub kind: ChartKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
  pub raw_throughput_datasets: Vec<ChartDataset>,
  pub smooth_throughput_datasets: Vec<ChartDataset>,
  pub raw_single_memory_datasets: Vec<ChartDataset>,
  /// Keyed by version, then process count.
  pub raw_multi_memory_datasets: BTreeMap<String, BTreeMap<u32, Vec<ChartDataset>>>,
  pub version_summary: BTreeMap<String, VersionSummary>,
  pub overall_throughput: Vec<VersionThroughput>,
}

pub fn label(script: &str, version: &str) -> String {
  format!("{script}{LABEL_DELIMITER}{version}")
}

/// Recovers `(script, version)` from a dataset label.
pub fn split_label(label: &str) -> Option<(&str, &str)> {
  let mut parts = label.splitn(3, LABEL_DELIMITER);

  Some((parts.next()?, parts.next()?))
}

fn datasets(series: BTreeMap<SeriesKey, Vec<Point>>, kind: ChartKind) -> Vec<ChartDataset> {
  series
    .into_iter()
    .filter(|(_, data)| !data.is_empty())
    .map(|(key, data)| ChartDataset {
      label: label(&key.script, &key.version),
      data,
      kind,
    })
    .collect()
}

pub fn assemble(aggregate: &Aggregate, domain: &Domain) -> Payload {
  let throughput = aggregate.throughput();
  let smooth: BTreeMap<_, _> = throughput
    .iter()
    .map(|(key, points)| (key.clone(), interpolate(points, domain)))
    .collect();

  let mut multi: BTreeMap<String, BTreeMap<u32, Vec<ChartDataset>>> = BTreeMap::new();
  for (key, workers) in &aggregate.workers {
    let sets = multi
      .entry(key.version.clone())
      .or_default()
      .entry(key.processes)
      .or_default();
    for (worker, data) in workers.iter().filter(|(_, data)| !data.is_empty()) {
      sets.push(ChartDataset {
        label: format!("{}{LABEL_DELIMITER}worker {worker}", label(&key.script, &key.version)),
        data: data.clone(),
        kind: ChartKind::Line,
      });
    }
  }

  let version_summary = summary::summarize(aggregate);
  let overall_throughput = summary::overall_throughput(&version_summary);

  Payload {
    raw_throughput_datasets: datasets(throughput, ChartKind::Scatter),
    smooth_throughput_datasets: datasets(smooth, ChartKind::Line),
    raw_single_memory_datasets: datasets(aggregate.single_memory(), ChartKind::Line),
    raw_multi_memory_datasets: multi,
    version_summary,
    overall_throughput,
  }
}

/// Writes the payload as JSON to `out`, or to stdout when `out` is `None`.
pub fn write(payload: &Payload, out: Option<&Path>) -> Result<()> {
  let json = serde_json::to_string_pretty(payload).context("serialize payload")?;

  match out {
    Some(path) => fs::write(path, json).with_context(|| format!("write {path:?}"))?,
    None => println!("{json}"),
  }

  Ok(())
}
