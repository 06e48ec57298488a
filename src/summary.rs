use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

/// Per-version rollup across every script and process count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
  pub avg_throughput: f64,
  pub avg_memory: f64,
  /// Distinct (script, process count, record count) observations.
  pub test_count: usize,
  /// Successful runs behind those observations.
  pub run_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionThroughput {
  pub version: String,
  pub throughput: f64,
}

/// Versions without a single observation are left out.
pub fn summarize(aggregate: &Aggregate) -> BTreeMap<String, VersionSummary> {
  aggregate
    .version_groups()
    .into_iter()
    .filter_map(|(version, groups)| {
      let points = groups.iter().flat_map(|group| &group.points).collect::<Vec<_>>();
      if points.is_empty() {
        return None;
      }

      let n = points.len() as f64;
      let summary = VersionSummary {
        avg_throughput: points.iter().map(|p| p.throughput).sum::<f64>() / n,
        avg_memory: points.iter().map(|p| p.memory_mb).sum::<f64>() / n,
        test_count: points.len(),
        run_count: points.iter().map(|p| p.runs).sum(),
      };

      Some((version.to_string(), summary))
    })
    .collect()
}

/// One entry per version, ordered by version string.
pub fn overall_throughput(summary: &BTreeMap<String, VersionSummary>) -> Vec<VersionThroughput> {
  summary
    .iter()
    .map(|(version, s)| VersionThroughput {
      version: version.clone(),
      throughput: s.avg_throughput,
    })
    .collect()
}
