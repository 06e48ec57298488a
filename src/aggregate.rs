//! Reduces repeated runs into comparable metrics.
//!
//! Records are grouped by (script, version, process count) and, within a
//! group, merged per record count: every iteration contributes its own
//! throughput and peak memory, and the group point is the plain mean of those
//! per-iteration values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::RunRecord;

/// A (script, version) pair: one line on a chart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
  pub script: String,
  pub version: String,
}

/// A (script, version, process count) triple: one metric group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
  pub script: String,
  pub version: String,
  pub processes: u32,
}

impl GroupKey {
  pub fn new(script: &str, version: &str, processes: u32) -> Self {
    Self {
      script: script.to_string(),
      version: version.to_string(),
      processes,
    }
  }

  pub fn series(&self) -> SeriesKey {
    SeriesKey {
      script: self.script.clone(),
      version: self.version.clone(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
  pub x: f64,
  pub y: f64,
}

/// Averaged metrics for one record count within a group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPoint {
  pub count: u64,
  pub throughput: f64,
  pub memory_mb: f64,
  /// Iterations merged into this point.
  pub runs: usize,
}

/// Points ordered by record count, at most one per count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricGroup {
  pub points: Vec<GroupPoint>,
}

/// Running mean. Repeating one value any number of times yields exactly that
/// value.
#[derive(Debug, Clone, Copy, Default)]
struct Mean {
  value: f64,
  n: usize,
}

impl Mean {
  fn push(&mut self, value: f64) {
    self.n += 1;
    self.value += (value - self.value) / self.n as f64;
  }

  fn value(&self) -> f64 {
    self.value
  }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
  let mut acc = Mean::default();
  values.into_iter().for_each(|v| acc.push(v));

  (acc.n > 0).then(|| acc.value())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
  pub groups: BTreeMap<GroupKey, MetricGroup>,
  /// Multi-process groups only: per-worker peak memory over record count.
  pub workers: BTreeMap<GroupKey, BTreeMap<usize, Vec<Point>>>,
}

impl Aggregate {
  /// Aggregates the successful records; failed ones are skipped.
  pub fn from_records<'a>(records: impl IntoIterator<Item = &'a RunRecord>) -> Self {
    let mut groups: BTreeMap<GroupKey, BTreeMap<u64, (Mean, Mean)>> = BTreeMap::new();
    let mut workers: BTreeMap<GroupKey, BTreeMap<usize, BTreeMap<u64, Mean>>> = BTreeMap::new();

    for record in records {
      let Some(throughput) = record.throughput.filter(|_| record.success) else {
        continue;
      };

      let c = &record.config;
      let key = GroupKey::new(&c.script, &c.version, c.processes);

      let (th, mem) = groups.entry(key.clone()).or_default().entry(c.count).or_default();
      th.push(throughput);
      mem.push(record.peak_memory_mb);

      if c.processes > 1 {
        let by_worker = workers.entry(key).or_default();
        for (worker, peak) in record.worker_peaks() {
          by_worker.entry(worker).or_default().entry(c.count).or_default().push(peak);
        }
      }
    }

    let groups = groups
      .into_iter()
      .map(|(key, by_count)| {
        let points = by_count
          .into_iter()
          .map(|(count, (th, mem))| GroupPoint {
            count,
            throughput: th.value(),
            memory_mb: mem.value(),
            runs: th.n,
          })
          .collect();
        (key, MetricGroup { points })
      })
      .collect();

    let workers = workers
      .into_iter()
      .filter(|(_, by_worker)| !by_worker.is_empty())
      .map(|(key, by_worker)| {
        let by_worker = by_worker
          .into_iter()
          .map(|(worker, by_count)| {
            let points = by_count
              .into_iter()
              .map(|(count, peak)| Point {
                x: count as f64,
                y: peak.value(),
              })
              .collect();
            (worker, points)
          })
          .collect();
        (key, by_worker)
      })
      .collect();

    Self { groups, workers }
  }

  /// Throughput over process count: one series per (script, version), each
  /// point the mean of that group's per-count throughputs.
  pub fn throughput(&self) -> BTreeMap<SeriesKey, Vec<Point>> {
    let mut series: BTreeMap<SeriesKey, Vec<Point>> = BTreeMap::new();
    for (key, group) in &self.groups {
      let Some(y) = mean(group.points.iter().map(|p| p.throughput)) else {
        continue;
      };
      series.entry(key.series()).or_default().push(Point {
        x: key.processes as f64,
        y,
      });
    }

    series
  }

  /// Peak memory over record count for single-process runs.
  pub fn single_memory(&self) -> BTreeMap<SeriesKey, Vec<Point>> {
    self
      .groups
      .iter()
      .filter(|(key, group)| key.processes == 1 && !group.points.is_empty())
      .map(|(key, group)| {
        let points = group
          .points
          .iter()
          .map(|p| Point {
            x: p.count as f64,
            y: p.memory_mb,
          })
          .collect();
        (key.series(), points)
      })
      .collect()
  }

  /// All groups of one version, for the per-version rollup.
  pub fn version_groups(&self) -> BTreeMap<&str, Vec<&MetricGroup>> {
    let mut by_version: BTreeMap<&str, Vec<&MetricGroup>> = BTreeMap::new();
    for (key, group) in &self.groups {
      by_version.entry(key.version.as_str()).or_default().push(group);
    }

    by_version
  }
}
