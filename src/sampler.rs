use std::{
  collections::HashMap,
  process::{Child, ExitStatus},
  thread,
  time::{Duration, Instant},
};

use anyhow::Result;
use log::{debug, warn};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use crate::{
  ext::ChildExt,
  record::{bytes_to_mb, Measurement, Sample},
};

/// Resident memory of a watched process tree at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeUsage {
  /// Memory of the root process itself.
  pub root_bytes: u64,
  /// Direct children of the root, each with the memory of its whole subtree.
  pub workers: Vec<WorkerUsage>,
}

impl TreeUsage {
  pub fn total_bytes(&self) -> u64 {
    self.root_bytes + self.workers.iter().map(|w| w.bytes).sum::<u64>()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerUsage {
  pub pid: u32,
  pub start_time: u64,
  pub bytes: u64,
}

/// Source of process-tree memory readings.
pub trait Probe {
  /// Reads the tree rooted at `root`. `None` means the root could not be
  /// observed on this tick.
  fn usage(&mut self, root: u32) -> Option<TreeUsage>;

  /// Reads those of `pids` that are still alive, each with its whole subtree.
  fn processes(&mut self, pids: &[u32]) -> Vec<WorkerUsage>;

  /// Kills every descendant of `root`. The root itself is left to the caller.
  fn kill_descendants(&mut self, root: u32);

  /// Kills each of `pids` together with its descendants.
  fn kill_trees(&mut self, pids: &[u32]);
}

/// `Probe` backed by the operating system's process table.
#[derive(Default)]
pub struct SysProbe {
  system: System,
}

impl SysProbe {
  pub fn new() -> Self {
    Self::default()
  }

  fn children(&self) -> HashMap<Pid, Vec<Pid>> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (&pid, process) in self.system.processes() {
      // threads show up as processes on linux
      if process.thread_kind().is_some() || process.status() == ProcessStatus::Zombie {
        continue;
      }
      if let Some(parent) = process.parent() {
        children.entry(parent).or_default().push(pid);
      }
    }

    children
  }

  fn subtree(children: &HashMap<Pid, Vec<Pid>>, root: Pid) -> Vec<Pid> {
    let mut tree = vec![root];
    let mut i = 0;
    while i < tree.len() {
      if let Some(kids) = children.get(&tree[i]) {
        tree.extend(kids.iter().copied());
      }
      i += 1;
    }

    tree
  }

  /// Kills `tree`, deepest processes first, so nothing gets re-parented out of
  /// reach.
  fn kill(&self, tree: &[Pid]) {
    for pid in tree.iter().rev() {
      if let Some(process) = self.system.process(*pid) {
        process.kill();
      }
    }
  }

  fn memory(&self, pids: &[Pid]) -> u64 {
    pids
      .iter()
      .filter_map(|pid| self.system.process(*pid))
      .map(|process| process.memory())
      .sum()
  }
}

impl Probe for SysProbe {
  fn usage(&mut self, root: u32) -> Option<TreeUsage> {
    self.system.refresh_processes(ProcessesToUpdate::All, true);

    let root = Pid::from_u32(root);
    let root_bytes = self.system.process(root)?.memory();
    let children = self.children();

    let workers = children
      .get(&root)
      .into_iter()
      .flatten()
      .filter_map(|&pid| {
        // a worker may exit between the refresh and this lookup
        let process = self.system.process(pid)?;
        Some(WorkerUsage {
          pid: pid.as_u32(),
          start_time: process.start_time(),
          bytes: self.memory(&Self::subtree(&children, pid)),
        })
      })
      .collect();

    Some(TreeUsage { root_bytes, workers })
  }

  fn kill_descendants(&mut self, root: u32) {
    self.system.refresh_processes(ProcessesToUpdate::All, true);

    let children = self.children();
    let tree = Self::subtree(&children, Pid::from_u32(root));
    self.kill(&tree[1..]);
  }

  fn processes(&mut self, pids: &[u32]) -> Vec<WorkerUsage> {
    self.system.refresh_processes(ProcessesToUpdate::All, true);

    let children = self.children();
    pids
      .iter()
      .filter_map(|&pid| {
        let process = self.system.process(Pid::from_u32(pid))?;
        if process.status() == ProcessStatus::Zombie {
          return None;
        }
        Some(WorkerUsage {
          pid,
          start_time: process.start_time(),
          bytes: self.memory(&Self::subtree(&children, Pid::from_u32(pid))),
        })
      })
      .collect()
  }

  fn kill_trees(&mut self, pids: &[u32]) {
    self.system.refresh_processes(ProcessesToUpdate::All, true);

    let children = self.children();
    for &pid in pids {
      self.kill(&Self::subtree(&children, Pid::from_u32(pid)));
    }
  }
}

/// How a watched process ended.
#[derive(Debug)]
pub struct Watch {
  /// `None` when the process was killed for exceeding the timeout.
  pub status: Option<ExitStatus>,
  pub measurement: Measurement,
}

/// Polls a running process tree at a fixed interval until it exits or the
/// timeout elapses. When tracking workers, workers that outlive the root are
/// followed until they exit too.
pub struct Sampler<P> {
  probe: P,
  interval: Duration,
  timeout: Duration,
  track_workers: bool,
}

impl<P: Probe> Sampler<P> {
  pub fn new(probe: P, interval: Duration, timeout: Duration, track_workers: bool) -> Self {
    Self {
      probe,
      interval,
      timeout,
      track_workers,
    }
  }

  /// Watches `child`, which was launched at `start`. On timeout the whole tree
  /// is killed and reaped before returning the partial series.
  pub fn watch(&mut self, child: &mut Child, start: Instant) -> Result<Watch> {
    let root = child.id();
    let mut measurement = Measurement::default();
    // keyed by (pid, start time), so a recycled pid is never mistaken for a worker
    let mut worker_index: HashMap<(u32, u64), usize> = HashMap::new();

    let status = loop {
      self.tick(root, start, &mut measurement, &mut worker_index);

      let remaining = self.timeout.saturating_sub(start.elapsed());
      if let Some(status) = child.wait_at_most(self.interval.min(remaining))? {
        let finished = !self.track_workers || self.follow_survivors(start, &mut measurement, &worker_index);
        measurement.elapsed_secs = start.elapsed().as_secs_f64();
        if !finished {
          measurement.incomplete = true;
          break None;
        }
        break Some(status);
      }

      if start.elapsed() >= self.timeout {
        measurement.elapsed_secs = start.elapsed().as_secs_f64();
        warn!("pid {root} exceeded {:?}, killing its process tree", self.timeout);
        self.probe.kill_descendants(root);
        child.kill_and_reap()?;
        measurement.incomplete = true;
        break None;
      }
    };

    debug!(
      "pid {root}: {} samples, {} workers, {} gaps",
      measurement.memory.len(),
      measurement.workers.len(),
      measurement.gaps
    );

    Ok(Watch { status, measurement })
  }

  /// Keeps sampling tracked workers after the root exited, until none is
  /// left. Returns `false` if some were still running at the timeout and had
  /// to be killed.
  fn follow_survivors(
    &mut self,
    start: Instant,
    measurement: &mut Measurement,
    worker_index: &HashMap<(u32, u64), usize>,
  ) -> bool {
    if worker_index.is_empty() {
      return true;
    }
    let pids = worker_index.keys().map(|&(pid, _)| pid).collect::<Vec<_>>();

    loop {
      let t = start.elapsed().as_secs_f64();
      let survivors = self
        .probe
        .processes(&pids)
        .into_iter()
        .filter_map(|worker| worker_index.get(&(worker.pid, worker.start_time)).map(|&index| (index, worker)))
        .collect::<Vec<_>>();
      if survivors.is_empty() {
        return true;
      }

      if start.elapsed() >= self.timeout {
        warn!(
          "{} workers outlived their parent past {:?}, killing them",
          survivors.len(),
          self.timeout
        );
        self
          .probe
          .kill_trees(&survivors.iter().map(|(_, worker)| worker.pid).collect::<Vec<_>>());
        return false;
      }

      measurement.memory.push(Sample {
        t,
        mb: bytes_to_mb(survivors.iter().map(|(_, worker)| worker.bytes).sum::<u64>()),
      });
      for (index, worker) in &survivors {
        measurement.workers.entry(*index).or_default().push(Sample {
          t,
          mb: bytes_to_mb(worker.bytes),
        });
      }

      thread::sleep(self.interval.min(self.timeout.saturating_sub(start.elapsed())));
    }
  }

  fn tick(
    &mut self,
    root: u32,
    start: Instant,
    measurement: &mut Measurement,
    worker_index: &mut HashMap<(u32, u64), usize>,
  ) {
    let t = start.elapsed().as_secs_f64();
    let Some(mut usage) = self.probe.usage(root) else {
      measurement.gaps += 1;
      return;
    };

    measurement.memory.push(Sample {
      t,
      mb: bytes_to_mb(usage.total_bytes()),
    });

    if !self.track_workers {
      return;
    }

    usage.workers.sort_by_key(|w| (w.start_time, w.pid));
    for worker in usage.workers {
      let next = worker_index.len();
      let index = *worker_index.entry((worker.pid, worker.start_time)).or_insert(next);
      measurement.workers.entry(index).or_default().push(Sample {
        t,
        mb: bytes_to_mb(worker.bytes),
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{collections::VecDeque, process::Command};

  use super::*;

  /// Replays a scripted sequence of readings, then repeats the last one.
  /// Workers that outlive the root replay `survivors`, then are gone.
  struct ScriptedProbe {
    readings: VecDeque<Option<TreeUsage>>,
    last: Option<TreeUsage>,
    survivors: VecDeque<Vec<WorkerUsage>>,
    killed: bool,
    killed_trees: Vec<u32>,
  }

  impl ScriptedProbe {
    fn new(readings: Vec<Option<TreeUsage>>) -> Self {
      Self {
        readings: readings.into(),
        last: None,
        survivors: VecDeque::new(),
        killed: false,
        killed_trees: Vec::new(),
      }
    }

    fn with_survivors(mut self, survivors: Vec<Vec<WorkerUsage>>) -> Self {
      self.survivors = survivors.into();
      self
    }
  }

  impl Probe for ScriptedProbe {
    fn usage(&mut self, _root: u32) -> Option<TreeUsage> {
      match self.readings.pop_front() {
        Some(reading) => {
          self.last = reading.clone();
          reading
        }
        None => self.last.clone(),
      }
    }

    fn processes(&mut self, _pids: &[u32]) -> Vec<WorkerUsage> {
      self.survivors.pop_front().unwrap_or_default()
    }

    fn kill_descendants(&mut self, _root: u32) {
      self.killed = true;
    }

    fn kill_trees(&mut self, pids: &[u32]) {
      self.killed_trees.extend(pids);
    }
  }

  const MB: u64 = 1024 * 1024;

  fn workers(workers: &[(u32, u64)]) -> Vec<WorkerUsage> {
    workers
      .iter()
      .map(|&(pid, mb)| WorkerUsage {
        pid,
        start_time: 0,
        bytes: mb * MB,
      })
      .collect()
  }

  fn usage(root_mb: u64, running: &[(u32, u64)]) -> TreeUsage {
    TreeUsage {
      root_bytes: root_mb * MB,
      workers: workers(running),
    }
  }

  #[cfg(unix)]
  #[test]
  fn single_process_series_until_exit() {
    let probe = ScriptedProbe::new(vec![Some(usage(1, &[])), Some(usage(3, &[]))]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_secs(10), false);

    let start = Instant::now();
    let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();

    assert!(watch.status.unwrap().success());
    assert!(!watch.measurement.incomplete);
    assert!(watch.measurement.elapsed_secs >= 0.2);
    assert!(watch.measurement.memory.len() >= 2);
    assert_eq!(watch.measurement.memory[0].mb, 1.0);
    assert_eq!(watch.measurement.memory[1].mb, 3.0);
    assert!(watch.measurement.workers.is_empty());
  }

  #[cfg(unix)]
  #[test]
  fn missing_readings_are_gaps() {
    let probe = ScriptedProbe::new(vec![None, None, Some(usage(2, &[]))]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_secs(10), false);

    let start = Instant::now();
    let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();

    assert_eq!(watch.measurement.gaps, 2);
    assert!(!watch.measurement.memory.is_empty());
  }

  #[cfg(unix)]
  #[test]
  fn workers_keep_spawn_order_and_stay_separate() {
    let probe = ScriptedProbe::new(vec![
      Some(usage(1, &[(200, 5)])),
      // pid 100 appears later but still gets the next index
      Some(usage(1, &[(200, 6), (100, 7)])),
      // pid 200 vanished between refresh and lookup
      Some(usage(1, &[(100, 8)])),
    ]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_secs(10), true);

    let start = Instant::now();
    let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();
    let workers = &watch.measurement.workers;

    assert_eq!(workers.len(), 2);
    assert_eq!(workers[&0][..2].iter().map(|s| s.mb).collect::<Vec<_>>(), vec![5.0, 6.0]);
    assert_eq!(workers[&1][..2].iter().map(|s| s.mb).collect::<Vec<_>>(), vec![7.0, 8.0]);
    assert_eq!(watch.measurement.memory[1].mb, 14.0);
  }

  #[cfg(unix)]
  #[test]
  fn workers_outliving_the_root_are_followed() {
    let probe = ScriptedProbe::new(vec![Some(usage(1, &[(100, 5), (200, 6)]))])
      .with_survivors(vec![workers(&[(100, 9), (200, 9)]), workers(&[(200, 12)])]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_secs(10), true);

    let start = Instant::now();
    let mut child = Command::new("sleep").arg("0.1").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();
    let m = &watch.measurement;

    assert!(watch.status.unwrap().success());
    assert!(!m.incomplete);
    assert_eq!(m.workers[&0].last().unwrap().mb, 9.0);
    assert_eq!(m.workers[&1].last().unwrap().mb, 12.0);
    assert_eq!(m.memory.last().unwrap().mb, 12.0);
    // the root was gone before the last worker sample
    assert!(m.elapsed_secs >= m.memory.last().unwrap().t);
    assert!(sampler.probe.killed_trees.is_empty());
  }

  #[cfg(unix)]
  #[test]
  fn surviving_workers_are_killed_at_the_timeout() {
    let probe = ScriptedProbe::new(vec![Some(usage(1, &[(100, 5)]))]).with_survivors(vec![workers(&[(100, 5)]); 1000]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_millis(300), true);

    let start = Instant::now();
    let mut child = Command::new("true").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();

    assert!(watch.status.is_none());
    assert!(watch.measurement.incomplete);
    assert!(watch.measurement.elapsed_secs >= 0.3);
    assert_eq!(sampler.probe.killed_trees, vec![100]);
  }

  #[cfg(unix)]
  #[test]
  fn single_process_runs_ignore_survivors() {
    let probe = ScriptedProbe::new(vec![Some(usage(1, &[(100, 5)]))]).with_survivors(vec![workers(&[(100, 5)]); 1000]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_secs(10), false);

    let start = Instant::now();
    let mut child = Command::new("true").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();

    assert!(watch.status.unwrap().success());
    assert_eq!(sampler.probe.survivors.len(), 1000);
  }

  #[cfg(unix)]
  #[test]
  fn timeout_kills_and_flags_incomplete() {
    let probe = ScriptedProbe::new(vec![Some(usage(4, &[]))]);
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_millis(200), false);

    let start = Instant::now();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();

    assert!(watch.status.is_none());
    assert!(watch.measurement.incomplete);
    assert!(!watch.measurement.memory.is_empty());
    assert!(watch.measurement.elapsed_secs < 5.0);
    assert!(sampler.probe.killed);
    // reaped: nothing left to wait for
    assert!(child.try_wait().unwrap().is_some());
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn sys_probe_sees_own_tree() {
    let mut child = Command::new("sh")
      .args(["-c", "sleep 5 & sleep 5 & wait"])
      .spawn()
      .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let mut probe = SysProbe::new();
    let usage = probe.usage(child.id()).unwrap();

    assert_eq!(usage.workers.len(), 2);
    assert!(usage.total_bytes() >= usage.root_bytes);

    probe.kill_descendants(child.id());
    child.kill_and_reap().unwrap();
  }
  #[cfg(target_os = "linux")]
  #[test]
  fn sys_probe_follows_orphaned_workers() {
    let probe = SysProbe::new();
    let mut sampler = Sampler::new(probe, Duration::from_millis(20), Duration::from_secs(10), true);

    let start = Instant::now();
    let mut child = Command::new("sh")
      .args(["-c", "sleep 1 & sleep 1 & sleep 0.2; exit 0"])
      .spawn()
      .unwrap();
    let watch = sampler.watch(&mut child, start).unwrap();

    assert!(watch.status.unwrap().success());
    assert!(watch.measurement.elapsed_secs >= 0.9);
    assert!(watch.measurement.workers.len() >= 2);
  }
}
