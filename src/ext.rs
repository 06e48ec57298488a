use std::{
  fs,
  io::ErrorKind,
  process::{Child, Command, ExitStatus, Stdio},
  time::Duration,
};

use anyhow::{Context, Result};
use tempfile::{Builder, NamedTempFile};
use wait_timeout::ChildExt as WaitExt;

#[extend::ext]
pub impl ExitStatus {
  fn describe(&self) -> String {
    match self.code() {
      Some(code) => format!("exit code {code}"),
      None => format!("terminated ({self})"),
    }
  }
}

#[extend::ext]
pub impl Child {
  /// Waits at most `timeout` for the child to exit. Returns `Ok(None)` if it is
  /// still running.
  fn wait_at_most(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
    self.wait_timeout(timeout).context("wait")
  }

  /// Kills the child if it is still running and reaps it.
  fn kill_and_reap(&mut self) -> Result<ExitStatus> {
    match self.kill() {
      Ok(()) => {}
      // already exited, nothing left to kill
      Err(err) if err.kind() == ErrorKind::InvalidInput => {}
      Err(err) => return Err(err).context("kill"),
    }

    self.wait().context("wait")
  }
}

#[extend::ext]
pub impl Command {
  /// Spawns the command with stdout discarded and stderr captured into
  /// `stderr`, so a chatty child can never block on a full pipe.
  fn spawn_captured(&mut self, stderr: &NamedTempFile) -> Result<Child> {
    let stderr = stderr.reopen().context("reopen stderr capture")?;

    self
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::from(stderr))
      .spawn()
      .context("spawn")
  }
}

#[extend::ext]
pub impl NamedTempFile {
  fn with_suffix(suffix: &str) -> Result<NamedTempFile> {
    Builder::new().suffix(suffix).tempfile().context("tempfile")
  }

  /// Returns the last `lines` lines written to this file.
  fn tail(&self, lines: usize) -> String {
    let Ok(bytes) = fs::read(self.path()) else {
      return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let all = text.lines().collect::<Vec<_>>();

    all[all.len().saturating_sub(lines)..].join("\n")
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  #[test]
  fn tail_keeps_last_lines() {
    let mut file = NamedTempFile::with_suffix(".log").unwrap();
    write!(file, "one\ntwo\nthree\nfour\n").unwrap();

    assert_eq!(file.tail(2), "three\nfour");
    assert_eq!(file.tail(10), "one\ntwo\nthree\nfour");
  }

  #[cfg(unix)]
  #[test]
  fn kill_and_reap_running_child() {
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();

    assert!(child.wait_at_most(Duration::from_millis(10)).unwrap().is_none());

    let status = child.kill_and_reap().unwrap();
    assert!(!status.success());
  }

  #[cfg(unix)]
  #[test]
  fn kill_and_reap_exited_child() {
    let mut child = Command::new("true").spawn().unwrap();
    while child.wait_at_most(Duration::from_millis(10)).unwrap().is_none() {}

    assert!(child.kill_and_reap().unwrap().success());
  }
}
