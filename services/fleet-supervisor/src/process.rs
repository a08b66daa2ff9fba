// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Worker process management
//!
//! [`ProcessLauncher`] starts `migration-worker run` processes, keeps their
//! [`Child`] handles, and also recognises workers started by an earlier
//! supervisor through their pid files. A pid file is only trusted when the
//! process behind it runs the worker binary with the matching
//! `--worker-id`; stale or foreign pid files are removed. A termination only
//! counts once the process is gone.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use migration_types::WorkerFiles;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to spawn worker {id}: {source}")]
    Spawn {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} spawned without a process id")]
    NoPid(u32),

    #[error("Worker {0} is already running")]
    AlreadyRunning(u32),

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Starts, lists and stops worker processes
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Ids of workers whose process is alive
    async fn running(&self) -> BTreeSet<u32>;

    /// Start worker `id`. Returns its pid.
    async fn spawn(&self, id: u32) -> Result<u32, LaunchError>;

    /// Stop worker `id`. Returns `true` once the process is confirmed gone,
    /// `false` if it survived.
    async fn terminate(&self, id: u32) -> Result<bool, LaunchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Dead,
}

fn liveness(pid: u32) -> Liveness {
    if pid == 0 || pid > i32::MAX as u32 {
        return Liveness::Dead;
    }
    // SAFETY: signal 0 performs an existence check only; nothing is
    // delivered and no memory is touched. `pid` is positive and fits pid_t.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return Liveness::Alive;
    }
    // EPERM and anything else: the process may still exist.
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Liveness::Dead,
        _ => Liveness::Alive,
    }
}

fn signal(pid: u32, sig: libc::c_int) -> Result<(), LaunchError> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Ok(());
    }
    // SAFETY: `pid` is a positive pid_t naming a single process.
    let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(LaunchError::Signal { pid, source: err })
}

fn read_pid_file(files: &WorkerFiles) -> Option<u32> {
    std::fs::read_to_string(files.pid_file())
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Identity {
    Worker,
    Foreign,
    /// No procfs to look at
    Unknown,
}

/// Whether `pid` runs `binary` as worker `id`, judged from its command line
fn identity(pid: u32, binary: &Path, id: u32) -> Identity {
    let raw = match std::fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(raw) => raw,
        Err(_) if !Path::new("/proc/self").exists() => return Identity::Unknown,
        Err(_) => return Identity::Foreign,
    };
    let argv: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();

    let Some(name) = binary.file_name() else {
        return Identity::Foreign;
    };
    let runs_binary = argv
        .iter()
        .take(2)
        .any(|a| Path::new(a).file_name() == Some(name));
    let id = id.to_string();
    let has_id = argv.windows(2).any(|w| w[0] == "--worker-id" && w[1] == id);
    if runs_binary && has_id {
        Identity::Worker
    } else {
        Identity::Foreign
    }
}

#[derive(Clone, Debug)]
pub struct LauncherSettings {
    pub binary: PathBuf,
    /// Passed before the `run` subcommand
    pub args: Vec<String>,
    pub state_dir: PathBuf,
    /// Catalog ids per worker; 0 leaves workers unbounded
    pub slice_size: i64,
    pub grace: Duration,
}

pub struct ProcessLauncher {
    settings: LauncherSettings,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(settings: LauncherSettings) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command_args(&self, id: u32) -> Vec<String> {
        let mut args = self.settings.args.clone();
        args.extend(["run".to_string(), "--worker-id".to_string(), id.to_string()]);
        if self.settings.slice_size > 0 {
            let start = i64::from(id) * self.settings.slice_size;
            args.extend([
                "--start".to_string(),
                start.to_string(),
                "--end".to_string(),
                (start + self.settings.slice_size).to_string(),
            ]);
        }
        args
    }

    /// Pid of a worker started by someone else, if its process is alive
    /// and really is that worker. Pid files that fail either test are removed.
    fn adopted_pid(&self, id: u32) -> Option<u32> {
        let files = WorkerFiles::new(&self.settings.state_dir, id);
        let pid = read_pid_file(&files)?;
        let reason = if liveness(pid) == Liveness::Dead {
            "process gone"
        } else {
            match identity(pid, &self.settings.binary, id) {
                Identity::Worker => return Some(pid),
                Identity::Unknown => {
                    tracing::debug!(worker_id = id, pid, "No procfs, adopting live pid unchecked");
                    return Some(pid);
                }
                Identity::Foreign => "pid belongs to another process",
            }
        };
        tracing::info!(worker_id = id, pid, reason, "Removing stale pid file");
        if let Err(e) = std::fs::remove_file(files.pid_file()) {
            tracing::warn!(worker_id = id, error = %e, "Cannot remove stale pid file");
        }
        None
    }

    async fn wait_gone(&self, pid: u32, child: Option<&mut Child>, limit: Duration) -> bool {
        match child {
            Some(child) => tokio::time::timeout(limit, child.wait()).await.is_ok(),
            None => {
                let deadline = tokio::time::Instant::now() + limit;
                loop {
                    if liveness(pid) == Liveness::Dead {
                        return true;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn running(&self) -> BTreeSet<u32> {
        let mut alive = BTreeSet::new();
        let mut children = self.children.lock().await;
        children.retain(|id, child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(worker_id = id, %status, "Worker exited");
                false
            }
            Ok(None) => {
                alive.insert(*id);
                true
            }
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "Cannot poll worker, dropping handle");
                false
            }
        });
        drop(children);

        let Ok(entries) = std::fs::read_dir(&self.settings.state_dir) else {
            return alive;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("worker-")?.strip_suffix(".pid")?.parse().ok())
            else {
                continue;
            };
            if !alive.contains(&id) && self.adopted_pid(id).is_some() {
                alive.insert(id);
            }
        }
        alive
    }

    async fn spawn(&self, id: u32) -> Result<u32, LaunchError> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&id) {
            if matches!(child.try_wait(), Ok(None)) {
                return Err(LaunchError::AlreadyRunning(id));
            }
            children.remove(&id);
        }
        if self.adopted_pid(id).is_some() {
            return Err(LaunchError::AlreadyRunning(id));
        }

        let files = WorkerFiles::new(&self.settings.state_dir, id);
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(files.stderr_log())
            .map(Stdio::from)
            .unwrap_or_else(|e| {
                tracing::warn!(worker_id = id, error = %e, "Cannot open stderr log");
                Stdio::null()
            });

        let args = self.command_args(id);
        let child = Command::new(&self.settings.binary)
            .args(&args)
            .env("MIGRATION_STATE_DIR", &self.settings.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| LaunchError::Spawn { id, source })?;
        let pid = child.id().ok_or(LaunchError::NoPid(id))?;

        tracing::info!(
            worker_id = id,
            pid,
            binary = %self.settings.binary.display(),
            ?args,
            "Spawned worker"
        );
        children.insert(id, child);
        Ok(pid)
    }

    async fn terminate(&self, id: u32) -> Result<bool, LaunchError> {
        let mut children = self.children.lock().await;
        let mut child = children.remove(&id);

        let pid = match child.as_ref().and_then(|c| c.id()) {
            Some(pid) => pid,
            None => match self.adopted_pid(id) {
                Some(pid) => pid,
                None => return Ok(true),
            },
        };

        signal(pid, libc::SIGTERM)?;
        if self.wait_gone(pid, child.as_mut(), self.settings.grace).await {
            tracing::info!(worker_id = id, pid, "Worker terminated");
            return Ok(true);
        }

        tracing::warn!(worker_id = id, pid, "Worker ignored SIGTERM, sending SIGKILL");
        signal(pid, libc::SIGKILL)?;
        if self.wait_gone(pid, child.as_mut(), Duration::from_secs(5)).await {
            return Ok(true);
        }

        tracing::error!(worker_id = id, pid, "Worker still present after SIGKILL");
        if let Some(child) = child {
            children.insert(id, child);
        }
        Ok(false)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory launcher; `stubborn` ids refuse to die
    #[derive(Default)]
    pub struct MockLauncher {
        pub alive: StdMutex<BTreeSet<u32>>,
        pub spawned: StdMutex<Vec<u32>>,
        pub terminated: StdMutex<Vec<u32>>,
        pub stubborn: StdMutex<BTreeSet<u32>>,
    }

    impl MockLauncher {
        pub fn with_running(ids: &[u32]) -> Self {
            let launcher = Self::default();
            launcher.alive.lock().unwrap().extend(ids.iter().copied());
            launcher
        }

        pub fn spawned(&self) -> Vec<u32> {
            self.spawned.lock().unwrap().clone()
        }

        pub fn terminated(&self) -> Vec<u32> {
            self.terminated.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerLauncher for MockLauncher {
        async fn running(&self) -> BTreeSet<u32> {
            self.alive.lock().unwrap().clone()
        }

        async fn spawn(&self, id: u32) -> Result<u32, LaunchError> {
            if !self.alive.lock().unwrap().insert(id) {
                return Err(LaunchError::AlreadyRunning(id));
            }
            self.spawned.lock().unwrap().push(id);
            Ok(10_000 + id)
        }

        async fn terminate(&self, id: u32) -> Result<bool, LaunchError> {
            self.terminated.lock().unwrap().push(id);
            if self.stubborn.lock().unwrap().contains(&id) {
                return Ok(false);
            }
            self.alive.lock().unwrap().remove(&id);
            Ok(true)
        }
    }
}
