//! Concrete process handles.

use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use super::{get_process_start_time, is_pid_alive, is_pid_alive_verified, ExitNotifier, ProcessHandle};
use crate::error::LauncherError;

/// A process spawned by this launcher.
///
/// Exit notification waits on the child from a dedicated thread, which also
/// reaps it. Until then, `try_wait` answers the liveness probe.
pub struct ChildProcess {
    pid: u32,
    name: String,
    child: Mutex<Option<Child>>,
    exited: Arc<AtomicBool>,
}

impl ChildProcess {
    pub fn new(child: Child, name: impl Into<String>) -> Self {
        Self {
            pid: child.id(),
            name: name.into(),
            child: Mutex::new(Some(child)),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn has_exited(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return true;
        }

        let Ok(mut guard) = self.child.lock() else {
            return !is_pid_alive(self.pid);
        };
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    self.exited.store(true, Ordering::SeqCst);
                    true
                }
                Ok(None) => false,
                Err(_) => !is_pid_alive(self.pid),
            },
            // The wait thread owns the child now.
            None => !is_pid_alive(self.pid),
        }
    }

    fn subscribe_exit(&self, notify: ExitNotifier) -> Result<(), LauncherError> {
        let taken = self.child.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut child) = taken else {
            return Err(LauncherError::ProcessAccessDenied { pid: self.pid });
        };

        let pid = self.pid;
        let exited = Arc::clone(&self.exited);
        thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || {
                match child.wait() {
                    Ok(status) => debug!(pid, %status, "Child process exited"),
                    Err(err) => warn!(pid, error = %err, "Waiting on child process failed"),
                }
                exited.store(true, Ordering::SeqCst);
                notify();
            })
            .map_err(|err| LauncherError::io("spawn exit waiter", err))?;
        Ok(())
    }
}

/// A process this launcher did not spawn, e.g. a game that was already
/// running when the launcher started.
///
/// It is not our child, so there is nothing to wait on: exit subscription is
/// always denied and the watcher polls.
#[derive(Debug, Clone)]
pub struct ForeignProcess {
    pid: u32,
    name: String,
    started: Option<u64>,
}

impl ForeignProcess {
    pub fn new(pid: u32, name: impl Into<String>, started: Option<u64>) -> Self {
        Self {
            pid,
            name: name.into(),
            started,
        }
    }

    /// Captures the current start time so a recycled PID reads as exited.
    pub fn from_pid(pid: u32, name: impl Into<String>) -> Option<Self> {
        let started = get_process_start_time(pid)?;
        Some(Self::new(pid, name, Some(started)))
    }

    pub fn start_time(&self) -> Option<u64> {
        self.started
    }
}

impl ProcessHandle for ForeignProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn has_exited(&self) -> bool {
        !is_pid_alive_verified(self.pid, self.started)
    }

    fn subscribe_exit(&self, _notify: ExitNotifier) -> Result<(), LauncherError> {
        Err(LauncherError::ProcessAccessDenied { pid: self.pid })
    }
}
