//! Game process tracking.
//!
//! # Two Liveness Strategies
//!
//! 1. **Exit notification** (preferred): the handle delivers a one-shot
//!    notification when the process exits. Available for processes this
//!    launcher spawned itself.
//!
//! 2. **Polling** (fallback): when the handle refuses to subscribe (the process
//!    is not our child, or belongs to another security context) the watcher
//!    probes liveness on a fixed interval.
//!
//! The strategy is picked once per attach by trying to subscribe.
//!
//! # PID Verification
//!
//! Operating systems reuse PIDs. A foreign process is identified by PID *and*
//! start time; if the start time at the PID changes, the original process is
//! gone even though `kill(pid, 0)` still succeeds.

mod handle;
mod watcher;

pub use handle::{ChildProcess, ForeignProcess};
pub use watcher::{ProcessWatcher, WatchId, DEFAULT_POLL_INTERVAL};

use std::sync::Arc;

use crate::error::LauncherError;

/// Called at most once when the tracked process exits.
pub type ExitNotifier = Box<dyn FnOnce() + Send + 'static>;

/// A running (or recently running) external process.
pub trait ProcessHandle: Send + Sync + 'static {
    fn pid(&self) -> u32;

    fn name(&self) -> &str;

    /// Non-throwing existence probe. Errors count as "exited".
    fn has_exited(&self) -> bool;

    /// Registers `notify` to run when the process exits.
    ///
    /// Returns [`LauncherError::ProcessAccessDenied`] when exit notification is
    /// not available for this process; the watcher then polls instead.
    fn subscribe_exit(&self, notify: ExitNotifier) -> Result<(), LauncherError>;
}

/// Shared handle as held by the watcher and its poll thread.
pub type SharedHandle = Arc<dyn ProcessHandle>;

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // EPERM means the process exists but belongs to someone else.
        let rc = unsafe { libc::kill(raw, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        get_process_start_time(pid).is_some()
    }
}

/// Get the start time of a process (Unix timestamp, seconds).
/// Returns None if the process doesn't exist or can't be queried.
pub fn get_process_start_time(pid: u32) -> Option<u64> {
    use sysinfo::{Pid, ProcessRefreshKind, System};

    let mut sys = System::new();
    let sysinfo_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sysinfo_pid, ProcessRefreshKind::new());
    sys.process(sysinfo_pid).map(|process| process.start_time())
}

/// Verify that a PID is alive AND still belongs to the process that started
/// at `expected_start` (±2 seconds, sysinfo rounds start times).
pub fn is_pid_alive_verified(pid: u32, expected_start: Option<u64>) -> bool {
    if !is_pid_alive(pid) {
        return false;
    }
    let Some(expected) = expected_start else {
        return true;
    };
    match get_process_start_time(pid) {
        Some(actual) => actual.abs_diff(expected) <= 2,
        // Alive per kill(0) but not visible to sysinfo; trust the pid.
        None => true,
    }
}
