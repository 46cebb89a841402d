//! Platform elevation back ends.

use std::path::Path;

use super::{ElevatedSpawner, WorkerArgs};
use crate::error::LaunchError;

pub const DEFAULT_ELEVATION_HELPER: &str = "pkexec";

/// Elevates through the operating system.
///
/// - Windows: `ShellExecuteExW` with the `runas` verb (UAC prompt).
/// - Unix: direct spawn when already root, otherwise through `helper`.
#[derive(Debug, Clone)]
pub struct OsElevatedSpawner {
    #[cfg_attr(windows, allow(dead_code))]
    helper: String,
}

impl OsElevatedSpawner {
    pub fn new(helper: impl Into<String>) -> Self {
        Self {
            helper: helper.into(),
        }
    }
}

impl Default for OsElevatedSpawner {
    fn default() -> Self {
        Self::new(DEFAULT_ELEVATION_HELPER)
    }
}

impl ElevatedSpawner for OsElevatedSpawner {
    fn spawn_elevated(&self, executable: &Path, args: &WorkerArgs) -> Result<u32, LaunchError> {
        #[cfg(windows)]
        {
            windows::shell_execute_runas(executable, args)
        }
        #[cfg(unix)]
        {
            unix::spawn(&self.helper, executable, args)
        }
        #[cfg(not(any(windows, unix)))]
        {
            let _ = (executable, args);
            Err(LaunchError::SpawnFailed {
                code: None,
                message: "elevation is not supported on this platform".to_string(),
            })
        }
    }
}

#[cfg(unix)]
mod unix {
    use std::path::Path;
    use std::process::{Command, Stdio};
    use std::thread;

    use tracing::{debug, warn};

    use super::super::WorkerArgs;
    use crate::error::LaunchError;

    /// pkexec exit codes for "not authorized" and "dialog dismissed".
    const HELPER_DECLINED: [i32; 2] = [126, 127];

    pub(super) fn spawn(helper: &str, executable: &Path, args: &WorkerArgs) -> Result<u32, LaunchError> {
        let elevated = unsafe { libc::geteuid() } == 0;
        let mut command = if elevated {
            Command::new(executable)
        } else {
            let mut command = Command::new(helper);
            command.arg(executable);
            command
        };
        command
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        let mut child = command.spawn().map_err(|err| LaunchError::SpawnFailed {
            code: err.raw_os_error(),
            message: if elevated {
                err.to_string()
            } else {
                format!("{helper}: {err}")
            },
        })?;
        let pid = child.id();

        // The prompt is asynchronous; a decline only shows up in the helper's
        // exit status, long after we returned.
        let reaper = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => match status.code() {
                    Some(code) if !elevated && HELPER_DECLINED.contains(&code) => {
                        warn!(pid, code, "Elevation was declined");
                    }
                    _ => debug!(pid, %status, "Elevated worker exited"),
                },
                Err(err) => warn!(pid, error = %err, "Waiting on elevated worker failed"),
            });
        if let Err(err) = reaper {
            warn!(pid, error = %err, "Could not start reaper thread for elevated worker");
        }
        Ok(pid)
    }
}

#[cfg(windows)]
mod windows {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_CANCELLED};
    use windows_sys::Win32::System::Threading::GetProcessId;
    use windows_sys::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use windows_sys::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

    use super::super::WorkerArgs;
    use crate::error::LaunchError;

    fn wide(value: &OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    pub(super) fn shell_execute_runas(executable: &Path, args: &WorkerArgs) -> Result<u32, LaunchError> {
        let verb = wide(OsStr::new("runas"));
        let file = wide(executable.as_os_str());
        let parameters = wide(OsStr::new(&args.to_command_line()));

        let mut info: SHELLEXECUTEINFOW = unsafe { std::mem::zeroed() };
        info.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
        info.fMask = SEE_MASK_NOCLOSEPROCESS;
        info.lpVerb = verb.as_ptr();
        info.lpFile = file.as_ptr();
        info.lpParameters = parameters.as_ptr();
        info.nShow = SW_SHOWNORMAL;

        if unsafe { ShellExecuteExW(&mut info) } == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_CANCELLED {
                return Err(LaunchError::Declined);
            }
            return Err(LaunchError::SpawnFailed {
                code: Some(code as i32),
                message: std::io::Error::from_raw_os_error(code as i32).to_string(),
            });
        }

        if info.hProcess.is_null() {
            return Ok(0);
        }
        let pid = unsafe { GetProcessId(info.hProcess) };
        unsafe { CloseHandle(info.hProcess) };
        Ok(pid)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::launcher::WorkerVerb;
    use crate::types::{GameIdentity, VoiceLanguage};
    use std::path::PathBuf;

    #[test]
    fn test_missing_helper_is_spawn_failure() {
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let spawner = OsElevatedSpawner::new("/nonexistent/elevation-helper");
        let args = WorkerArgs {
            verb: WorkerVerb::Download,
            identity: GameIdentity::new("hk4e_global").unwrap(),
            install_path: PathBuf::from("/games/ys"),
            language: VoiceLanguage::ALL,
        };
        let result = spawner.spawn_elevated(Path::new("/usr/bin/true"), &args);
        assert!(matches!(result, Err(LaunchError::SpawnFailed { code: Some(_), .. })));
    }
}
