//! Lock-directory registry.
//!
//! `create_dir` is atomic on every platform we target: when two launchers race
//! for the same key, exactly one `create_dir` succeeds and the other sees
//! `AlreadyExists`.
//!
//! # Lock Directory Structure
//!
//! Location: [`LockDirRegistry::default_base`]`/{hash}.lock/` where `{hash}` is
//! MD5 of the instance key (`download_game_hk4e_global`). The base is machine
//! wide, so launchers of every user and their elevated workers meet there.
//!
//! ```text
//! {hash}.lock/
//! ├── pid                # holder PID, plain text
//! ├── meta.json          # { pid, key, role, proc_started, created }
//! └── activations/       # redirected requests, one JSON file each
//! ```
//!
//! # Stale Locks
//!
//! A lock whose holder is dead, or whose PID now belongs to a different process
//! (start time mismatch), is stale and gets taken over. Takeover renames the
//! stale directory aside first, so two launchers cleaning up the same stale
//! lock cannot both win.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ActivationRequest, HolderRole, InstanceHolder, InstanceRegistry, Registration};
use crate::error::{LauncherError, Result};
use crate::process::{get_process_start_time, is_pid_alive_verified};

const PID_FILE: &str = "pid";
const META_FILE: &str = "meta.json";
const ACTIVATIONS_DIR: &str = "activations";
/// How long to wait for a just-created lock to get its metadata.
const META_WAIT_ATTEMPTS: u32 = 20;
const META_WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LockMeta {
    pid: u32,
    key: String,
    #[serde(default)]
    role: HolderRole,
    #[serde(default)]
    proc_started: Option<u64>,
    created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockDirRegistry {
    base: PathBuf,
    owner: u32,
    role: HolderRole,
}

impl LockDirRegistry {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self::with_owner(base, std::process::id())
    }

    /// Registry recording `owner` instead of the current PID.
    pub fn with_owner(base: impl Into<PathBuf>, owner: u32) -> Self {
        Self {
            base: base.into(),
            owner,
            role: HolderRole::Launcher,
        }
    }

    /// Registrations made through this registry record `role`.
    pub fn with_role(mut self, role: HolderRole) -> Self {
        self.role = role;
        self
    }

    /// Machine-wide lock location: `%ProgramData%\launcher\instances` on
    /// Windows, `/tmp/launcher-instances` elsewhere. Independent of the user,
    /// so an elevated worker resolves the same directory as its launcher.
    pub fn default_base() -> PathBuf {
        #[cfg(windows)]
        {
            std::env::var_os("ProgramData")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
                .join("launcher")
                .join("instances")
        }
        #[cfg(not(windows))]
        {
            PathBuf::from("/tmp").join("launcher-instances")
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Get the lock directory path for a key (without checking if it exists).
    pub fn lock_dir_path(&self, key: &str) -> PathBuf {
        self.base.join(format!("{:x}.lock", md5::compute(key)))
    }

    /// The live holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<InstanceHolder> {
        let meta = read_meta(&self.lock_dir_path(key))?;
        is_pid_alive_verified(meta.pid, meta.proc_started).then(|| InstanceHolder {
            key: meta.key,
            pid: meta.pid,
            role: meta.role,
        })
    }

    fn write_meta(&self, lock_dir: &Path, key: &str) -> Result<()> {
        let meta = LockMeta {
            pid: self.owner,
            key: key.to_string(),
            role: self.role,
            proc_started: get_process_start_time(self.owner),
            created: Utc::now(),
        };
        let payload = serde_json::to_vec_pretty(&meta)
            .map_err(|err| LauncherError::json("serialize lock metadata", err))?;
        write_atomic(&lock_dir.join(PID_FILE), self.owner.to_string().as_bytes())?;
        write_atomic(&lock_dir.join(META_FILE), &payload)
    }

    fn ensure_base(&self) -> Result<()> {
        if self.base.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.base)
            .map_err(|err| LauncherError::io("create instance lock directory", err))?;
        // Shared between users: world-writable and sticky, like /tmp.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = fs::set_permissions(&self.base, std::fs::Permissions::from_mode(0o1777)) {
                warn!(path = %self.base.display(), error = %err, "Could not share instance lock directory");
            }
        }
        Ok(())
    }

    /// Creates the activation inbox up front so launchers of other users can
    /// write into it.
    fn create_inbox(&self, lock_dir: &Path) {
        let inbox = lock_dir.join(ACTIVATIONS_DIR);
        if let Err(err) = fs::create_dir_all(&inbox) {
            warn!(path = %inbox.display(), error = %err, "Failed to create activation inbox");
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&inbox, std::fs::Permissions::from_mode(0o1777));
        }
    }

    /// Reads metadata, giving a holder that is mid-registration a moment to
    /// finish writing it.
    fn wait_for_meta(&self, lock_dir: &Path) -> Option<LockMeta> {
        for _ in 0..META_WAIT_ATTEMPTS {
            if let Some(meta) = read_meta(lock_dir) {
                return Some(meta);
            }
            if !lock_dir.exists() {
                return None;
            }
            thread::sleep(META_WAIT_STEP);
        }
        read_meta(lock_dir)
    }

    /// Moves a stale lock aside. Returns false if someone else got there first.
    fn evict_stale(&self, lock_dir: &Path, judged: Option<&LockMeta>) -> Result<bool> {
        let tombstone = lock_dir.with_extension(format!(
            "stale-{}-{}",
            self.owner,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        match fs::rename(lock_dir, &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(LauncherError::io("evict stale instance lock", err)),
        }

        // Between judging and renaming, another launcher may have replaced the
        // stale lock with a live one. Put it back if so.
        if read_meta(&tombstone).as_ref() != judged {
            if fs::rename(&tombstone, lock_dir).is_err() {
                warn!(path = %tombstone.display(), "Could not restore a lock evicted by mistake");
            }
            return Ok(false);
        }

        if let Err(err) = fs::remove_dir_all(&tombstone) {
            warn!(path = %tombstone.display(), error = %err, "Failed to remove evicted lock");
        }
        Ok(true)
    }
}

impl InstanceRegistry for LockDirRegistry {
    fn owner(&self) -> u32 {
        self.owner
    }

    fn role(&self) -> HolderRole {
        self.role
    }

    fn register_if_absent(&self, key: &str) -> Result<Registration> {
        self.ensure_base()?;
        let lock_dir = self.lock_dir_path(key);

        for _ in 0..3 {
            match fs::create_dir(&lock_dir) {
                Ok(()) => {
                    if let Err(err) = self.write_meta(&lock_dir, key) {
                        let _ = fs::remove_dir_all(&lock_dir);
                        return Err(err);
                    }
                    self.create_inbox(&lock_dir);
                    debug!(key, role = ?self.role, path = %lock_dir.display(), "Instance lock created");
                    return Ok(Registration::Registered);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(LauncherError::io("create instance lock", err)),
            }

            let meta = self.wait_for_meta(&lock_dir);
            match &meta {
                Some(meta) if meta.pid == self.owner => {
                    self.write_meta(&lock_dir, key)?;
                    return Ok(Registration::Existing(InstanceHolder {
                        key: key.to_string(),
                        pid: self.owner,
                        role: self.role,
                    }));
                }
                Some(meta) if is_pid_alive_verified(meta.pid, meta.proc_started) => {
                    return Ok(Registration::Existing(InstanceHolder {
                        key: key.to_string(),
                        pid: meta.pid,
                        role: meta.role,
                    }));
                }
                Some(meta) => {
                    info!(key, stale_pid = meta.pid, "Taking over stale instance lock");
                }
                None => {
                    warn!(key, path = %lock_dir.display(), "Instance lock has no readable metadata; taking over");
                }
            }
            self.evict_stale(&lock_dir, meta.as_ref())?;
        }

        // Lost every takeover race; whoever holds it now wins.
        match read_meta(&lock_dir) {
            Some(meta) => Ok(Registration::Existing(InstanceHolder {
                key: key.to_string(),
                pid: meta.pid,
                role: meta.role,
            })),
            None => Err(LauncherError::io(
                "acquire instance lock",
                std::io::Error::new(ErrorKind::WouldBlock, "instance lock is contended"),
            )),
        }
    }

    fn redirect_to(&self, holder: &InstanceHolder, request: &ActivationRequest) -> Result<()> {
        let inbox = self.lock_dir_path(&holder.key).join(ACTIVATIONS_DIR);
        fs::create_dir_all(&inbox)
            .map_err(|err| LauncherError::io("create activation inbox", err))?;
        let payload = serde_json::to_vec_pretty(request)
            .map_err(|err| LauncherError::json("serialize activation request", err))?;
        let name = format!(
            "{}-{}.json",
            request.requested_at.timestamp_millis(),
            request.requested_by
        );
        write_atomic(&inbox.join(name), &payload)
    }

    fn unregister(&self, key: &str) -> Result<()> {
        let lock_dir = self.lock_dir_path(key);
        match read_meta(&lock_dir) {
            Some(meta) if meta.pid == self.owner => fs::remove_dir_all(&lock_dir)
                .map_err(|err| LauncherError::io("release instance lock", err)),
            Some(meta) => {
                warn!(key, holder = meta.pid, "Not releasing instance lock held by another process");
                Ok(())
            }
            None if lock_dir.exists() => fs::remove_dir_all(&lock_dir)
                .map_err(|err| LauncherError::io("release instance lock", err)),
            // Already released
            None => Ok(()),
        }
    }

    fn take_activations(&self, key: &str) -> Result<Vec<ActivationRequest>> {
        let inbox = self.lock_dir_path(key).join(ACTIVATIONS_DIR);
        let entries = match fs::read_dir(&inbox) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(LauncherError::io("read activation inbox", err)),
        };

        let mut requests = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read(&path) {
                Ok(data) => match serde_json::from_slice::<ActivationRequest>(&data) {
                    Ok(request) => requests.push(request),
                    Err(err) => warn!(path = %path.display(), error = %err, "Dropping malformed activation"),
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to read activation");
                    continue;
                }
            }
            let _ = fs::remove_file(&path);
        }
        requests.sort_by_key(|request| request.requested_at);
        Ok(requests)
    }
}

fn read_meta(lock_dir: &Path) -> Option<LockMeta> {
    let content = fs::read(lock_dir.join(META_FILE)).ok()?;
    serde_json::from_slice(&content).ok()
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|err| LauncherError::io("write lock file", err))?;
    fs::rename(&tmp_path, path).map_err(|err| LauncherError::io("commit lock file", err))
}
