//! Collaborators backed by the launcher configuration and the local machine.
//!
//! An installation directory carries a `config.ini` written by the game's own
//! tooling:
//!
//! ```ini
//! [General]
//! game_version=4.2.0
//! voice_language=2
//! predownload=4.3.0
//! ```
//!
//! Remote versions come from the manifest file configured per game, which
//! whatever fetches the game's resource index keeps up to date:
//!
//! ```json
//! { "current": "4.2.0", "pre": "4.3.0" }
//! ```

use fs_err as fs;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::debug;

use crate::config::{GameConfig, LauncherConfig};
use crate::error::{LauncherError, Result};
use crate::orchestrator::{ProcessSource, RemoteVersions, VersionSource};
use crate::process::{ChildProcess, ForeignProcess, SharedHandle};
use crate::types::{GameIdentity, VoiceLanguage};
use crate::version::{parse_version, Version};

pub const INSTALL_CONFIG_FILE: &str = "config.ini";

/// Reads `key=value` pairs, ignoring sections and comments.
fn read_install_config(install_path: &Path) -> Result<Option<HashMap<String, String>>> {
    let content = match fs::read_to_string(install_path.join(INSTALL_CONFIG_FILE)) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(LauncherError::io("read install config", err)),
    };
    let values = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(['#', ';', '[']))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();
    Ok(Some(values))
}

#[derive(Debug, Deserialize)]
struct Manifest {
    current: String,
    #[serde(default)]
    pre: Option<String>,
}

fn game<'a>(config: &'a LauncherConfig, identity: &GameIdentity) -> Result<&'a GameConfig> {
    config.game(identity).ok_or_else(|| LauncherError::NotConfigured {
        identity: identity.to_string(),
        field: "game entry",
    })
}

#[derive(Debug, Clone)]
pub struct ConfigVersionSource {
    config: Arc<LauncherConfig>,
}

impl ConfigVersionSource {
    pub fn new(config: Arc<LauncherConfig>) -> Self {
        Self { config }
    }
}

impl VersionSource for ConfigVersionSource {
    fn install_path(&self, identity: &GameIdentity) -> Result<Option<PathBuf>> {
        Ok(self.config.game(identity).and_then(|game| game.install_path.clone()))
    }

    fn local_version(&self, _identity: &GameIdentity, install_path: &Path) -> Result<Option<Version>> {
        let Some(values) = read_install_config(install_path)? else {
            return Ok(None);
        };
        match values.get("game_version").map(String::as_str) {
            None | Some("") => Ok(None),
            Some(raw) => parse_version(raw).map(Some),
        }
    }

    fn remote_versions(&self, identity: &GameIdentity) -> Result<RemoteVersions> {
        let manifest_path = game(&self.config, identity)?
            .manifest
            .as_ref()
            .ok_or_else(|| LauncherError::NotConfigured {
                identity: identity.to_string(),
                field: "manifest",
            })?;
        let content = fs::read_to_string(manifest_path).map_err(|err| LauncherError::VersionUnavailable {
            identity: identity.to_string(),
            details: err.to_string(),
        })?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|err| LauncherError::json("parse version manifest", err))?;

        let pre = match manifest.pre.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_version(raw)?),
        };
        Ok(RemoteVersions {
            current: parse_version(&manifest.current)?,
            pre,
        })
    }

    fn pre_download_complete(&self, _identity: &GameIdentity, install_path: &Path, pre: &Version) -> Result<bool> {
        let Some(values) = read_install_config(install_path)? else {
            return Ok(false);
        };
        Ok(values
            .get("predownload")
            .and_then(|raw| parse_version(raw).ok())
            .is_some_and(|done| &done == pre))
    }

    fn voice_language(&self, _identity: &GameIdentity, install_path: &Path) -> Result<VoiceLanguage> {
        let bits = read_install_config(install_path)?
            .and_then(|values| values.get("voice_language").and_then(|raw| raw.parse::<u32>().ok()))
            .unwrap_or(0);
        Ok(VoiceLanguage::from_bits(bits))
    }
}

#[derive(Debug, Clone)]
pub struct SysinfoProcessSource {
    config: Arc<LauncherConfig>,
}

impl SysinfoProcessSource {
    pub fn new(config: Arc<LauncherConfig>) -> Self {
        Self { config }
    }

    fn executable<'a>(&'a self, identity: &GameIdentity) -> Result<(&'a GameConfig, &'a str)> {
        let game = game(&self.config, identity)?;
        let executable = game.executable.as_deref().ok_or_else(|| LauncherError::NotConfigured {
            identity: identity.to_string(),
            field: "executable",
        })?;
        Ok((game, executable))
    }

    /// Running game processes started from `install`, or from anywhere when
    /// no install directory is known.
    fn find_in(&self, identity: &GameIdentity, install: Option<&Path>) -> Result<Option<SharedHandle>> {
        let (_, executable) = self.executable(identity)?;
        let file_name = Path::new(executable)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(executable);

        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet));

        let found = sys.processes().values().find(|process| {
            if !same_name(process.name(), file_name) {
                return false;
            }
            // Another installation of the same game is not ours to track.
            match (install, process.exe()) {
                (Some(install), Some(exe)) => exe.starts_with(install),
                _ => true,
            }
        });

        Ok(found.map(|process| {
            let pid = process.pid().as_u32();
            debug!(biz = %identity, pid, "Found running game process");
            Arc::new(ForeignProcess::new(pid, process.name(), Some(process.start_time()))) as SharedHandle
        }))
    }
}

fn same_name(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn find_running(&self, identity: &GameIdentity) -> Result<Option<SharedHandle>> {
        let (game, _) = self.executable(identity)?;
        self.find_in(identity, game.install_path.as_deref())
    }

    fn start(
        &self,
        identity: &GameIdentity,
        install_path: Option<&Path>,
        ignore_running: bool,
    ) -> Result<Option<SharedHandle>> {
        let (game, executable) = self.executable(identity)?;
        let install = install_path
            .or(game.install_path.as_deref())
            .ok_or_else(|| LauncherError::NotConfigured {
                identity: identity.to_string(),
                field: "install path",
            })?;
        if !ignore_running {
            if let Some(running) = self.find_in(identity, Some(install))? {
                return Ok(Some(running));
            }
        }

        let path = install.join(executable);
        if !path.is_file() {
            return Ok(None);
        }

        let child = Command::new(&path)
            .args(&game.start_arguments)
            .current_dir(install)
            .spawn()
            .map_err(|err| LauncherError::io(format!("start {}", path.display()), err))?;
        debug!(biz = %identity, pid = child.id(), path = %path.display(), "Game process spawned");
        Ok(Some(Arc::new(ChildProcess::new(child, executable)) as SharedHandle))
    }
}
