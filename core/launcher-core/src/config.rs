//! Configuration loading and saving.
//!
//! Everything lives under `~/.launcher/`:
//! - `config.json`: launcher settings and per-game entries
//! - `instances/`: instance-gate lock directories
//! - `logs/`: daily log files written by the CLI

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LauncherError, Result};
use crate::orchestrator::LifecycleConfig;
use crate::types::GameIdentity;
use crate::version::RepairPolicy;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Returns the launcher data directory (`~/.launcher`).
pub fn launcher_home() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".launcher"))
        .ok_or(LauncherError::HomeDirNotFound)
}

/// Returns the path to the configuration file.
pub fn config_path() -> Result<PathBuf> {
    Ok(launcher_home()?.join("config.json"))
}

fn default_fallback_executable() -> String {
    if cfg!(windows) {
        "launcherctl.exe".to_string()
    } else {
        "launcherctl".to_string()
    }
}

fn default_elevation_helper() -> String {
    crate::launcher::DEFAULT_ELEVATION_HELPER.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Start the game even if an instance is already running, and don't
    /// attach to running instances at startup.
    #[serde(default)]
    pub ignore_running_game: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Worker executable looked up next to the launcher when the running
    /// binary's own path cannot be used.
    #[serde(default = "default_fallback_executable")]
    pub fallback_executable: String,
    #[serde(default = "default_elevation_helper")]
    pub elevation_helper: String,
    /// Download engine the worker hands the actual transfer to.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    #[serde(default)]
    pub games: BTreeMap<GameIdentity, GameConfig>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            ignore_running_game: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fallback_executable: default_fallback_executable(),
            elevation_helper: default_elevation_helper(),
            worker_program: None,
            games: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub install_path: Option<PathBuf>,
    /// Game executable file name, relative to the install path.
    pub executable: Option<String>,
    /// Remote version manifest (`{"current": "...", "pre": "..."}`).
    pub manifest: Option<PathBuf>,
    pub start_arguments: Vec<String>,
    pub repair: RepairPolicy,
}

impl LauncherConfig {
    /// Loads from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Missing file yields defaults; a file that exists but does not parse is
    /// an error rather than silently discarded settings.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(LauncherError::io("read config", err)),
        };
        serde_json::from_str(&content).map_err(|err| LauncherError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| LauncherError::io("create config directory", err))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|err| LauncherError::json("serialize config", err))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|err| LauncherError::io("write config", err))?;
        fs::rename(&tmp_path, path).map_err(|err| LauncherError::io("commit config", err))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn game(&self, identity: &GameIdentity) -> Option<&GameConfig> {
        self.games.get(identity)
    }

    pub fn repair_policy(&self, identity: &GameIdentity) -> RepairPolicy {
        self.game(identity).map(|game| game.repair).unwrap_or_default()
    }

    /// Lifecycle settings for one game.
    pub fn lifecycle(&self, identity: &GameIdentity) -> LifecycleConfig {
        LifecycleConfig {
            repair: self.repair_policy(identity),
            ignore_running_game: self.ignore_running_game,
            poll_interval: self.poll_interval(),
        }
    }
}
