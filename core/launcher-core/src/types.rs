//! Shared data types: game identities, voice language selectors, operations
//! and the per-identity installation record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::LauncherError;
use crate::version::Version;

/// Opaque key naming a game/region/channel combination (e.g. `hk4e_global`).
///
/// Used verbatim in instance-gate keys and the worker argument contract, so it
/// must be non-empty and contain no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GameIdentity(String);

impl GameIdentity {
    pub fn new(value: impl Into<String>) -> Result<Self, LauncherError> {
        let value = value.into();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(LauncherError::InvalidIdentity(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GameIdentity {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for GameIdentity {
    type Error = LauncherError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GameIdentity> for String {
    fn from(identity: GameIdentity) -> String {
        identity.0
    }
}

/// Voice-pack selector passed to the worker as `--lang <bits>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceLanguage(u32);

impl VoiceLanguage {
    pub const NONE: VoiceLanguage = VoiceLanguage(0);
    pub const CHINESE: VoiceLanguage = VoiceLanguage(1);
    pub const ENGLISH: VoiceLanguage = VoiceLanguage(2);
    pub const JAPANESE: VoiceLanguage = VoiceLanguage(4);
    pub const KOREAN: VoiceLanguage = VoiceLanguage(8);
    pub const ALL: VoiceLanguage = VoiceLanguage(15);

    pub const fn from_bits(bits: u32) -> Self {
        VoiceLanguage(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Downloads never go out without a voice pack; an empty selection means all of them.
    pub const fn or_all(self) -> Self {
        if self.is_none() {
            VoiceLanguage::ALL
        } else {
            self
        }
    }
}

impl fmt::Display for VoiceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-triggered operation that runs in the elevated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Download,
    PreDownload,
    Repair,
}

impl Operation {
    /// Name used in instance-gate keys. Pre-download shares the download gate
    /// because both write the same installation directory.
    pub fn gate_name(self) -> &'static str {
        match self {
            Operation::Download | Operation::PreDownload => "download_game",
            Operation::Repair => "repair_game",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Download => "download",
            Operation::PreDownload => "pre-download",
            Operation::Repair => "repair",
        };
        f.write_str(name)
    }
}

/// Everything known about one installation.
///
/// Owned by a single `LifecycleOrchestrator`; eligibility flags are derived
/// from it on every read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallationRecord {
    pub identity: GameIdentity,
    pub install_path: Option<PathBuf>,
    pub local_version: Option<Version>,
    pub current_version: Option<Version>,
    pub pre_version: Option<Version>,
    pub pre_download_complete: bool,
}

impl InstallationRecord {
    pub fn new(identity: GameIdentity) -> Self {
        Self {
            identity,
            install_path: None,
            local_version: None,
            current_version: None,
            pre_version: None,
            pre_download_complete: false,
        }
    }
}
