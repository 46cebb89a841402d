//! Version-derived eligibility.
//!
//! Everything here is pure: given the local, current and pre-release versions
//! of an installation, decide which lifecycle actions are allowed.
//!
//! ```text
//! local   current  pre     │ start  download  update  pre-download
//! ────────────────────────┼──────────────────────────────────────
//! None    1.2.0    -       │   -       ✓         -         -
//! 1.1.0   1.2.0    -       │   -       -         ✓         -
//! 1.2.0   1.2.0    1.3.0   │   ✓       -         -         ✓
//! any     None     any     │   -       -         -         -      (remote unknown)
//! ```
//!
//! Repair is independent of versions except for the optional "must be
//! installed" requirement in [`RepairPolicy`].

use semver::BuildMetadata;
use serde::{Deserialize, Serialize};

use crate::error::LauncherError;
use crate::types::InstallationRecord;

pub use semver::Version;

/// Parses a game version, accepting the two- and four-part forms game
/// metadata uses.
///
/// Missing components are zero. A fourth component is kept as build metadata;
/// `semver` still orders `1.0.0+7` after `1.0.0`, so revisions compare as expected.
pub fn parse_version(raw: &str) -> Result<Version, LauncherError> {
    let trimmed = raw.trim();
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return Err(LauncherError::InvalidVersion(raw.to_string()));
    }

    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(parts.iter()) {
        *slot = part
            .parse()
            .map_err(|_| LauncherError::InvalidVersion(raw.to_string()))?;
    }

    let mut version = Version::new(numbers[0], numbers[1], numbers[2]);
    if let Some(revision) = parts.get(3) {
        if revision.parse::<u64>().is_err() {
            return Err(LauncherError::InvalidVersion(raw.to_string()));
        }
        version.build = BuildMetadata::new(revision)
            .map_err(|_| LauncherError::InvalidVersion(raw.to_string()))?;
    }
    Ok(version)
}

/// How repair is offered for a game category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairPolicy {
    /// Whether this game category supports repair at all.
    pub enabled: bool,
    /// Only offer repair once a local version exists.
    pub requires_install: bool,
    /// Which voice-language selection the repair worker receives.
    pub language: RepairLanguage,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            requires_install: true,
            language: RepairLanguage::Detected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairLanguage {
    /// Pass whatever the installation reports, even an empty selection.
    #[default]
    Detected,
    /// Normalize exactly like a fresh download (empty selection becomes all).
    SameAsDownload,
}

/// Which lifecycle actions are currently permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EligibilityFlags {
    pub can_start: bool,
    pub can_download: bool,
    pub can_update: bool,
    pub can_pre_download: bool,
    pub can_repair: bool,
}

/// Derives the eligibility flags. Pure; never touches disk or network.
pub fn derive(
    local: Option<&Version>,
    current: Option<&Version>,
    pre: Option<&Version>,
    repair: &RepairPolicy,
) -> EligibilityFlags {
    let can_repair = repair.enabled && (!repair.requires_install || local.is_some());

    // Unknown remote state: everything version-driven is disabled.
    let Some(current) = current else {
        return EligibilityFlags {
            can_repair,
            ..EligibilityFlags::default()
        };
    };

    EligibilityFlags {
        can_start: local.is_some_and(|l| l >= current),
        can_download: local.is_none(),
        can_update: local.is_some_and(|l| current > l),
        can_pre_download: local.is_some() && pre.is_some(),
        can_repair,
    }
}

/// Convenience wrapper over [`derive`] for a full record.
pub fn derive_for(record: &InstallationRecord, repair: &RepairPolicy) -> EligibilityFlags {
    derive(
        record.local_version.as_ref(),
        record.current_version.as_ref(),
        record.pre_version.as_ref(),
        repair,
    )
}

/// Sub-state of an idle installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    NeedsDownload,
    NeedsUpdate,
    PreDownloadAvailable,
    UpToDate,
    /// Remote versions have not been read (or could not be).
    Unknown,
}

impl IdleState {
    pub fn classify(flags: &EligibilityFlags) -> Self {
        if flags.can_download {
            IdleState::NeedsDownload
        } else if flags.can_update {
            IdleState::NeedsUpdate
        } else if flags.can_pre_download {
            IdleState::PreDownloadAvailable
        } else if flags.can_start {
            IdleState::UpToDate
        } else {
            IdleState::Unknown
        }
    }
}

/// The single action the primary button performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryAction {
    Download,
    Update,
    Start,
    GameRunning,
    Unavailable,
}

impl PrimaryAction {
    pub fn select(flags: &EligibilityFlags, game_running: bool) -> Self {
        if flags.can_download {
            PrimaryAction::Download
        } else if flags.can_update {
            PrimaryAction::Update
        } else if game_running {
            PrimaryAction::GameRunning
        } else if flags.can_start {
            PrimaryAction::Start
        } else {
            PrimaryAction::Unavailable
        }
    }
}
