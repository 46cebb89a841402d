//! Error types for launcher-core operations.
//!
//! Most of these never reach the user: the orchestrator catches collaborator
//! failures, logs them and degrades the affected affordance instead.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Launch Errors (surfaced to the user)
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an elevated worker could not be started.
///
/// None of these are retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Elevation was declined")]
    Declined,

    #[error("Launcher executable not found (tried {})", display_paths(.candidates))]
    ExecutableNotFound { candidates: Vec<PathBuf> },

    #[error("Failed to spawn elevated process: {message}")]
    SpawnFailed { code: Option<i32>, message: String },

    #[error("Install path must be absolute: {0}")]
    InvalidInstallPath(PathBuf),
}

impl LaunchError {
    /// A single actionable sentence for the front end.
    pub fn user_message(&self) -> String {
        match self {
            LaunchError::Declined => {
                "Administrator permission is required to modify the game files. Accept the prompt to continue."
                    .to_string()
            }
            LaunchError::ExecutableNotFound { .. } => {
                "The launcher executable could not be found. Reinstall the launcher and try again."
                    .to_string()
            }
            LaunchError::SpawnFailed { code, .. } => match code {
                Some(code) => format!("The download process could not be started (error {code})."),
                None => "The download process could not be started.".to_string(),
            },
            LaunchError::InvalidInstallPath(path) => format!(
                "The install folder {} is not a full path. Choose the folder again.",
                path.display()
            ),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal Error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur in launcher-core operations.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    // ─────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Version information unavailable for {identity}: {details}")]
    VersionUnavailable { identity: String, details: String },

    #[error("Exit notification denied for process {pid}")]
    ProcessAccessDenied { pid: u32 },

    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid game identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Invalid worker arguments: {0}")]
    InvalidWorkerArgs(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("No {field} configured for {identity}")]
    NotConfigured { identity: String, field: &'static str },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LauncherError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LauncherError::Io {
            context: context.into(),
            source,
        }
    }

    /// What the front end shows: the actionable launch message for launch
    /// failures, the plain description otherwise.
    pub fn user_message(&self) -> String {
        match self {
            LauncherError::Launch(err) => err.user_message(),
            other => other.to_string(),
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        LauncherError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using LauncherError.
pub type Result<T> = std::result::Result<T, LauncherError>;
