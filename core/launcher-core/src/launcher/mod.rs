//! Elevated worker dispatch.
//!
//! Downloads and repairs write into the install directory, which usually needs
//! administrator rights. Instead of elevating the launcher itself, we start a
//! second copy of the launcher executable with elevated privileges and a
//! worker command line:
//!
//! ```text
//! <executable> download --biz hk4e_global --loc "D:\Games\Genshin" --lang 2
//! <executable> repair   --biz hk4e_global --loc "D:\Games\Genshin" --lang 2
//! ```
//!
//! Launching is fire-and-forget: once the worker is running, the launcher has
//! no further say in it. Failures are reported once and never retried.

mod elevate;

pub use elevate::{OsElevatedSpawner, DEFAULT_ELEVATION_HELPER};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{LaunchError, LauncherError};
use crate::types::{GameIdentity, Operation, VoiceLanguage};

/// Subcommand the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerVerb {
    Download,
    Repair,
}

impl WorkerVerb {
    /// Download and pre-download both use `download`; repair mode overrides.
    pub fn for_operation(operation: Operation, repair_mode: bool) -> Self {
        match operation {
            Operation::Repair => WorkerVerb::Repair,
            Operation::Download | Operation::PreDownload if repair_mode => WorkerVerb::Repair,
            Operation::Download | Operation::PreDownload => WorkerVerb::Download,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerVerb::Download => "download",
            WorkerVerb::Repair => "repair",
        }
    }
}

impl fmt::Display for WorkerVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed form of the worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub verb: WorkerVerb,
    pub identity: GameIdentity,
    pub install_path: PathBuf,
    pub language: VoiceLanguage,
}

impl WorkerArgs {
    /// Argument vector, one element per token.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.verb.as_str().to_string(),
            "--biz".to_string(),
            self.identity.to_string(),
            "--loc".to_string(),
            self.install_path.display().to_string(),
            "--lang".to_string(),
            self.language.bits().to_string(),
        ]
    }

    /// Flat parameter string for APIs that take one (ShellExecute). The
    /// location is quoted since install paths routinely contain spaces.
    pub fn to_command_line(&self) -> String {
        format!(
            "{} --biz {} --loc \"{}\" --lang {}",
            self.verb,
            self.identity,
            self.install_path.display(),
            self.language.bits()
        )
    }

    /// Parses an argument vector produced by [`to_args`](Self::to_args) or by
    /// splitting [`to_command_line`](Self::to_command_line).
    pub fn parse<I, S>(args: I) -> Result<Self, LauncherError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let verb = match args.next().as_ref().map(AsRef::as_ref) {
            Some("download") => WorkerVerb::Download,
            Some("repair") => WorkerVerb::Repair,
            Some(other) => {
                return Err(LauncherError::InvalidWorkerArgs(format!("unknown verb {other:?}")))
            }
            None => return Err(LauncherError::InvalidWorkerArgs("missing verb".to_string())),
        };

        let mut identity = None;
        let mut install_path = None;
        let mut language = None;
        while let Some(flag) = args.next() {
            let flag = flag.as_ref();
            let value = args
                .next()
                .ok_or_else(|| LauncherError::InvalidWorkerArgs(format!("{flag} needs a value")))?;
            let value = value.as_ref();
            match flag {
                "--biz" => identity = Some(GameIdentity::new(value)?),
                "--loc" => install_path = Some(PathBuf::from(value)),
                "--lang" => {
                    let bits = value.parse::<u32>().map_err(|_| {
                        LauncherError::InvalidWorkerArgs(format!("--lang expects an integer, got {value:?}"))
                    })?;
                    language = Some(VoiceLanguage::from_bits(bits));
                }
                other => {
                    return Err(LauncherError::InvalidWorkerArgs(format!("unknown flag {other:?}")))
                }
            }
        }

        Ok(Self {
            verb,
            identity: identity.ok_or_else(|| missing("--biz"))?,
            install_path: install_path.ok_or_else(|| missing("--loc"))?,
            language: language.ok_or_else(|| missing("--lang"))?,
        })
    }

    /// Parses the flat form, honouring double quotes.
    pub fn parse_command_line(line: &str) -> Result<Self, LauncherError> {
        Self::parse(split_command_line(line))
    }
}

fn missing(flag: &str) -> LauncherError {
    LauncherError::InvalidWorkerArgs(format!("missing {flag}"))
}

fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Finds the executable to run as the worker.
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    primary: Option<PathBuf>,
    base_dir: PathBuf,
    fallback_name: String,
}

impl ExecutableLocator {
    pub fn new(primary: Option<PathBuf>, base_dir: impl Into<PathBuf>, fallback_name: impl Into<String>) -> Self {
        Self {
            primary,
            base_dir: base_dir.into(),
            fallback_name: fallback_name.into(),
        }
    }

    /// Locator for the running binary, falling back to `fallback_name` next
    /// to it.
    pub fn from_current_process(fallback_name: impl Into<String>) -> Self {
        let primary = std::env::current_exe().ok();
        let base_dir = primary
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        Self::new(primary, base_dir, fallback_name)
    }

    pub fn resolve(&self) -> Result<PathBuf, LaunchError> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(primary) = &self.primary {
            if primary.is_file() {
                return Ok(primary.clone());
            }
            candidates.push(primary.clone());
        }

        let fallback = self.base_dir.join(&self.fallback_name);
        if fallback.is_file() {
            debug!(path = %fallback.display(), "Using fallback launcher executable");
            return Ok(fallback);
        }
        candidates.push(fallback);
        Err(LaunchError::ExecutableNotFound { candidates })
    }
}

/// Requests elevation and starts `executable` with the worker arguments.
pub trait ElevatedSpawner: Send + Sync {
    /// Returns the PID of the started process (0 when the platform does not
    /// report one).
    fn spawn_elevated(&self, executable: &Path, args: &WorkerArgs) -> Result<u32, LaunchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchStarted {
    pub pid: u32,
    pub executable: PathBuf,
    pub args: WorkerArgs,
}

#[derive(Clone)]
pub struct PrivilegedLauncher {
    locator: ExecutableLocator,
    spawner: Arc<dyn ElevatedSpawner>,
}

impl PrivilegedLauncher {
    pub fn new(locator: ExecutableLocator, spawner: Arc<dyn ElevatedSpawner>) -> Self {
        Self { locator, spawner }
    }

    pub fn launch(
        &self,
        operation: Operation,
        identity: &GameIdentity,
        install_path: &Path,
        language: VoiceLanguage,
        repair_mode: bool,
    ) -> Result<LaunchStarted, LaunchError> {
        if !install_path.is_absolute() {
            return Err(LaunchError::InvalidInstallPath(install_path.to_path_buf()));
        }

        let executable = self.locator.resolve()?;
        let args = WorkerArgs {
            verb: WorkerVerb::for_operation(operation, repair_mode),
            identity: identity.clone(),
            install_path: install_path.to_path_buf(),
            language,
        };

        match self.spawner.spawn_elevated(&executable, &args) {
            Ok(pid) => {
                info!(
                    pid,
                    biz = %identity,
                    verb = %args.verb,
                    executable = %executable.display(),
                    "Elevated worker started"
                );
                Ok(LaunchStarted {
                    pid,
                    executable,
                    args,
                })
            }
            Err(err) => {
                warn!(biz = %identity, verb = %args.verb, error = %err, "Elevated worker launch failed");
                Err(err)
            }
        }
    }
}
