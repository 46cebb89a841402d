//! # launcher-core
//!
//! Game lifecycle and privileged operation dispatch for the launcher.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Background work runs on
//!   plain threads (exit waits, liveness polling, version refresh).
//! - **Thread-safe facade**: [`LifecycleOrchestrator`] methods take `&self` and
//!   may be called from any thread.
//! - **Graceful degradation**: Collaborator failures are logged and disable the
//!   affected actions; they are never fatal to the host process.
//! - **Injected collaborators**: Version metadata, process discovery, the
//!   instance registry and elevation are traits, so tests run against fakes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use launcher_core::*;
//!
//! let config = std::sync::Arc::new(LauncherConfig::load()?);
//! let deps = OrchestratorDeps {
//!     versions: Arc::new(ConfigVersionSource::new(config.clone())),
//!     processes: Arc::new(SysinfoProcessSource::new(config.clone())),
//!     gate: InstanceGate::new(Arc::new(LockDirRegistry::new(LockDirRegistry::default_base()))),
//!     launcher: PrivilegedLauncher::new(
//!         ExecutableLocator::from_current_process(&config.fallback_executable),
//!         Arc::new(OsElevatedSpawner::new(&config.elevation_helper)),
//!     ),
//! };
//! let game = LifecycleOrchestrator::new(identity.clone(), config.lifecycle(&identity), deps);
//! game.initialize();
//! game.start_game(false);
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod launcher;
pub mod orchestrator;
pub mod process;
pub mod sources;
pub mod types;
pub mod version;

pub use config::{launcher_home, GameConfig, LauncherConfig};
pub use error::{LaunchError, LauncherError, Result};
pub use gate::{
    instance_key, ActivationRequest, GateOutcome, HolderRole, InstanceClaim, InstanceGate,
    InstanceHolder, InstanceRegistry, LockDirRegistry, MemoryRegistry, Registration,
    DEFAULT_HANDOFF_WINDOW,
};
pub use launcher::{
    ElevatedSpawner, ExecutableLocator, LaunchStarted, OsElevatedSpawner, PrivilegedLauncher,
    WorkerArgs, WorkerVerb,
};
pub use orchestrator::{
    DownloadRequest, LifecycleConfig, LifecycleEvent, LifecycleOrchestrator, LifecyclePhase,
    OrchestratorDeps, ProcessSource, RefreshOutcome, RemoteVersions, RequestOutcome, StartOutcome,
    VersionSource,
};
pub use process::{
    ChildProcess, ExitNotifier, ForeignProcess, ProcessHandle, ProcessWatcher, SharedHandle, WatchId,
};
pub use sources::{ConfigVersionSource, SysinfoProcessSource};
pub use types::*;
pub use version::{
    derive, derive_for, parse_version, EligibilityFlags, IdleState, PrimaryAction, RepairLanguage,
    RepairPolicy, Version,
};
