//! LifecycleOrchestrator - per-game state machine.
//!
//! Owns the [`InstallationRecord`] for one game identity and sequences every
//! user-facing action against it:
//!
//! ```text
//! Uninitialized ──refresh──▶ Idle(IdleState) ──start_game──▶ Starting ──▶ Running{pid}
//!                               ▲                                            │
//!                               └──────────────── Exited ◀───── process exit ┘
//! ```
//!
//! Downloads, pre-downloads and repairs never change the phase: they go
//! through the [`InstanceGate`] and hand off to an elevated worker.
//!
//! ## Threading
//!
//! All methods take `&self` and may be called from any thread. State lives
//! behind one mutex that is never held across collaborator calls (version
//! reads, process start, elevated spawn) or while calling into the
//! [`ProcessWatcher`]. Exit callbacks arrive on watcher threads and carry the
//! attach token they were created for, so a superseded process can never
//! move a newer one back to idle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LaunchError, LauncherError, Result};
use crate::gate::{GateOutcome, InstanceGate};
use crate::launcher::PrivilegedLauncher;
use crate::process::{ProcessWatcher, SharedHandle, WatchId, DEFAULT_POLL_INTERVAL};
use crate::types::{GameIdentity, InstallationRecord, Operation, VoiceLanguage};
use crate::version::{
    derive_for, EligibilityFlags, IdleState, PrimaryAction, RepairLanguage, RepairPolicy, Version,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborators
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersions {
    pub current: Version,
    pub pre: Option<Version>,
}

/// Reads installation and remote version metadata.
pub trait VersionSource: Send + Sync {
    fn install_path(&self, identity: &GameIdentity) -> Result<Option<PathBuf>>;

    /// `None` when nothing is installed at `install_path`.
    fn local_version(&self, identity: &GameIdentity, install_path: &std::path::Path) -> Result<Option<Version>>;

    fn remote_versions(&self, identity: &GameIdentity) -> Result<RemoteVersions>;

    fn pre_download_complete(
        &self,
        identity: &GameIdentity,
        install_path: &std::path::Path,
        pre: &Version,
    ) -> Result<bool>;

    fn voice_language(&self, identity: &GameIdentity, install_path: &std::path::Path) -> Result<VoiceLanguage>;
}

/// Finds and starts game processes.
pub trait ProcessSource: Send + Sync {
    fn find_running(&self, identity: &GameIdentity) -> Result<Option<SharedHandle>>;

    /// Starts the game from `install_path` (the source's own default when
    /// `None`). With `ignore_running` false, an already running instance may
    /// be returned instead of starting another.
    fn start(
        &self,
        identity: &GameIdentity,
        install_path: Option<&std::path::Path>,
        ignore_running: bool,
    ) -> Result<Option<SharedHandle>>;
}

/// Everything the orchestrator talks to, injected at construction.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub versions: Arc<dyn VersionSource>,
    pub processes: Arc<dyn ProcessSource>,
    pub gate: InstanceGate,
    pub launcher: PrivilegedLauncher,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub repair: RepairPolicy,
    /// Skip attaching to a game that is already running at startup.
    pub ignore_running_game: bool,
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            repair: RepairPolicy::default(),
            ignore_running_game: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Public State & Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum LifecyclePhase {
    Uninitialized,
    Idle { state: IdleState },
    Starting,
    Running { pid: u32 },
    Exited,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    PhaseChanged(LifecyclePhase),
    FlagsChanged(EligibilityFlags),
    LaunchStarted { operation: Operation, pid: u32 },
    LaunchFailed { operation: Operation, message: String },
    Redirected { operation: Operation, holder_pid: u32 },
    ProcessExited { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied,
    /// A newer refresh started before this one finished; its results were
    /// discarded.
    Superseded,
    /// Applied, but at least one read failed and the affected affordances
    /// are disabled.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    /// Another start is in progress.
    InProgress,
    NotEligible,
    /// The process source did not produce a process.
    NotStarted,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadRequest {
    /// Explicit voice-language selection; detected from the installation
    /// when absent.
    pub language: Option<VoiceLanguage>,
    /// Run the worker's `repair` verb instead of `download`.
    pub repair_mode: bool,
}

#[derive(Debug)]
pub enum RequestOutcome {
    Launched { pid: u32 },
    /// Another launcher (or an in-flight request in this one) owns the
    /// operation.
    Redirected { holder_pid: u32 },
    NotEligible,
    InstallPathMissing,
    LaunchFailed(LaunchError),
    /// The instance registry could not be consulted.
    GateUnavailable,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════════

struct Tracking {
    token: u64,
    watch: Option<WatchId>,
}

struct State {
    record: InstallationRecord,
    phase: LifecyclePhase,
    /// Set by `set_install_path`; refreshes keep it instead of asking the
    /// version source.
    pinned_install_path: bool,
    tracking: Option<Tracking>,
}

struct Shared {
    identity: GameIdentity,
    config: LifecycleConfig,
    deps: OrchestratorDeps,
    watcher: ProcessWatcher,
    state: Mutex<State>,
    refresh_token: AtomicU64,
    attach_token: AtomicU64,
    subscribers: Mutex<Vec<Sender<LifecycleEvent>>>,
}

pub struct LifecycleOrchestrator {
    shared: Arc<Shared>,
}

impl LifecycleOrchestrator {
    pub fn new(identity: GameIdentity, config: LifecycleConfig, deps: OrchestratorDeps) -> Self {
        let watcher = ProcessWatcher::new(config.poll_interval);
        let record = InstallationRecord::new(identity.clone());
        Self {
            shared: Arc::new(Shared {
                identity,
                config,
                deps,
                watcher,
                state: Mutex::new(State {
                    record,
                    phase: LifecyclePhase::Uninitialized,
                    pinned_install_path: false,
                    tracking: None,
                }),
                refresh_token: AtomicU64::new(0),
                attach_token: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn identity(&self) -> &GameIdentity {
        &self.shared.identity
    }

    /// Receives every event emitted from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn record(&self) -> InstallationRecord {
        self.shared.state().record.clone()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.shared.state().phase
    }

    /// Recomputed from the record on every call.
    pub fn flags(&self) -> EligibilityFlags {
        self.shared.flags()
    }

    pub fn primary_action(&self) -> PrimaryAction {
        PrimaryAction::select(&self.flags(), self.shared.watcher.is_running())
    }

    pub fn tracked_pid(&self) -> Option<u32> {
        self.shared.watcher.tracked_pid()
    }

    pub fn is_game_running(&self) -> bool {
        self.shared.watcher.is_running()
    }

    /// Reads versions and, unless configured otherwise, attaches to a game
    /// that is already running.
    pub fn initialize(&self) -> RefreshOutcome {
        let outcome = self.refresh_versions();
        if self.shared.config.ignore_running_game || self.shared.watcher.is_running() {
            return outcome;
        }
        match self.shared.deps.processes.find_running(&self.shared.identity) {
            Ok(Some(handle)) => {
                info!(biz = %self.shared.identity, pid = handle.pid(), "Attaching to running game");
                Shared::track(&self.shared, handle);
            }
            Ok(None) => {}
            Err(err) => warn!(biz = %self.shared.identity, error = %err, "Failed to look for a running game"),
        }
        outcome
    }

    /// Re-reads all version information. The most recent call wins; results
    /// of older calls that finish later are discarded.
    pub fn refresh_versions(&self) -> RefreshOutcome {
        self.shared.refresh_versions()
    }

    pub fn refresh_in_background(&self) -> Result<JoinHandle<RefreshOutcome>> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("refresh-{}", self.shared.identity))
            .spawn(move || shared.refresh_versions())
            .map_err(|err| LauncherError::io("spawn refresh thread", err))
    }

    /// Uses `path` as the install path from now on and refreshes.
    pub fn set_install_path(&self, path: Option<PathBuf>) -> RefreshOutcome {
        let token = {
            let mut state = self.shared.state();
            state.pinned_install_path = path.is_some();
            state.record.install_path = path;
            // Refreshes already in flight read the old path; retire them
            // before anyone can observe the new one.
            self.shared.next_refresh_token()
        };
        self.shared.refresh_with_token(token)
    }

    pub fn start_game(&self, ignore_running_instance: bool) -> StartOutcome {
        let shared = &self.shared;
        if !ignore_running_instance {
            if let Some(pid) = shared.watcher.tracked_pid() {
                return StartOutcome::AlreadyRunning { pid };
            }
        }
        if !shared.flags().can_start {
            return StartOutcome::NotEligible;
        }

        let restore = {
            let mut state = shared.state();
            if state.phase == LifecyclePhase::Starting {
                return StartOutcome::InProgress;
            }
            let previous = state.phase;
            shared.set_phase(&mut state, LifecyclePhase::Starting);
            previous
        };

        let install_path = shared.state().record.install_path.clone();
        match shared
            .deps
            .processes
            .start(&shared.identity, install_path.as_deref(), ignore_running_instance)
        {
            Ok(Some(handle)) => {
                let pid = handle.pid();
                info!(biz = %shared.identity, pid, "Game started");
                Shared::track(shared, handle);
                StartOutcome::Started { pid }
            }
            Ok(None) => {
                shared.leave_starting(restore);
                StartOutcome::NotStarted
            }
            Err(err) => {
                warn!(biz = %shared.identity, error = %err, "Failed to start game");
                shared.leave_starting(restore);
                StartOutcome::Failed(err.to_string())
            }
        }
    }

    /// Downloads (or updates) the game in an elevated worker.
    pub fn request_download(&self, request: DownloadRequest) -> RequestOutcome {
        let flags = self.flags();
        let eligible = flags.can_download || flags.can_update;
        self.shared.dispatch(
            Operation::Download,
            eligible,
            request.repair_mode,
            |detected| request.language.unwrap_or(detected).or_all(),
        )
    }

    /// Starts the pre-download, or verifies it when it already finished.
    pub fn request_pre_download(&self, language: Option<VoiceLanguage>) -> RequestOutcome {
        let eligible = self.flags().can_pre_download;
        let complete = self.shared.state().record.pre_download_complete;
        if complete {
            debug!(biz = %self.shared.identity, "Pre-download complete; launching verification");
            // Verification must cover exactly the packs that were downloaded.
            self.shared.dispatch(Operation::PreDownload, eligible, false, |detected| detected)
        } else {
            self.shared.dispatch(Operation::PreDownload, eligible, false, |detected| {
                language.unwrap_or(detected).or_all()
            })
        }
    }

    pub fn request_repair(&self, language: Option<VoiceLanguage>) -> RequestOutcome {
        let eligible = self.flags().can_repair;
        let policy = self.shared.config.repair.language;
        self.shared.dispatch(Operation::Repair, eligible, false, |detected| {
            let language = language.unwrap_or(detected);
            match policy {
                RepairLanguage::Detected => language,
                RepairLanguage::SameAsDownload => language.or_all(),
            }
        })
    }

    /// Exit notification for the attachment identified by `token`. Stale
    /// tokens are ignored.
    pub fn on_process_exited(&self, token: u64) {
        self.shared.on_process_exited(token);
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn flags(&self) -> EligibilityFlags {
        derive_for(&self.state().record, &self.config.repair)
    }

    fn emit(&self, event: LifecycleEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_phase(&self, state: &mut State, phase: LifecyclePhase) {
        if state.phase == phase {
            return;
        }
        debug!(biz = %self.identity, from = ?state.phase, to = ?phase, "Phase changed");
        state.phase = phase;
        self.emit(LifecycleEvent::PhaseChanged(phase));
    }

    fn idle_phase(&self, state: &State) -> LifecyclePhase {
        LifecyclePhase::Idle {
            state: IdleState::classify(&derive_for(&state.record, &self.config.repair)),
        }
    }

    fn leave_starting(&self, previous: LifecyclePhase) {
        let mut state = self.state();
        if state.phase != LifecyclePhase::Starting {
            return;
        }
        let phase = match previous {
            LifecyclePhase::Uninitialized => LifecyclePhase::Uninitialized,
            _ => self.idle_phase(&state),
        };
        self.set_phase(&mut state, phase);
    }

    fn next_refresh_token(&self) -> u64 {
        self.refresh_token.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn refresh_versions(&self) -> RefreshOutcome {
        self.refresh_with_token(self.next_refresh_token())
    }

    fn refresh_with_token(&self, token: u64) -> RefreshOutcome {
        let identity = &self.identity;
        let versions = &self.deps.versions;
        let mut degraded = false;

        let (pinned, previous_path) = {
            let state = self.state();
            (state.pinned_install_path, state.record.install_path.clone())
        };
        let install_path = if pinned {
            previous_path
        } else {
            match versions.install_path(identity) {
                Ok(path) => path,
                Err(err) => {
                    warn!(biz = %identity, error = %err, "Failed to read install path");
                    degraded = true;
                    previous_path
                }
            }
        };

        let local = match &install_path {
            Some(path) => match versions.local_version(identity, path) {
                Ok(version) => Some(version),
                Err(err) => {
                    warn!(biz = %identity, error = %err, "Failed to read local version");
                    degraded = true;
                    None
                }
            },
            None => Some(None),
        };

        let remote = match versions.remote_versions(identity) {
            Ok(remote) => Some(remote),
            Err(err) => {
                warn!(biz = %identity, error = %err, "Failed to read remote versions");
                degraded = true;
                None
            }
        };

        let pre = remote.as_ref().and_then(|remote| remote.pre.clone());
        let pre_download_complete = match (&install_path, &pre) {
            (Some(path), Some(pre)) => versions
                .pre_download_complete(identity, path, pre)
                .unwrap_or_else(|err| {
                    warn!(biz = %identity, error = %err, "Failed to check pre-download state");
                    false
                }),
            _ => false,
        };

        let mut state = self.state();
        if self.refresh_token.load(Ordering::SeqCst) != token {
            debug!(biz = %identity, token, "Discarding superseded version refresh");
            return RefreshOutcome::Superseded;
        }

        let before = derive_for(&state.record, &self.config.repair);
        let pinned = state.pinned_install_path;
        let record = &mut state.record;
        if !pinned {
            record.install_path = install_path;
        }
        match local {
            Some(local) => {
                record.local_version = local;
                record.current_version = remote.map(|remote| remote.current);
            }
            None => {
                // Without a trustworthy local version nothing version-driven
                // can be offered; keep the last known one for display.
                record.current_version = None;
            }
        }
        record.pre_version = pre;
        record.pre_download_complete = pre_download_complete;

        let after = derive_for(&state.record, &self.config.repair);
        if after != before {
            self.emit(LifecycleEvent::FlagsChanged(after));
        }
        if matches!(
            state.phase,
            LifecyclePhase::Uninitialized | LifecyclePhase::Idle { .. } | LifecyclePhase::Exited
        ) {
            let idle = self.idle_phase(&state);
            self.set_phase(&mut state, idle);
        }
        drop(state);

        debug!(biz = %identity, ?after, degraded, "Versions refreshed");
        if degraded {
            RefreshOutcome::Degraded
        } else {
            RefreshOutcome::Applied
        }
    }

    /// Hands `handle` to the watcher and moves to `Running`.
    fn track(self: &Arc<Self>, handle: SharedHandle) -> u64 {
        let token = self.attach_token.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = handle.pid();
        {
            let mut state = self.state();
            state.tracking = Some(Tracking { token, watch: None });
            self.set_phase(&mut state, LifecyclePhase::Running { pid });
        }

        let weak: Weak<Shared> = Arc::downgrade(self);
        let watch = self.watcher.attach(handle, move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_process_exited(token);
            }
        });

        let current = {
            let mut state = self.state();
            match state.tracking.as_mut() {
                Some(tracking) if tracking.token == token => {
                    tracking.watch = Some(watch);
                    true
                }
                _ => false,
            }
        };
        if !current {
            // Exited (or was replaced) while attaching.
            self.watcher.detach_watch(watch);
        }
        token
    }

    fn on_process_exited(&self, token: u64) {
        let (pid, watch) = {
            let mut state = self.state();
            match &state.tracking {
                Some(tracking) if tracking.token == token => {}
                _ => {
                    debug!(biz = %self.identity, token, "Ignoring exit of superseded process");
                    return;
                }
            }
            let watch = state.tracking.take().and_then(|tracking| tracking.watch);
            let pid = match state.phase {
                LifecyclePhase::Running { pid } => Some(pid),
                _ => None,
            };
            self.set_phase(&mut state, LifecyclePhase::Exited);
            if let Some(pid) = pid {
                self.emit(LifecycleEvent::ProcessExited { pid });
            }
            let idle = self.idle_phase(&state);
            self.set_phase(&mut state, idle);
            (pid, watch)
        };

        info!(biz = %self.identity, pid = ?pid, "Game exited");
        if let Some(watch) = watch {
            self.watcher.detach_watch(watch);
        }
    }

    /// Shared path of every elevated request: gate, resolve, launch, release.
    fn dispatch<F>(&self, operation: Operation, eligible: bool, repair_mode: bool, language: F) -> RequestOutcome
    where
        F: FnOnce(VoiceLanguage) -> VoiceLanguage,
    {
        let identity = &self.identity;
        if !eligible {
            debug!(biz = %identity, %operation, "Request not eligible");
            return RequestOutcome::NotEligible;
        }

        let claim = match self.deps.gate.try_acquire(operation, identity) {
            Ok(GateOutcome::Acquired(claim)) => claim,
            Ok(GateOutcome::Redirected(holder)) => {
                info!(biz = %identity, %operation, holder = holder.pid, "Operation already running elsewhere");
                self.emit(LifecycleEvent::Redirected {
                    operation,
                    holder_pid: holder.pid,
                });
                return RequestOutcome::Redirected { holder_pid: holder.pid };
            }
            Err(err) => {
                warn!(biz = %identity, %operation, error = %err, "Instance gate unavailable");
                return RequestOutcome::GateUnavailable;
            }
        };

        let outcome = self.launch_claimed(operation, repair_mode, language);
        if let Err(err) = claim.release() {
            warn!(biz = %identity, %operation, error = %err, "Failed to release instance claim");
        }
        outcome
    }

    fn launch_claimed<F>(&self, operation: Operation, repair_mode: bool, language: F) -> RequestOutcome
    where
        F: FnOnce(VoiceLanguage) -> VoiceLanguage,
    {
        let identity = &self.identity;
        let Some(install_path) = self.state().record.install_path.clone() else {
            return RequestOutcome::InstallPathMissing;
        };

        let detected = self
            .deps
            .versions
            .voice_language(identity, &install_path)
            .unwrap_or_else(|err| {
                warn!(biz = %identity, error = %err, "Failed to detect voice language");
                VoiceLanguage::NONE
            });
        let language = language(detected);

        match self
            .deps
            .launcher
            .launch(operation, identity, &install_path, language, repair_mode)
        {
            Ok(started) => {
                self.emit(LifecycleEvent::LaunchStarted {
                    operation,
                    pid: started.pid,
                });
                RequestOutcome::Launched { pid: started.pid }
            }
            Err(err) => {
                self.emit(LifecycleEvent::LaunchFailed {
                    operation,
                    message: err.user_message(),
                });
                RequestOutcome::LaunchFailed(err)
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
