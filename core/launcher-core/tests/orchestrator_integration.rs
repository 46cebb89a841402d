//! Integration tests for the lifecycle orchestrator against fake collaborators.

use launcher_core::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OWN_PID: u32 = 1000;
const WORKER_PID: u32 = 4242;

fn v(raw: &str) -> Version {
    parse_version(raw).unwrap()
}

fn identity() -> GameIdentity {
    GameIdentity::new("hk4e_global").unwrap()
}

fn install_dir() -> PathBuf {
    std::env::temp_dir().join("Genshin Impact")
}

// ─────────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────────

struct ScriptedVersions {
    install_path: Mutex<Option<PathBuf>>,
    local: Mutex<Option<Version>>,
    remote: Mutex<std::result::Result<RemoteVersions, String>>,
    pre_complete: AtomicBool,
    language: Mutex<VoiceLanguage>,
    /// When set, the next `remote_versions` call reads its answer, reports
    /// `entered`, then waits for `release` before returning.
    hold: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl ScriptedVersions {
    fn new(local: Option<&str>, current: Option<&str>, pre: Option<&str>) -> Arc<Self> {
        let remote = match current {
            Some(current) => Ok(RemoteVersions {
                current: v(current),
                pre: pre.map(v),
            }),
            None => Err("resource index unreachable".to_string()),
        };
        Arc::new(Self {
            install_path: Mutex::new(Some(install_dir())),
            local: Mutex::new(local.map(v)),
            remote: Mutex::new(remote),
            pre_complete: AtomicBool::new(false),
            language: Mutex::new(VoiceLanguage::NONE),
            hold: Mutex::new(None),
        })
    }

    fn set_remote(&self, current: &str, pre: Option<&str>) {
        *self.remote.lock().unwrap() = Ok(RemoteVersions {
            current: v(current),
            pre: pre.map(v),
        });
    }
}

impl VersionSource for ScriptedVersions {
    fn install_path(&self, _: &GameIdentity) -> Result<Option<PathBuf>> {
        Ok(self.install_path.lock().unwrap().clone())
    }

    fn local_version(&self, _: &GameIdentity, _: &Path) -> Result<Option<Version>> {
        Ok(self.local.lock().unwrap().clone())
    }

    fn remote_versions(&self, identity: &GameIdentity) -> Result<RemoteVersions> {
        let answer = self.remote.lock().unwrap().clone();
        let hold = self.hold.lock().unwrap().take();
        if let Some((entered, release)) = hold {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        answer.map_err(|details| LauncherError::VersionUnavailable {
            identity: identity.to_string(),
            details,
        })
    }

    fn pre_download_complete(&self, _: &GameIdentity, _: &Path, _: &Version) -> Result<bool> {
        Ok(self.pre_complete.load(Ordering::SeqCst))
    }

    fn voice_language(&self, _: &GameIdentity, _: &Path) -> Result<VoiceLanguage> {
        Ok(*self.language.lock().unwrap())
    }
}

/// A game process whose exit the test controls. Exit notification is
/// available unless `deny` is set.
struct FakeGame {
    pid: u32,
    exited: AtomicBool,
    deny: bool,
    notify: Mutex<Option<ExitNotifier>>,
}

impl FakeGame {
    fn new(pid: u32, deny: bool) -> Arc<Self> {
        Arc::new(Self {
            pid,
            exited: AtomicBool::new(false),
            deny,
            notify: Mutex::new(None),
        })
    }

    fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
        let notify = self.notify.lock().unwrap().take();
        if let Some(notify) = notify {
            notify();
        }
    }
}

impl ProcessHandle for FakeGame {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn name(&self) -> &str {
        "GenshinImpact.exe"
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn subscribe_exit(&self, notify: ExitNotifier) -> Result<()> {
        if self.deny {
            return Err(LauncherError::ProcessAccessDenied { pid: self.pid });
        }
        *self.notify.lock().unwrap() = Some(notify);
        Ok(())
    }
}

#[derive(Default)]
struct FakeProcesses {
    running: Mutex<Option<Arc<FakeGame>>>,
    next: Mutex<Vec<Arc<FakeGame>>>,
    started_from: Mutex<Vec<Option<PathBuf>>>,
}

impl ProcessSource for FakeProcesses {
    fn find_running(&self, _: &GameIdentity) -> Result<Option<SharedHandle>> {
        Ok(self
            .running
            .lock()
            .unwrap()
            .clone()
            .map(|game| game as SharedHandle))
    }

    fn start(&self, _: &GameIdentity, install_path: Option<&Path>, _: bool) -> Result<Option<SharedHandle>> {
        self.started_from
            .lock()
            .unwrap()
            .push(install_path.map(Path::to_path_buf));
        Ok(self.next.lock().unwrap().pop().map(|game| game as SharedHandle))
    }
}

#[derive(Default)]
struct RecordingSpawner {
    calls: Mutex<Vec<WorkerArgs>>,
    decline: AtomicBool,
}

impl ElevatedSpawner for RecordingSpawner {
    fn spawn_elevated(&self, _: &Path, args: &WorkerArgs) -> std::result::Result<u32, LaunchError> {
        if self.decline.load(Ordering::SeqCst) {
            return Err(LaunchError::Declined);
        }
        self.calls.lock().unwrap().push(args.clone());
        Ok(WORKER_PID)
    }
}

struct Harness {
    orchestrator: LifecycleOrchestrator,
    processes: Arc<FakeProcesses>,
    spawner: Arc<RecordingSpawner>,
    registry: Arc<MemoryRegistry>,
    gate: InstanceGate,
    _exe_dir: tempfile::TempDir,
}

fn harness(versions: Arc<ScriptedVersions>, config: LifecycleConfig) -> Harness {
    let exe_dir = tempfile::tempdir().unwrap();
    std::fs::write(exe_dir.path().join("launcherctl"), b"").unwrap();

    let processes = Arc::new(FakeProcesses::default());
    let spawner = Arc::new(RecordingSpawner::default());
    let registry = Arc::new(MemoryRegistry::new(OWN_PID));
    let gate = InstanceGate::new(registry.clone());
    let deps = OrchestratorDeps {
        versions,
        processes: processes.clone(),
        gate: gate.clone(),
        launcher: PrivilegedLauncher::new(
            // Primary path deliberately missing: the fallback must be used.
            ExecutableLocator::new(Some(exe_dir.path().join("moved-away")), exe_dir.path(), "launcherctl"),
            spawner.clone(),
        ),
    };
    Harness {
        orchestrator: LifecycleOrchestrator::new(identity(), config, deps),
        processes,
        spawner,
        registry,
        gate,
        _exe_dir: exe_dir,
    }
}

fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn repair_config(language: RepairLanguage) -> LifecycleConfig {
    LifecycleConfig {
        repair: RepairPolicy {
            enabled: true,
            requires_install: true,
            language,
        },
        ..fast_config()
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

// ─────────────────────────────────────────────────────────────────────────────
// Version state
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_fresh_install_offers_download() {
    let h = harness(ScriptedVersions::new(None, Some("1.2.0"), None), fast_config());
    assert_eq!(h.orchestrator.refresh_versions(), RefreshOutcome::Applied);

    let flags = h.orchestrator.flags();
    assert!(!flags.can_start);
    assert!(flags.can_download);
    assert!(!flags.can_update);
    assert!(!flags.can_pre_download);
    assert_eq!(h.orchestrator.primary_action(), PrimaryAction::Download);
    assert_eq!(
        h.orchestrator.phase(),
        LifecyclePhase::Idle {
            state: IdleState::NeedsDownload
        }
    );
}

#[test]
fn test_current_install_with_pre_release_offers_start_and_pre_download() {
    let h = harness(
        ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), Some("1.3.0")),
        fast_config(),
    );
    h.orchestrator.refresh_versions();

    let flags = h.orchestrator.flags();
    assert!(flags.can_start);
    assert!(!flags.can_download);
    assert!(!flags.can_update);
    assert!(flags.can_pre_download);
    assert_eq!(h.orchestrator.primary_action(), PrimaryAction::Start);
}

#[test]
fn test_outdated_install_offers_update() {
    let h = harness(ScriptedVersions::new(Some("1.1.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();

    let flags = h.orchestrator.flags();
    assert!(!flags.can_start);
    assert!(!flags.can_download);
    assert!(flags.can_update);
    assert_eq!(h.orchestrator.primary_action(), PrimaryAction::Update);
}

#[test]
fn test_remote_failure_disables_actions_but_keeps_local_version() {
    let versions = ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None);
    let h = harness(versions.clone(), fast_config());
    h.orchestrator.refresh_versions();
    assert!(h.orchestrator.flags().can_start);

    *versions.remote.lock().unwrap() = Err("timeout".to_string());
    let events = h.orchestrator.subscribe();
    assert_eq!(h.orchestrator.refresh_versions(), RefreshOutcome::Degraded);

    assert_eq!(h.orchestrator.flags(), EligibilityFlags::default());
    let record = h.orchestrator.record();
    assert_eq!(record.local_version, Some(v("1.2.0")));
    assert_eq!(record.current_version, None);
    assert_eq!(
        events.try_recv().unwrap(),
        LifecycleEvent::FlagsChanged(EligibilityFlags::default())
    );
}

#[test]
fn test_superseded_refresh_is_discarded() {
    let versions = ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None);
    let h = harness(versions.clone(), fast_config());

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *versions.hold.lock().unwrap() = Some((entered_tx, release_rx));

    let slow = h.orchestrator.refresh_in_background().unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    versions.set_remote("1.3.0", None);
    assert_eq!(h.orchestrator.refresh_versions(), RefreshOutcome::Applied);

    release_tx.send(()).unwrap();
    assert_eq!(slow.join().unwrap(), RefreshOutcome::Superseded);
    assert_eq!(h.orchestrator.record().current_version, Some(v("1.3.0")));
    assert!(h.orchestrator.flags().can_update);
}

#[test]
fn test_set_install_path_overrides_source() {
    let versions = ScriptedVersions::new(None, Some("1.2.0"), None);
    *versions.install_path.lock().unwrap() = None;
    let h = harness(versions.clone(), fast_config());
    h.orchestrator.refresh_versions();
    assert_eq!(h.orchestrator.record().install_path, None);

    let chosen = std::env::temp_dir().join("Games").join("Genshin");
    h.orchestrator.set_install_path(Some(chosen.clone()));
    h.orchestrator.refresh_versions();
    assert_eq!(h.orchestrator.record().install_path, Some(chosen));
}

#[test]
fn test_refresh_in_flight_cannot_replace_pinned_install_path() {
    let versions = ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None);
    let h = harness(versions.clone(), fast_config());

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *versions.hold.lock().unwrap() = Some((entered_tx, release_rx));

    // Reads the source's install path, then stalls on the remote read.
    let slow = h.orchestrator.refresh_in_background().unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let chosen = std::env::temp_dir().join("Games").join("Pinned");
    h.orchestrator.set_install_path(Some(chosen.clone()));

    release_tx.send(()).unwrap();
    assert_eq!(slow.join().unwrap(), RefreshOutcome::Superseded);
    assert_eq!(h.orchestrator.record().install_path, Some(chosen.clone()));

    h.orchestrator.refresh_versions();
    assert_eq!(h.orchestrator.record().install_path, Some(chosen));
}

#[test]
fn test_start_uses_pinned_install_path() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    let chosen = std::env::temp_dir().join("Games").join("Pinned");
    h.orchestrator.set_install_path(Some(chosen.clone()));
    h.processes.next.lock().unwrap().push(FakeGame::new(51, false));

    assert_eq!(h.orchestrator.start_game(false), StartOutcome::Started { pid: 51 });
    assert_eq!(*h.processes.started_from.lock().unwrap(), vec![Some(chosen)]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Game process
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_exit_notification_returns_to_idle() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    let game = FakeGame::new(31, false);
    h.processes.next.lock().unwrap().push(game.clone());

    assert_eq!(h.orchestrator.start_game(false), StartOutcome::Started { pid: 31 });
    assert_eq!(h.orchestrator.tracked_pid(), Some(31));
    assert_eq!(h.orchestrator.start_game(false), StartOutcome::AlreadyRunning { pid: 31 });

    let events = h.orchestrator.subscribe();
    game.exit();
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![
            LifecycleEvent::PhaseChanged(LifecyclePhase::Exited),
            LifecycleEvent::ProcessExited { pid: 31 },
            LifecycleEvent::PhaseChanged(LifecyclePhase::Idle {
                state: IdleState::UpToDate
            }),
        ]
    );
    assert!(!h.orchestrator.is_game_running());
    assert_eq!(h.orchestrator.primary_action(), PrimaryAction::Start);
}

#[test]
fn test_polling_detects_exit_of_foreign_game() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    let game = FakeGame::new(32, true);
    *h.processes.running.lock().unwrap() = Some(game.clone());

    h.orchestrator.initialize();
    assert_eq!(h.orchestrator.phase(), LifecyclePhase::Running { pid: 32 });
    assert_eq!(h.orchestrator.primary_action(), PrimaryAction::GameRunning);

    game.exit();
    assert!(wait_for(|| matches!(
        h.orchestrator.phase(),
        LifecyclePhase::Idle { .. }
    )));
}

#[test]
fn test_ignore_running_game_skips_attach_on_initialize() {
    let config = LifecycleConfig {
        ignore_running_game: true,
        ..fast_config()
    };
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), config);
    *h.processes.running.lock().unwrap() = Some(FakeGame::new(33, true));

    h.orchestrator.initialize();
    assert!(!h.orchestrator.is_game_running());
    assert!(matches!(h.orchestrator.phase(), LifecyclePhase::Idle { .. }));
}

#[test]
fn test_superseded_process_exit_does_not_idle_newer_one() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    let first = FakeGame::new(41, false);
    let second = FakeGame::new(42, false);
    h.processes.next.lock().unwrap().extend([second.clone(), first.clone()]);

    assert_eq!(h.orchestrator.start_game(false), StartOutcome::Started { pid: 41 });
    assert_eq!(h.orchestrator.start_game(true), StartOutcome::Started { pid: 42 });

    first.exit();
    assert_eq!(h.orchestrator.phase(), LifecyclePhase::Running { pid: 42 });
    second.exit();
    assert!(matches!(h.orchestrator.phase(), LifecyclePhase::Idle { .. }));
}

#[test]
fn test_start_that_produces_no_process_restores_idle() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    assert_eq!(h.orchestrator.start_game(false), StartOutcome::NotStarted);
    assert_eq!(
        h.orchestrator.phase(),
        LifecyclePhase::Idle {
            state: IdleState::UpToDate
        }
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Elevated requests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_download_launches_worker_and_releases_claim() {
    let h = harness(ScriptedVersions::new(None, Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    let events = h.orchestrator.subscribe();

    let outcome = h.orchestrator.request_download(DownloadRequest::default());
    assert!(matches!(outcome, RequestOutcome::Launched { pid: WORKER_PID }));

    let calls = h.spawner.calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![WorkerArgs {
            verb: WorkerVerb::Download,
            identity: identity(),
            install_path: install_dir(),
            language: VoiceLanguage::ALL,
        }]
    );
    assert_eq!(h.registry.holder("download_game_hk4e_global"), None);
    assert_eq!(
        events.try_recv().unwrap(),
        LifecycleEvent::LaunchStarted {
            operation: Operation::Download,
            pid: WORKER_PID
        }
    );
}

#[test]
fn test_download_in_repair_mode_uses_repair_verb() {
    let h = harness(ScriptedVersions::new(Some("1.1.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();

    let outcome = h.orchestrator.request_download(DownloadRequest {
        language: Some(VoiceLanguage::JAPANESE),
        repair_mode: true,
    });
    assert!(matches!(outcome, RequestOutcome::Launched { .. }));
    let calls = h.spawner.calls.lock().unwrap();
    assert_eq!(calls[0].verb, WorkerVerb::Repair);
    assert_eq!(calls[0].language, VoiceLanguage::JAPANESE);
}

#[test]
fn test_download_while_claim_held_in_process_does_not_spawn() {
    let h = harness(ScriptedVersions::new(None, Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();

    let held = h.gate.try_acquire(Operation::Download, &identity()).unwrap();
    assert!(matches!(held, GateOutcome::Acquired(_)));

    let outcome = h.orchestrator.request_download(DownloadRequest::default());
    assert!(matches!(outcome, RequestOutcome::Redirected { holder_pid: OWN_PID }));
    assert!(h.spawner.calls.lock().unwrap().is_empty());
    drop(held);
}

#[test]
fn test_download_held_by_other_launcher_redirects_activation() {
    let h = harness(ScriptedVersions::new(None, Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();

    let other = InstanceGate::new(Arc::new(h.registry.with_owner(2000)));
    let GateOutcome::Acquired(claim) = other.try_acquire(Operation::Download, &identity()).unwrap()
    else {
        panic!("other launcher should hold the gate");
    };

    let outcome = h.orchestrator.request_pre_download(None);
    // Not eligible: nothing installed, so pre-download is off. Download is.
    assert!(matches!(outcome, RequestOutcome::NotEligible));

    let outcome = h.orchestrator.request_download(DownloadRequest::default());
    assert!(matches!(outcome, RequestOutcome::Redirected { holder_pid: 2000 }));
    assert!(h.spawner.calls.lock().unwrap().is_empty());

    let activations = claim.take_activations().unwrap();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].requested_by, OWN_PID);
    assert_eq!(activations[0].operation, Operation::Download);
}

/// Starts a "worker" that races its launcher for the gate, the way an
/// elevated process may reach `try_acquire` before `spawn_elevated` returns.
struct RacingWorkerSpawner {
    table: MemoryRegistry,
    worker: Mutex<Option<std::thread::JoinHandle<bool>>>,
}

impl ElevatedSpawner for RacingWorkerSpawner {
    fn spawn_elevated(&self, _: &Path, args: &WorkerArgs) -> std::result::Result<u32, LaunchError> {
        let gate = InstanceGate::new(Arc::new(self.table.with_owner(WORKER_PID).with_role(HolderRole::Worker)));
        let identity = args.identity.clone();
        let (registered_tx, registered_rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            registered_tx.send(()).unwrap();
            let outcome = gate
                .try_acquire_handoff(Operation::Download, &identity, Duration::from_secs(5))
                .unwrap();
            let acquired = matches!(outcome, GateOutcome::Acquired(_));
            // Keep the claim registered for the assertions below.
            std::mem::forget(outcome);
            acquired
        });
        registered_rx.recv().unwrap();
        // Give the worker time to find the launcher still holding the gate.
        std::thread::sleep(Duration::from_millis(150));
        *self.worker.lock().unwrap() = Some(worker);
        Ok(WORKER_PID)
    }
}

#[test]
fn test_worker_started_during_launch_takes_over_the_gate() {
    let exe_dir = tempfile::tempdir().unwrap();
    std::fs::write(exe_dir.path().join("launcherctl"), b"").unwrap();
    let registry = Arc::new(MemoryRegistry::new(OWN_PID));
    let spawner = Arc::new(RacingWorkerSpawner {
        table: registry.with_owner(OWN_PID),
        worker: Mutex::new(None),
    });
    let deps = OrchestratorDeps {
        versions: ScriptedVersions::new(None, Some("1.2.0"), None),
        processes: Arc::new(FakeProcesses::default()),
        gate: InstanceGate::new(registry.clone()),
        launcher: PrivilegedLauncher::new(
            ExecutableLocator::new(None, exe_dir.path(), "launcherctl"),
            spawner.clone(),
        ),
    };
    let orchestrator = LifecycleOrchestrator::new(identity(), fast_config(), deps);
    orchestrator.refresh_versions();

    let outcome = orchestrator.request_download(DownloadRequest::default());
    assert!(matches!(outcome, RequestOutcome::Launched { pid: WORKER_PID }));

    let worker = spawner.worker.lock().unwrap().take().unwrap();
    assert!(worker.join().unwrap(), "worker must not be turned away by its own launcher");
    assert_eq!(registry.holder("download_game_hk4e_global"), Some(WORKER_PID));

    // A second request now finds the worker and does not spawn another.
    let outcome = orchestrator.request_download(DownloadRequest::default());
    assert!(matches!(outcome, RequestOutcome::Redirected { holder_pid: WORKER_PID }));
}

#[test]
fn test_download_refused_when_up_to_date() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    assert!(matches!(
        h.orchestrator.request_download(DownloadRequest::default()),
        RequestOutcome::NotEligible
    ));
}

#[test]
fn test_download_without_install_path_releases_claim() {
    let versions = ScriptedVersions::new(None, Some("1.2.0"), None);
    *versions.install_path.lock().unwrap() = None;
    let h = harness(versions, fast_config());
    h.orchestrator.refresh_versions();

    assert!(matches!(
        h.orchestrator.request_download(DownloadRequest::default()),
        RequestOutcome::InstallPathMissing
    ));
    assert_eq!(h.registry.holder("download_game_hk4e_global"), None);
}

#[test]
fn test_declined_elevation_reports_and_releases() {
    let h = harness(ScriptedVersions::new(None, Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    h.spawner.decline.store(true, Ordering::SeqCst);
    let events = h.orchestrator.subscribe();

    let outcome = h.orchestrator.request_download(DownloadRequest::default());
    assert!(matches!(outcome, RequestOutcome::LaunchFailed(LaunchError::Declined)));
    assert_eq!(h.registry.holder("download_game_hk4e_global"), None);
    assert!(matches!(
        events.try_recv().unwrap(),
        LifecycleEvent::LaunchFailed {
            operation: Operation::Download,
            ..
        }
    ));

    // Not retried, but a second request may try again.
    h.spawner.decline.store(false, Ordering::SeqCst);
    assert!(matches!(
        h.orchestrator.request_download(DownloadRequest::default()),
        RequestOutcome::Launched { .. }
    ));
}

#[test]
fn test_pre_download_before_and_after_completion() {
    let versions = ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), Some("1.3.0"));
    *versions.language.lock().unwrap() = VoiceLanguage::NONE;
    let h = harness(versions.clone(), fast_config());
    h.orchestrator.refresh_versions();

    assert!(matches!(
        h.orchestrator.request_pre_download(None),
        RequestOutcome::Launched { .. }
    ));

    versions.pre_complete.store(true, Ordering::SeqCst);
    h.orchestrator.refresh_versions();
    assert!(h.orchestrator.record().pre_download_complete);
    assert!(matches!(
        h.orchestrator.request_pre_download(Some(VoiceLanguage::KOREAN)),
        RequestOutcome::Launched { .. }
    ));

    let calls = h.spawner.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|args| args.verb == WorkerVerb::Download));
    assert_eq!(calls[0].language, VoiceLanguage::ALL);
    // Verification runs with exactly the detected packs.
    assert_eq!(calls[1].language, VoiceLanguage::NONE);
}

#[test]
fn test_repair_follows_policy() {
    let h = harness(ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None), fast_config());
    h.orchestrator.refresh_versions();
    assert!(matches!(
        h.orchestrator.request_repair(None),
        RequestOutcome::NotEligible
    ));

    let h = harness(
        ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None),
        repair_config(RepairLanguage::Detected),
    );
    h.orchestrator.refresh_versions();
    assert!(matches!(
        h.orchestrator.request_repair(None),
        RequestOutcome::Launched { .. }
    ));
    assert_eq!(h.registry.holder("repair_game_hk4e_global"), None);

    let h = harness(
        ScriptedVersions::new(Some("1.2.0"), Some("1.2.0"), None),
        repair_config(RepairLanguage::SameAsDownload),
    );
    h.orchestrator.refresh_versions();
    h.orchestrator.request_repair(None);

    let calls = h.spawner.calls.lock().unwrap();
    assert_eq!(calls[0].verb, WorkerVerb::Repair);
    assert_eq!(calls[0].language, VoiceLanguage::ALL);
}

#[test]
fn test_repair_requires_install_when_configured() {
    let h = harness(
        ScriptedVersions::new(None, Some("1.2.0"), None),
        repair_config(RepairLanguage::Detected),
    );
    h.orchestrator.refresh_versions();
    assert!(!h.orchestrator.flags().can_repair);
    assert!(matches!(
        h.orchestrator.request_repair(None),
        RequestOutcome::NotEligible
    ));
}
