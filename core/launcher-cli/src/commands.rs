//! Front-end commands: inspect state, start the game, request elevated work.

use std::sync::Arc;

use launcher_core::{
    instance_key, ConfigVersionSource, DownloadRequest, ExecutableLocator, GameIdentity, InstanceGate,
    InstanceRegistry, LauncherConfig, LauncherError, LifecycleEvent, LifecycleOrchestrator, LockDirRegistry,
    Operation, OrchestratorDeps, OsElevatedSpawner, PrivilegedLauncher, RequestOutcome,
    StartOutcome, SysinfoProcessSource, VoiceLanguage,
};
use serde_json::json;
use tracing::info;

use crate::error::{CliError, Result};

fn orchestrator(config: &Arc<LauncherConfig>, identity: &GameIdentity) -> LifecycleOrchestrator {
    let registry = LockDirRegistry::new(LockDirRegistry::default_base());
    let deps = OrchestratorDeps {
        versions: Arc::new(ConfigVersionSource::new(Arc::clone(config))),
        processes: Arc::new(SysinfoProcessSource::new(Arc::clone(config))),
        gate: InstanceGate::new(Arc::new(registry)),
        launcher: PrivilegedLauncher::new(
            ExecutableLocator::from_current_process(&config.fallback_executable),
            Arc::new(OsElevatedSpawner::new(&config.elevation_helper)),
        ),
    };
    let game = LifecycleOrchestrator::new(identity.clone(), config.lifecycle(identity), deps);
    game.initialize();
    game
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::Refused(format!("Failed to render output: {err}")))?;
    println!("{text}");
    Ok(())
}

pub fn status(config: &Arc<LauncherConfig>, identity: &GameIdentity) -> Result<()> {
    let game = orchestrator(config, identity);
    print_json(&json!({
        "record": game.record(),
        "flags": game.flags(),
        "phase": game.phase(),
        "primary_action": game.primary_action(),
        "tracked_pid": game.tracked_pid(),
    }))
}

pub fn start(config: &Arc<LauncherConfig>, identity: &GameIdentity, ignore_running: bool, wait: bool) -> Result<()> {
    let game = orchestrator(config, identity);
    let events = game.subscribe();
    let ignore_running = ignore_running || config.ignore_running_game;

    let pid = match game.start_game(ignore_running) {
        StartOutcome::Started { pid } => {
            println!("Started {identity} (pid {pid})");
            pid
        }
        StartOutcome::AlreadyRunning { pid } => {
            println!("{identity} is already running (pid {pid})");
            pid
        }
        StartOutcome::InProgress => return Err(CliError::Refused("A start is already in progress".into())),
        StartOutcome::NotEligible => {
            return Err(CliError::Refused(format!(
                "{identity} cannot be started right now ({:?})",
                game.primary_action()
            )))
        }
        StartOutcome::NotStarted => return Err(CliError::Refused("The game executable was not found".into())),
        StartOutcome::Failed(message) => return Err(CliError::Refused(message)),
    };

    if wait {
        info!(biz = %identity, pid, "Waiting for game to exit");
        for event in events.iter() {
            if let LifecycleEvent::ProcessExited { pid } = event {
                println!("{identity} exited (pid {pid})");
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum RequestKind {
    Download { repair_mode: bool },
    PreDownload,
    Repair,
}

pub fn request(
    config: &Arc<LauncherConfig>,
    identity: &GameIdentity,
    kind: RequestKind,
    language: Option<u32>,
) -> Result<()> {
    let game = orchestrator(config, identity);
    let language = language.map(VoiceLanguage::from_bits);
    let outcome = match kind {
        RequestKind::Download { repair_mode } => game.request_download(DownloadRequest {
            language,
            repair_mode,
        }),
        RequestKind::PreDownload => game.request_pre_download(language),
        RequestKind::Repair => game.request_repair(language),
    };

    match outcome {
        RequestOutcome::Launched { pid } => {
            println!("Worker started (pid {pid})");
            Ok(())
        }
        RequestOutcome::Redirected { holder_pid } => {
            println!("Already running in process {holder_pid}");
            Ok(())
        }
        RequestOutcome::NotEligible => Err(CliError::Refused(format!(
            "{kind:?} is not available for {identity}"
        ))),
        RequestOutcome::InstallPathMissing => Err(CliError::Refused(format!(
            "No install folder is set for {identity}"
        ))),
        RequestOutcome::LaunchFailed(err) => Err(LauncherError::Launch(err).into()),
        RequestOutcome::GateUnavailable => Err(CliError::Refused(
            "Could not check for other running launchers".into(),
        )),
    }
}

/// Prints and removes activation requests redirected to `operation`'s gate.
pub fn activations(identity: &GameIdentity, operation: Operation) -> Result<()> {
    let registry = LockDirRegistry::new(LockDirRegistry::default_base());
    let key = instance_key(operation, identity);
    for request in registry.take_activations(&key)? {
        let line = serde_json::to_string(&request)
            .map_err(|err| CliError::Refused(format!("Failed to render activation: {err}")))?;
        println!("{line}");
    }
    Ok(())
}
