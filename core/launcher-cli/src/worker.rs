//! Elevated worker entry point.
//!
//! Runs as `launcherctl download|repair --biz <id> --loc <path> --lang <n>`,
//! usually with administrator rights. Holds the instance gate for its
//! operation while the configured download engine runs, so launchers started
//! meanwhile redirect to this process instead of spawning another worker.

use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use launcher_core::{
    GateOutcome, HolderRole, InstanceClaim, InstanceGate, LauncherConfig, LauncherError, LockDirRegistry,
    Operation, WorkerArgs, WorkerVerb, DEFAULT_HANDOFF_WINDOW,
};
use tracing::{info, warn};

use crate::error::{CliError, Result};

const CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub fn run(config: &LauncherConfig, args: &WorkerArgs) -> Result<()> {
    let operation = match args.verb {
        WorkerVerb::Download => Operation::Download,
        WorkerVerb::Repair => Operation::Repair,
    };
    let registry = LockDirRegistry::new(LockDirRegistry::default_base()).with_role(HolderRole::Worker);
    let gate = InstanceGate::new(Arc::new(registry));

    // The launcher that spawned us may still be registered for a moment.
    let claim = match gate.try_acquire_handoff(operation, &args.identity, DEFAULT_HANDOFF_WINDOW)? {
        GateOutcome::Acquired(claim) => claim,
        GateOutcome::Redirected(holder) => {
            info!(biz = %args.identity, holder = holder.pid, role = ?holder.role, "Operation already running; handed over");
            return Ok(());
        }
    };

    let result = run_engine(config, args, &claim);
    if let Err(err) = claim.release() {
        warn!(biz = %args.identity, error = %err, "Failed to release worker claim");
    }
    result
}

fn run_engine(config: &LauncherConfig, args: &WorkerArgs, claim: &InstanceClaim) -> Result<()> {
    let program = config
        .worker_program
        .as_ref()
        .ok_or_else(|| LauncherError::NotConfigured {
            identity: args.identity.to_string(),
            field: "worker_program",
        })?;

    info!(
        biz = %args.identity,
        verb = %args.verb,
        loc = %args.install_path.display(),
        lang = args.language.bits(),
        program = %program.display(),
        "Worker starting"
    );
    let mut child = Command::new(program)
        .args(args.to_args())
        .spawn()
        .map_err(|err| LauncherError::Io {
            context: format!("start {}", program.display()),
            source: err,
        })?;

    let status = loop {
        log_activations(claim);
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(CHECK_INTERVAL),
            Err(err) => {
                return Err(LauncherError::Io {
                    context: "wait for worker program".to_string(),
                    source: err,
                }
                .into())
            }
        }
    };
    log_activations(claim);

    if status.success() {
        info!(biz = %args.identity, verb = %args.verb, "Worker finished");
        Ok(())
    } else {
        Err(CliError::WorkerFailed { code: status.code() })
    }
}

fn log_activations(claim: &InstanceClaim) {
    match claim.take_activations() {
        Ok(requests) => {
            for request in requests {
                info!(
                    operation = %request.operation,
                    from = request.requested_by,
                    at = %request.requested_at,
                    "Another launcher asked for this operation; already in progress"
                );
            }
        }
        Err(err) => warn!(error = %err, "Failed to read redirected activations"),
    }
}
