//! Single-instance gating for elevated operations.
//!
//! At most one elevated download (or repair) may be in flight per game
//! identity across every launcher process on the machine. Before launching,
//! the orchestrator asks the [`InstanceGate`] for a claim on
//! `"{operation}_{identity}"`:
//!
//! ```text
//! register_if_absent(key)
//!   ├── registered ............................ Acquired(claim)
//!   ├── held by another live process .......... redirect activation → Redirected
//!   └── held by this process
//!         ├── claim alive in this process ..... Redirected (launch already in flight)
//!         └── no live claim (stale) ........... reclaim → Acquired(claim)
//! ```
//!
//! The registry behind the gate is a trait so the same logic runs against
//! lock directories in production and an in-memory table in tests.
//!
//! ## Handoff to the elevated worker
//!
//! A launcher keeps its claim until the elevated spawn returns, so the worker
//! it started can find the launcher still registered. Workers register with
//! [`HolderRole::Worker`] and use [`InstanceGate::try_acquire_handoff`], which
//! waits for a launcher holder to let go instead of redirecting to it.

mod lock;
mod memory;

pub use lock::LockDirRegistry;
pub use memory::MemoryRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{GameIdentity, Operation};

/// Builds the cross-process key. Deterministic so independent launcher
/// processes compute the same value.
pub fn instance_key(operation: Operation, identity: &GameIdentity) -> String {
    format!("{}_{}", operation.gate_name(), identity)
}

/// How long a worker waits for the launcher that spawned it to release.
pub const DEFAULT_HANDOFF_WINDOW: Duration = Duration::from_secs(10);
const HANDOFF_STEP: Duration = Duration::from_millis(100);

/// What kind of process holds a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderRole {
    /// A launcher between its gate check and the elevated spawn.
    #[default]
    Launcher,
    /// An elevated worker doing the operation.
    Worker,
}

/// The process currently registered for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHolder {
    pub key: String,
    pub pid: u32,
    #[serde(default)]
    pub role: HolderRole,
}

/// What a redirected launcher forwards to the holder, so the holder can
/// surface its progress instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub operation: Operation,
    pub identity: GameIdentity,
    pub requested_by: u32,
    pub requested_at: DateTime<Utc>,
}

impl ActivationRequest {
    pub fn new(operation: Operation, identity: GameIdentity, requested_by: u32) -> Self {
        Self {
            operation,
            identity,
            requested_by,
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Existing(InstanceHolder),
}

/// OS-visible register-if-absent primitive.
pub trait InstanceRegistry: Send + Sync {
    /// PID recorded for registrations made through this registry.
    fn owner(&self) -> u32;

    /// Role recorded for registrations made through this registry.
    fn role(&self) -> HolderRole {
        HolderRole::Launcher
    }

    /// Atomically registers `key` for [`owner`](Self::owner) unless a live
    /// holder exists. A registration already owned by `owner` is refreshed and
    /// reported as `Existing`.
    fn register_if_absent(&self, key: &str) -> Result<Registration>;

    /// Forwards `request` to `holder`.
    fn redirect_to(&self, holder: &InstanceHolder, request: &ActivationRequest) -> Result<()>;

    /// Removes the registration if `owner` holds it.
    fn unregister(&self, key: &str) -> Result<()>;

    /// Drains activation requests redirected to `key`'s holder.
    fn take_activations(&self, key: &str) -> Result<Vec<ActivationRequest>>;
}

pub enum GateOutcome {
    Acquired(InstanceClaim),
    /// Another launch owns the operation; the caller must abort its own.
    Redirected(InstanceHolder),
}

impl std::fmt::Debug for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Acquired(claim) => f.debug_tuple("Acquired").field(&claim.key).finish(),
            GateOutcome::Redirected(holder) => f.debug_tuple("Redirected").field(holder).finish(),
        }
    }
}

type LiveKeys = Arc<Mutex<HashSet<String>>>;

#[derive(Clone)]
pub struct InstanceGate {
    registry: Arc<dyn InstanceRegistry>,
    live: LiveKeys,
}

impl InstanceGate {
    pub fn new(registry: Arc<dyn InstanceRegistry>) -> Self {
        Self {
            registry,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &Arc<dyn InstanceRegistry> {
        &self.registry
    }

    pub fn try_acquire(&self, operation: Operation, identity: &GameIdentity) -> Result<GateOutcome> {
        let outcome = self.acquire(operation, identity)?;
        if let GateOutcome::Redirected(holder) = &outcome {
            self.forward(operation, identity, holder);
        }
        Ok(outcome)
    }

    /// Like [`try_acquire`](Self::try_acquire), but a holder that is another
    /// process's launcher is waited on for up to `window` before redirecting.
    /// Workers use this: the launcher that spawned them releases its claim
    /// only once the spawn has returned.
    pub fn try_acquire_handoff(
        &self,
        operation: Operation,
        identity: &GameIdentity,
        window: Duration,
    ) -> Result<GateOutcome> {
        let deadline = Instant::now() + window;
        let owner = self.registry.owner();
        loop {
            match self.acquire(operation, identity)? {
                GateOutcome::Redirected(holder)
                    if holder.role == HolderRole::Launcher
                        && holder.pid != owner
                        && Instant::now() < deadline =>
                {
                    debug!(key = %holder.key, holder = holder.pid, "Waiting for launcher to hand over");
                    thread::sleep(HANDOFF_STEP);
                }
                GateOutcome::Redirected(holder) => {
                    self.forward(operation, identity, &holder);
                    return Ok(GateOutcome::Redirected(holder));
                }
                acquired => return Ok(acquired),
            }
        }
    }

    /// Registers or finds the holder, without forwarding an activation.
    fn acquire(&self, operation: Operation, identity: &GameIdentity) -> Result<GateOutcome> {
        let key = instance_key(operation, identity);
        let owner = self.registry.owner();

        // Reserve in-process first so two threads of this launcher cannot both
        // pass the registry check.
        if !lock(&self.live).insert(key.clone()) {
            debug!(key = %key, "Launch already in flight in this process");
            return Ok(GateOutcome::Redirected(InstanceHolder {
                key,
                pid: owner,
                role: self.registry.role(),
            }));
        }

        let registration = match self.registry.register_if_absent(&key) {
            Ok(registration) => registration,
            Err(err) => {
                lock(&self.live).remove(&key);
                return Err(err);
            }
        };

        match registration {
            Registration::Registered => {
                debug!(key = %key, pid = owner, "Instance claim acquired");
                Ok(GateOutcome::Acquired(self.claim(key)))
            }
            Registration::Existing(holder) if holder.pid == owner => {
                info!(key = %key, pid = owner, "Reclaiming stale registration from this process");
                Ok(GateOutcome::Acquired(self.claim(key)))
            }
            Registration::Existing(holder) => {
                lock(&self.live).remove(&key);
                Ok(GateOutcome::Redirected(holder))
            }
        }
    }

    fn forward(&self, operation: Operation, identity: &GameIdentity, holder: &InstanceHolder) {
        let owner = self.registry.owner();
        if holder.pid == owner {
            return;
        }
        let request = ActivationRequest::new(operation, identity.clone(), owner);
        if let Err(err) = self.registry.redirect_to(holder, &request) {
            warn!(key = %holder.key, holder = holder.pid, error = %err, "Failed to redirect activation");
        } else {
            info!(key = %holder.key, holder = holder.pid, "Activation redirected to existing instance");
        }
    }

    fn claim(&self, key: String) -> InstanceClaim {
        InstanceClaim {
            key,
            registry: Arc::clone(&self.registry),
            live: Arc::clone(&self.live),
            released: false,
        }
    }
}

/// Exclusive registration for one key. Released exactly once: explicitly via
/// [`release`](Self::release) or when dropped.
pub struct InstanceClaim {
    key: String,
    registry: Arc<dyn InstanceRegistry>,
    live: LiveKeys,
    released: bool,
}

impl InstanceClaim {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Activation requests other launchers redirected to this claim.
    pub fn take_activations(&self) -> Result<Vec<ActivationRequest>> {
        self.registry.take_activations(&self.key)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.unregister()
    }

    fn unregister(&self) -> Result<()> {
        lock(&self.live).remove(&self.key);
        self.registry.unregister(&self.key)
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.unregister() {
            warn!(key = %self.key, error = %err, "Failed to release instance claim");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
