//! Tracks one external process and reports its exit exactly once.
//!
//! Ownership is exclusive: attaching a new process fully detaches the previous
//! one (its callback is revoked, its poll timer stopped, its handle dropped).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::{ExitNotifier, SharedHandle};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies one `attach` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Exit callback for one attach. `fire` and `revoke` both consume it, so it
/// runs at most once and never after revocation.
struct Attachment {
    id: WatchId,
    callback: Mutex<Option<ExitNotifier>>,
}

impl Attachment {
    fn new(id: WatchId, callback: ExitNotifier) -> Self {
        Self {
            id,
            callback: Mutex::new(Some(callback)),
        }
    }

    fn fire(&self) {
        // Take under the lock, run outside it: the callback may re-enter the watcher.
        let callback = lock(&self.callback).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn revoke(&self) {
        lock(&self.callback).take();
    }

    fn is_settled(&self) -> bool {
        lock(&self.callback).is_none()
    }
}

enum Strategy {
    ExitEvent,
    Polling(PollTimer),
    /// Neither strategy could be started; liveness is only answered on demand.
    Unobserved,
}

struct PollTimer {
    stop: Sender<()>,
}

impl PollTimer {
    fn start(handle: SharedHandle, attachment: Arc<Attachment>, interval: Duration) -> Option<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let pid = handle.pid();
        let spawned = thread::Builder::new()
            .name(format!("poll-{pid}"))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if attachment.is_settled() {
                            break;
                        }
                        if handle.has_exited() {
                            debug!(pid, "Polled process has exited");
                            attachment.fire();
                            break;
                        }
                    }
                    // Stop requested or the watcher dropped the timer.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(_) => Some(Self { stop }),
            Err(err) => {
                warn!(pid, error = %err, "Failed to start process poll timer");
                None
            }
        }
    }

    fn stop(self) {
        let _ = self.stop.send(());
    }
}

struct Tracked {
    attachment: Arc<Attachment>,
    handle: SharedHandle,
    strategy: Strategy,
}

impl Tracked {
    fn release(self) {
        self.attachment.revoke();
        if let Strategy::Polling(timer) = self.strategy {
            timer.stop();
        }
        debug!(pid = self.handle.pid(), "Process handle released");
    }
}

pub struct ProcessWatcher {
    poll_interval: Duration,
    next_id: AtomicU64,
    slot: Mutex<Option<Tracked>>,
}

impl Default for ProcessWatcher {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ProcessWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            next_id: AtomicU64::new(0),
            slot: Mutex::new(None),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Starts tracking `handle`, replacing whatever was tracked before.
    ///
    /// `on_exit` runs at most once, on whichever thread observes the exit
    /// (possibly the calling thread, if the process is already gone).
    pub fn attach<F>(&self, handle: SharedHandle, on_exit: F) -> WatchId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let attachment = Arc::new(Attachment::new(id, Box::new(on_exit)));

        self.detach();

        // Subscribe without holding the slot: a handle may report exit right away
        // and the callback is allowed to call back into the watcher.
        let strategy = self.select_strategy(&handle, &attachment);
        let tracked = Tracked {
            attachment: Arc::clone(&attachment),
            handle: Arc::clone(&handle),
            strategy,
        };
        let to_release = {
            let mut slot = lock(&self.slot);
            if attachment.is_settled() {
                // Exit already reported while subscribing; nothing left to track.
                Some(tracked)
            } else {
                slot.replace(tracked)
            }
        };
        if let Some(stale) = to_release {
            stale.release();
        }

        // The process may have exited before the subscription existed.
        if handle.has_exited() {
            attachment.fire();
        }
        id
    }

    fn select_strategy(&self, handle: &SharedHandle, attachment: &Arc<Attachment>) -> Strategy {
        let target = Arc::clone(attachment);
        match handle.subscribe_exit(Box::new(move || target.fire())) {
            Ok(()) => {
                debug!(pid = handle.pid(), "Watching process via exit notification");
                Strategy::ExitEvent
            }
            Err(err) => {
                debug!(
                    pid = handle.pid(),
                    reason = %err,
                    interval_ms = self.poll_interval.as_millis() as u64,
                    "Exit notification unavailable; polling"
                );
                match PollTimer::start(Arc::clone(handle), Arc::clone(attachment), self.poll_interval) {
                    Some(timer) => Strategy::Polling(timer),
                    None => Strategy::Unobserved,
                }
            }
        }
    }

    /// Stops tracking and releases the handle. Idempotent; callable from the
    /// exit callback.
    pub fn detach(&self) {
        let previous = lock(&self.slot).take();
        if let Some(tracked) = previous {
            tracked.release();
        }
    }

    /// Detaches only if `id` is still the tracked attachment.
    pub fn detach_watch(&self, id: WatchId) -> bool {
        let previous = {
            let mut slot = lock(&self.slot);
            if slot.as_ref().is_some_and(|t| t.attachment.id == id) {
                slot.take()
            } else {
                None
            }
        };
        match previous {
            Some(tracked) => {
                tracked.release();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slot)
            .as_ref()
            .is_some_and(|t| !t.handle.has_exited())
    }

    /// PID of the tracked process while it is alive.
    pub fn tracked_pid(&self) -> Option<u32> {
        lock(&self.slot)
            .as_ref()
            .filter(|t| !t.handle.has_exited())
            .map(|t| t.handle.pid())
    }

    pub fn current_watch(&self) -> Option<WatchId> {
        lock(&self.slot).as_ref().map(|t| t.attachment.id)
    }
}

impl Drop for ProcessWatcher {
    fn drop(&mut self) {
        self.detach();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
