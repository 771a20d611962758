//! The standby/active loop run by a node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rowlock_core::{InterruptHandle, LockConfig, LockError, RowLock};
use tracing::{info, warn};

use crate::settings::NodeSettings;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Capped exponential delay between storage retries.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            next: INITIAL_BACKOFF.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF.min(self.max);
    }
}

/// State shared between the election loop and the signal handler.
#[derive(Default)]
pub struct Control {
    shutdown: AtomicBool,
    active: AtomicBool,
    interrupt: Mutex<Option<InterruptHandle>>,
}

impl Control {
    /// Stops the loop and cancels a blocked acquire, if any.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .interrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(handle) = handle {
            handle.interrupt();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether this node currently holds the lock.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn publish(&self, handle: InterruptHandle) {
        *self
            .interrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    fn sleep(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && !self.is_shutdown() {
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

/// Runs until shutdown is requested. Blocks the calling thread.
pub fn run(config: LockConfig, settings: &NodeSettings, control: &Control) {
    let mut backoff = Backoff::new(settings.retry_backoff_max());
    let Some(mut lock) = connect(config, control, &mut backoff) else {
        return;
    };
    control.publish(lock.interrupt_handle());
    backoff.reset();

    let mut waiting_logged = false;
    while !control.is_shutdown() {
        match lock.acquire() {
            Ok(true) => {
                info!(
                    cluster_id = lock.config().cluster_id(),
                    "lock acquired, node is active"
                );
                control.set_active(true);
                waiting_logged = false;
                backoff.reset();
                hold(&mut lock, settings, control);
                control.set_active(false);
            }
            Ok(false) => {
                if !waiting_logged {
                    info!(
                        cluster_id = lock.config().cluster_id(),
                        "waiting for the lock"
                    );
                    waiting_logged = true;
                }
                // A zero contention timeout returns immediately.
                control.sleep(settings.poll_interval());
            }
            Err(err) if control.is_shutdown() => {
                info!(error = %err, "acquire interrupted by shutdown");
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(error = %err, delay_ms = delay.as_millis() as u64, "acquire failed, backing off");
                control.sleep(delay);
            }
        }
    }

    lock.release();
    control.set_active(false);
    info!("lock released, node stopped");
}

fn connect(config: LockConfig, control: &Control, backoff: &mut Backoff) -> Option<RowLock> {
    loop {
        if control.is_shutdown() {
            return None;
        }
        match RowLock::new(config.clone()) {
            Ok(lock) => return Some(lock),
            Err(LockError::StorageUnavailable(err)) => {
                let delay = backoff.next_delay();
                warn!(error = %err, delay_ms = delay.as_millis() as u64, "database unavailable, retrying");
                control.sleep(delay);
            }
            Err(err) => {
                warn!(error = %err, "cannot build the lock, giving up");
                return None;
            }
        }
    }
}

fn hold(lock: &mut RowLock, settings: &NodeSettings, control: &Control) {
    loop {
        control.sleep(settings.poll_interval());
        if control.is_shutdown() {
            return;
        }
        if !lock.is_held() {
            warn!(
                cluster_id = lock.config().cluster_id(),
                "lost the lock, node is standby"
            );
            return;
        }
    }
}
