//! Proactive refresh timing
//!
//! `plan_refresh` is the pure decision: given now, the token's expiry and
//! the last successful refresh, either a delay or a reason not to arm.
//! `RefreshScheduler` owns the single pending timer. Arming replaces any
//! previous timer; a decision not to arm leaves the existing timer alone.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Thresholds for proactive refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Do not arm when the token expires sooner than this
    pub min_lead: Duration,
    /// Do not arm within this long of the last successful refresh
    pub cooldown: Duration,
    /// Upper bound on how early before expiry the timer fires
    pub max_buffer: Duration,
    /// Lower bound on the timer delay
    pub min_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            min_lead: Duration::from_secs(30),
            cooldown: Duration::from_secs(30),
            max_buffer: Duration::from_secs(300),
            min_delay: Duration::from_secs(10),
        }
    }
}

/// Outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Fire a refresh after this delay
    Arm(Duration),
    /// Token expires too soon to bother; the reactive path covers it
    TooCloseToExpiry { remaining: Duration },
    /// A refresh completed too recently
    CoolingDown { since_last: Duration },
}

impl RefreshPlan {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RefreshPlan::Arm(delay) => Some(*delay),
            _ => None,
        }
    }
}

/// Decide when to refresh a token expiring at `expires_at_ms`.
///
/// All timestamps are unix milliseconds. Fires half way to expiry, but never
/// more than `max_buffer` early and never sooner than `min_delay`.
pub fn plan_refresh(
    policy: &RefreshPolicy,
    now_ms: u64,
    expires_at_ms: u64,
    last_refresh_at_ms: Option<u64>,
) -> RefreshPlan {
    let remaining = Duration::from_millis(expires_at_ms.saturating_sub(now_ms));
    if remaining < policy.min_lead {
        return RefreshPlan::TooCloseToExpiry { remaining };
    }

    if let Some(last) = last_refresh_at_ms {
        let since_last = Duration::from_millis(now_ms.saturating_sub(last));
        if since_last < policy.cooldown {
            return RefreshPlan::CoolingDown { since_last };
        }
    }

    let buffer = policy.max_buffer.min(remaining / 2);
    RefreshPlan::Arm((remaining - buffer).max(policy.min_delay))
}

/// `plan_refresh` reduced to the delay, `None` meaning "do not arm".
pub fn compute_next_refresh(
    policy: &RefreshPolicy,
    now_ms: u64,
    expires_at_ms: u64,
    last_refresh_at_ms: Option<u64>,
) -> Option<Duration> {
    plan_refresh(policy, now_ms, expires_at_ms, last_refresh_at_ms).delay()
}

struct PendingTimer {
    id: u64,
    fires_at_ms: u64,
    handle: JoinHandle<()>,
}

/// Holds at most one pending refresh timer.
pub struct RefreshScheduler {
    slot: Arc<Mutex<Option<PendingTimer>>>,
    next_id: AtomicU64,
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Arm a timer that runs `on_fire` after `delay`, cancelling any
    /// previously pending timer. `fires_at_ms` is informational.
    ///
    /// The timer vacates its slot before running `on_fire`, so rearming from
    /// inside `on_fire` does not abort the running task.
    ///
    /// Returns `false` without touching the pending timer when called
    /// outside a Tokio runtime.
    pub fn arm<F, Fut>(&self, delay: Duration, fires_at_ms: u64, on_fire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no Tokio runtime, refresh timer not armed");
            return false;
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut slot = lock(&self.slot);

        let own_slot = Arc::clone(&self.slot);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = lock(&own_slot);
                if slot.as_ref().is_some_and(|t| t.id == id) {
                    *slot = None;
                }
            }
            on_fire().await;
        });

        if let Some(previous) = slot.replace(PendingTimer {
            id,
            fires_at_ms,
            handle,
        }) {
            debug!(
                previous_fires_at = previous.fires_at_ms,
                "replacing pending refresh timer"
            );
            previous.handle.abort();
        }
        debug!(delay_ms = delay.as_millis() as u64, fires_at = fires_at_ms, "refresh timer armed");
        true
    }

    /// Cancel the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match lock(&self.slot).take() {
            Some(timer) => {
                timer.handle.abort();
                debug!(fires_at = timer.fires_at_ms, "refresh timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Unix milliseconds at which the pending timer fires.
    pub fn pending(&self) -> Option<u64> {
        lock(&self.slot).as_ref().map(|t| t.fires_at_ms)
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.slot).take() {
            timer.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
