//! Single-flight refresh coordination
//!
//! `SessionManager` is the one place that changes the stored credentials
//! after login. At most one refresh exchange is in flight; callers arriving
//! while it runs queue behind it and receive its outcome. The exchange runs
//! on its own task so a caller that gives up does not strand the others.
//!
//! Logout and login bump a generation counter. A refresh that started under
//! an older generation finishes without touching the store or the timer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use session_auth::{CredentialPair, CredentialStore};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use transport::Transport;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::metrics;
use crate::navigator::{AuthSurface, Navigator};
use crate::scheduler::{RefreshPlan, RefreshPolicy, RefreshScheduler, plan_refresh};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Tunables for a `SessionManager`.
#[derive(Clone)]
pub struct SessionOptions {
    pub clock: Arc<dyn Clock>,
    pub policy: RefreshPolicy,
    pub surface: AuthSurface,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            policy: RefreshPolicy::default(),
            surface: AuthSurface::default(),
        }
    }
}

type Waiter = oneshot::Sender<Result<String>>;

struct RefreshSlot {
    state: RefreshState,
    waiters: Vec<Waiter>,
    generation: u64,
    /// Unix ms of the last successful refresh, for the scheduling cooldown
    last_refresh_at: Option<u64>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    navigator: Arc<dyn Navigator>,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    surface: AuthSurface,
    scheduler: RefreshScheduler,
    slot: Mutex<RefreshSlot>,
    /// Serializes generation checks with the store writes they guard
    writes: tokio::sync::Mutex<()>,
}

/// Owns the session's refresh state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self::with_options(store, transport, navigator, SessionOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                navigator,
                clock: options.clock,
                policy: options.policy,
                surface: options.surface,
                scheduler: RefreshScheduler::new(),
                slot: Mutex::new(RefreshSlot {
                    state: RefreshState::Idle,
                    waiters: Vec::new(),
                    generation: 0,
                    last_refresh_at: None,
                }),
                writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Start a session with a freshly issued pair.
    ///
    /// Supersedes whatever session existed: a refresh still in flight for
    /// the old session is discarded and its waiters receive the new token.
    pub async fn login(&self, pair: CredentialPair) -> Result<()> {
        let (generation, waiters) = self.inner.reset();
        let saved = {
            let _writes = self.inner.writes.lock().await;
            self.inner.store.save(&pair).await.map_err(store_error)
        };

        let outcome = saved.map(|()| pair.access_token.expose().clone());
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome?;

        {
            let slot = self.inner.lock_slot();
            if slot.generation == generation {
                self.inner.arm(pair.access_token.expose(), None);
            }
        }
        info!("session established");
        Ok(())
    }

    /// Pick up a session persisted by an earlier process and arm its timer.
    ///
    /// Returns whether a session was found.
    pub async fn resume(&self) -> Result<bool> {
        let Some(pair) = self.inner.store.load().await.map_err(store_error)? else {
            debug!("no stored session to resume");
            return Ok(false);
        };
        {
            let slot = self.inner.lock_slot();
            self.inner.arm(pair.access_token.expose(), slot.last_refresh_at);
        }
        info!("stored session resumed");
        Ok(true)
    }

    /// End the session: cancel the timer, reject queued callers, clear the store.
    pub async fn clear(&self) -> Result<()> {
        let (_, waiters) = self.inner.reset();
        if !waiters.is_empty() {
            info!(
                waiters = waiters.len(),
                "rejecting callers queued behind an in-flight refresh"
            );
        }
        for waiter in waiters {
            let _ = waiter.send(Err(Error::SessionCleared));
        }

        let _writes = self.inner.writes.lock().await;
        self.inner.store.clear().await.map_err(store_error)?;
        info!("session cleared");
        Ok(())
    }

    /// Obtain a fresh access token, sharing any refresh already in flight.
    ///
    /// On failure the session has been cleared and the consumer sent to
    /// sign in; every caller sharing the refresh gets the same error.
    pub async fn refresh(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut slot = self.inner.lock_slot();
            slot.waiters.push(tx);
            match slot.state {
                RefreshState::Refreshing => {
                    debug!(waiters = slot.waiters.len(), "joining in-flight refresh");
                    None
                }
                RefreshState::Idle => {
                    slot.state = RefreshState::Refreshing;
                    Some(slot.generation)
                }
            }
        };

        if let Some(generation) = start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.run_refresh(generation));
        }

        rx.await.unwrap_or(Err(Error::RefreshAbandoned))
    }

    /// Arm the proactive timer for `access_token`, honouring the cooldown.
    ///
    /// Returns the delay, or `None` when nothing was armed (any existing
    /// timer is left in place). Outside a Tokio runtime nothing is armed.
    pub fn schedule_refresh(&self, access_token: &str) -> Option<Duration> {
        let slot = self.inner.lock_slot();
        self.inner.arm(access_token, slot.last_refresh_at)
    }

    /// Current access token, if signed in.
    pub async fn access_token(&self) -> Result<Option<String>> {
        let pair = self.inner.store.load().await.map_err(store_error)?;
        Ok(pair.map(|p| p.access_token.expose().clone()))
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.lock_slot().state
    }

    /// Unix ms at which the pending proactive refresh fires.
    pub fn pending_refresh_at(&self) -> Option<u64> {
        self.inner.scheduler.pending()
    }

    pub fn last_refresh_at(&self) -> Option<u64> {
        self.inner.lock_slot().last_refresh_at
    }

    pub fn surface(&self) -> &AuthSurface {
        &self.inner.surface
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, RefreshSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new generation: idle, no timer, no cooldown. Returns the new
    /// generation and the callers that were waiting on the old one.
    fn reset(&self) -> (u64, Vec<Waiter>) {
        let mut slot = self.lock_slot();
        slot.generation += 1;
        slot.state = RefreshState::Idle;
        slot.last_refresh_at = None;
        self.scheduler.cancel();
        (slot.generation, std::mem::take(&mut slot.waiters))
    }

    async fn run_refresh(self: Arc<Self>, generation: u64) {
        debug!("refreshing access token");
        let exchanged = self.exchange().await;

        let writes = self.writes.lock().await;
        let current = self.lock_slot().generation == generation;
        if !current {
            drop(writes);
            debug!("session changed while refresh was in flight, discarding result");
            metrics::record_refresh("discarded", 0);
            return;
        }
        let outcome = match exchanged {
            Ok(pair) => self.store.save(&pair).await.map(|()| pair).map_err(store_error),
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "failed to clear credentials after refresh failure");
            }
        }
        drop(writes);

        self.settle(generation, outcome);
    }

    async fn exchange(&self) -> Result<CredentialPair> {
        let current = self
            .store
            .load()
            .await
            .map_err(store_error)?
            .ok_or(Error::NotAuthenticated)?;
        session_auth::refresh_session(self.transport.as_ref(), current.refresh_token.expose())
            .await
            .map_err(Error::Refresh)
    }

    fn settle(self: &Arc<Self>, generation: u64, outcome: Result<CredentialPair>) {
        let waiters = {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                // Logout or login landed after the store write; it owns the store now.
                debug!("session changed while refresh was settling, discarding result");
                metrics::record_refresh("discarded", 0);
                return;
            }
            match &outcome {
                Ok(pair) => {
                    let now = self.clock.now_millis();
                    self.arm(pair.access_token.expose(), slot.last_refresh_at);
                    slot.last_refresh_at = Some(now);
                }
                Err(_) => {
                    self.scheduler.cancel();
                }
            }
            slot.state = RefreshState::Idle;
            std::mem::take(&mut slot.waiters)
        };

        match outcome {
            Ok(pair) => {
                info!(waiters = waiters.len(), "access token refreshed");
                metrics::record_refresh("success", waiters.len());
                let token = pair.access_token.expose();
                for waiter in waiters {
                    let _ = waiter.send(Ok(token.clone()));
                }
            }
            Err(e) => {
                warn!(error = %e, waiters = waiters.len(), "token refresh failed, session cleared");
                metrics::record_refresh("failure", waiters.len());
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                self.redirect_to_login();
            }
        }
    }

    /// Arm the proactive timer for `access_token`. The timer holds only a
    /// weak reference so a dropped manager does not keep refreshing.
    fn arm(self: &Arc<Self>, access_token: &str, last_refresh_at: Option<u64>) -> Option<Duration> {
        let Some(expires_at) = session_auth::expires_at(access_token) else {
            debug!("access token expiry unknown, relying on reactive refresh");
            return None;
        };

        let now = self.clock.now_millis();
        match plan_refresh(&self.policy, now, expires_at, last_refresh_at) {
            RefreshPlan::Arm(delay) => {
                let weak = Arc::downgrade(self);
                let armed = self.scheduler.arm(
                    delay,
                    now + delay.as_millis() as u64,
                    move || async move {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        let session = SessionManager { inner };
                        if let Err(e) = session.refresh().await {
                            debug!(error = %e, "proactive refresh did not complete");
                        }
                    },
                );
                armed.then_some(delay)
            }
            RefreshPlan::TooCloseToExpiry { remaining } => {
                warn!(
                    remaining_ms = remaining.as_millis() as u64,
                    "access token expires too soon to schedule, relying on reactive refresh"
                );
                None
            }
            RefreshPlan::CoolingDown { since_last } => {
                warn!(
                    since_last_ms = since_last.as_millis() as u64,
                    "refreshed too recently, not scheduling"
                );
                None
            }
        }
    }

    fn redirect_to_login(&self) {
        let location = self.navigator.current_location();
        if self.surface.should_redirect(location.as_deref()) {
            info!(
                from = location.as_deref().unwrap_or("unknown"),
                to = %self.surface.login_path,
                "redirecting to sign in"
            );
            self.navigator.redirect(&self.surface.login_path);
        } else {
            debug!(location = ?location, "already in sign-in flow, not redirecting");
        }
    }
}

fn store_error(e: session_auth::Error) -> Error {
    Error::Store(e.to_string())
}
