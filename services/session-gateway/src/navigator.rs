//! Navigation context reported by the front end
//!
//! The front end sends its current location in `x-app-location` with every
//! forwarded call. A redirect cannot be performed from here, so it is
//! latched as a re-auth signal that the gateway surfaces on 401 responses
//! and in `/health` until the next login.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use session_manager::Navigator;
use tracing::warn;

#[derive(Debug, Default)]
pub struct GatewayNavigator {
    location: Mutex<Option<String>>,
    reauth_required: AtomicBool,
}

impl GatewayNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_location(&self, location: &str) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = Some(location.to_string());
    }

    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::SeqCst)
    }

    pub fn clear_reauth(&self) {
        self.reauth_required.store(false, Ordering::SeqCst);
    }
}

impl Navigator for GatewayNavigator {
    fn current_location(&self) -> Option<String> {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn redirect(&self, path: &str) {
        warn!(path, "session ended, front end must sign in again");
        self.reauth_required.store(true, Ordering::SeqCst);
    }
}
