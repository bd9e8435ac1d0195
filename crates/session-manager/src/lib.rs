//! Access token lifecycle for the merchant API
//!
//! Keeps one short-lived access token valid across any number of concurrent
//! calls. A `SessionManager` owns the refresh state: at most one proactive
//! timer and at most one in-flight refresh, with every concurrent caller
//! sharing that refresh's outcome. `RequestPipeline` is the entry point the
//! rest of the application uses.
//!
//! Token lifecycle:
//! 1. `SessionManager::login()` stores the pair and arms the proactive timer
//! 2. `RequestPipeline::send()` attaches `Authorization: Bearer <token>`
//! 3. Timer fires shortly before expiry → single-flight `refresh()`
//! 4. A 401 on an unretried call → `refresh()` → one retry with the new token
//! 5. Refresh success: new pair saved, timer rearmed, waiters resolved
//! 6. Refresh failure: session cleared, waiters rejected, consumer redirected to sign in

pub mod bearer;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod navigator;
pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use bearer::BearerAuth;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{RefreshState, SessionManager, SessionOptions};
pub use error::{Error, Result};
pub use navigator::{AuthSurface, LogNavigator, Navigator};
pub use pipeline::RequestPipeline;
pub use scheduler::{RefreshPlan, RefreshPolicy, RefreshScheduler, compute_next_refresh, plan_refresh};
