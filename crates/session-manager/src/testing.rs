//! Fakes shared by this crate's tests

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use session_auth::{CredentialPair, MemoryCredentialStore, REFRESH_PATH};
use tokio::sync::Notify;
use transport::header::AUTHORIZATION;
use transport::{ApiRequest, ApiResponse, StatusCode, Transport};

use crate::clock::ManualClock;
use crate::coordinator::{SessionManager, SessionOptions};
use crate::navigator::Navigator;

pub(crate) const NOW_MS: u64 = 1_700_000_000_000;

/// Signed-looking access token whose `exp` is `expires_at_ms`.
pub(crate) fn token_expiring_at(expires_at_ms: u64, tag: &str) -> String {
    format!(
        "{}.{}.sig-{tag}",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(format!(
            r#"{{"sub":"merchant-42","jti":"{tag}","exp":{}}}"#,
            expires_at_ms / 1000
        ))
    )
}

pub(crate) fn token_expiring_in(secs: u64, tag: &str) -> String {
    token_expiring_at(NOW_MS + secs * 1000, tag)
}

#[derive(Clone)]
pub(crate) enum RefreshReply {
    Issue { access: String, refresh: String },
    Reject(StatusCode),
}

impl RefreshReply {
    pub(crate) fn issue(access: &str, refresh: &str) -> Self {
        RefreshReply::Issue {
            access: access.to_string(),
            refresh: refresh.to_string(),
        }
    }
}

/// Merchant API stand-in.
///
/// Ordinary calls succeed only with `Authorization: Bearer <accepted>`.
/// The refresh endpoint replays `reply`; issuing a new pair also makes the
/// new access token the accepted one.
pub(crate) struct FakeApi {
    accepted: Mutex<String>,
    reply: Mutex<RefreshReply>,
    hold: AtomicBool,
    reject_all: AtomicBool,
    release: Notify,
    refresh_calls: AtomicUsize,
    refresh_replies: AtomicUsize,
    api_calls: AtomicUsize,
    refresh_tokens_seen: Mutex<Vec<String>>,
}

impl FakeApi {
    pub(crate) fn new(accepted: &str, reply: RefreshReply) -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(accepted.to_string()),
            reply: Mutex::new(reply),
            hold: AtomicBool::new(false),
            reject_all: AtomicBool::new(false),
            release: Notify::new(),
            refresh_calls: AtomicUsize::new(0),
            refresh_replies: AtomicUsize::new(0),
            api_calls: AtomicUsize::new(0),
            refresh_tokens_seen: Mutex::new(Vec::new()),
        })
    }

    /// Park refresh calls until `release_refresh`.
    pub(crate) fn hold_refresh(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_refresh(&self) {
        self.release.notify_one();
    }

    /// Answer every ordinary call with 401, whatever token it carries.
    pub(crate) fn reject_all(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_reply(&self, reply: RefreshReply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_replies(&self) -> usize {
        self.refresh_replies.load(Ordering::SeqCst)
    }

    pub(crate) fn api_calls(&self) -> usize {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().unwrap().clone()
    }

    /// Wait until `count` refresh calls have reached the endpoint.
    pub(crate) async fn wait_for_refresh_calls(&self, count: usize) {
        while self.refresh_calls() < count {
            tokio::task::yield_now().await;
        }
    }

    /// Wait until `count` refresh replies were sent and their caller settled.
    pub(crate) async fn wait_for_refresh_replies(&self, count: usize) {
        while self.refresh_replies() < count {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn refresh(&self, request: &ApiRequest) -> ApiResponse {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        self.refresh_tokens_seen
            .lock()
            .unwrap()
            .push(body["refreshToken"].as_str().unwrap().to_string());

        let reply = self.reply.lock().unwrap().clone();
        match reply {
            RefreshReply::Issue { access, refresh } => {
                *self.accepted.lock().unwrap() = access.clone();
                ApiResponse::new(
                    StatusCode::OK,
                    serde_json::json!({
                        "data": {"accessToken": access, "refreshToken": refresh}
                    })
                    .to_string(),
                )
            }
            RefreshReply::Reject(status) => ApiResponse::new(status, "refresh token expired"),
        }
    }
}

impl Transport for FakeApi {
    fn id(&self) -> &str {
        "fake-api"
    }

    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            if request.url == REFRESH_PATH {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                if self.hold.load(Ordering::SeqCst) {
                    self.release.notified().await;
                }
                let response = self.refresh(request);
                self.refresh_replies.fetch_add(1, Ordering::SeqCst);
                return Ok(response);
            }

            self.api_calls.fetch_add(1, Ordering::SeqCst);
            let expected = format!("Bearer {}", self.accepted.lock().unwrap());
            let presented = request
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if presented == Some(expected.as_str()) && !self.reject_all.load(Ordering::SeqCst) {
                Ok(ApiResponse::new(StatusCode::OK, r#"{"orders":[]}"#))
            } else {
                Ok(ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"error":"access token expired"}"#,
                ))
            }
        })
    }
}

/// Navigator that records redirects.
pub(crate) struct RecordingNavigator {
    location: Mutex<Option<String>>,
    redirects: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub(crate) fn at(location: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            location: Mutex::new(location.map(str::to_string)),
            redirects: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn redirects(&self) -> Vec<String> {
        self.redirects.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn current_location(&self) -> Option<String> {
        self.location.lock().unwrap().clone()
    }

    fn redirect(&self, path: &str) {
        self.redirects.lock().unwrap().push(path.to_string());
        *self.location.lock().unwrap() = Some(path.to_string());
    }
}

pub(crate) struct Harness {
    pub api: Arc<FakeApi>,
    pub store: Arc<MemoryCredentialStore>,
    pub navigator: Arc<RecordingNavigator>,
    pub clock: Arc<ManualClock>,
    pub session: SessionManager,
}

impl Harness {
    pub(crate) fn new(api: Arc<FakeApi>, location: Option<&str>) -> Self {
        let store = Arc::new(MemoryCredentialStore::new());
        let navigator = RecordingNavigator::at(location);
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let session = SessionManager::with_options(
            store.clone(),
            api.clone(),
            navigator.clone(),
            SessionOptions {
                clock: clock.clone(),
                ..SessionOptions::default()
            },
        );
        Self {
            api,
            store,
            navigator,
            clock,
            session,
        }
    }

    pub(crate) async fn stored(&self) -> Option<CredentialPair> {
        use session_auth::CredentialStore;
        self.store.load().await.unwrap()
    }
}
