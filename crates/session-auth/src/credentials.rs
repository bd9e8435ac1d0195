//! Durable storage for the session's credential pair
//!
//! The pair is kept in a small key/value document under the keys
//! `accessToken` and `refreshToken`. Both keys are written together and
//! removed together; a document holding only one of them loads as "no
//! session". The file store writes atomically (temp file + rename) and a
//! tokio Mutex serializes writes from the refresh task and logout.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::{Error, Result};

/// The access/refresh token pair for one signed-in session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    /// Bearer credential attached to API calls
    pub access_token: Secret<String>,
    /// Exchanged at the refresh endpoint for a new pair
    pub refresh_token: Secret<String>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
        }
    }
}

/// Storage for the current credential pair.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// The stored pair, or `None` when there is no active session.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>>;

    /// Replace the stored pair.
    fn save<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove both tokens. Idempotent.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

fn pair_from_entries(entries: &BTreeMap<String, String>) -> Option<CredentialPair> {
    match (entries.get(ACCESS_TOKEN_KEY), entries.get(REFRESH_TOKEN_KEY)) {
        (Some(access), Some(refresh)) => Some(CredentialPair::new(access.clone(), refresh.clone())),
        (None, None) => None,
        _ => {
            warn!("credential store holds a partial pair, treating as signed out");
            None
        }
    }
}

/// JSON-file credential store that survives process restarts.
///
/// Keeps an in-memory copy of the document; reads never touch the disk
/// after `open`. The copy changes only once the disk write has succeeded.
pub struct FileCredentialStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    /// Open the store at `path`.
    ///
    /// If the file doesn't exist it is created as `{}` (signed out). Keys
    /// other than the two token keys are preserved on every write.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(
                path = %path.display(),
                session = entries.contains_key(ACCESS_TOKEN_KEY),
                "loaded credential file"
            );
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting signed out");
            let entries = BTreeMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            Ok(pair_from_entries(&entries))
        })
    }

    fn save<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let mut updated = entries.clone();
            updated.insert(ACCESS_TOKEN_KEY.into(), pair.access_token.expose().clone());
            updated.insert(REFRESH_TOKEN_KEY.into(), pair.refresh_token.expose().clone());
            write_atomic(&self.path, &updated).await?;
            *entries = updated;
            debug!("saved credential pair");
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if !entries.contains_key(ACCESS_TOKEN_KEY) && !entries.contains_key(REFRESH_TOKEN_KEY) {
                return Ok(());
            }
            let mut updated = entries.clone();
            updated.remove(ACCESS_TOKEN_KEY);
            updated.remove(REFRESH_TOKEN_KEY);
            write_atomic(&self.path, &updated).await?;
            *entries = updated;
            debug!("cleared credential pair");
            Ok(())
        })
    }
}

/// In-process credential store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>> {
        Box::pin(async move { Ok(self.pair.lock().await.clone()) })
    }

    fn save<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            *self.pair.lock().await = Some(pair.clone());
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.pair.lock().await = None;
            Ok(())
        })
    }
}

/// Write the document atomically.
///
/// Writes a temp file in the same directory, sets 0600 permissions on unix,
/// then renames it over the target so a crash never leaves a torn file.
async fn write_atomic(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
