use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::oauth::TokenSet;
use crate::error::{DeliveryError, Result};
use crate::invoice::{validate_id, write_atomically};

/// Mailer login persisted between requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
    pub account_email: String,
}

impl SessionRecord {
    pub fn token_set(&self) -> TokenSet {
        TokenSet {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expiry: self.expiry,
        }
    }

    pub fn with_tokens(&self, tokens: &TokenSet) -> SessionRecord {
        SessionRecord {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expiry: tokens.expiry,
            account_email: self.account_email.clone(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.account_email.trim().is_empty()
    }
}

/// Key-value store of mailer sessions.
pub trait SessionStore: Send + Sync {
    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<SessionRecord>>>;

    /// Replaces the whole record.
    fn set<'a>(&'a self, session_id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<()>>;

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// One JSON file per session, replaced atomically on write.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSessionStore { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        validate_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

impl SessionStore for FileSessionStore {
    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<SessionRecord>>> {
        async move {
            let path = self.path_for(session_id)?;
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(DeliveryError::Persist(format!(
                        "failed to read session '{}': {}",
                        session_id, e
                    )))
                }
            };
            let record = serde_json::from_slice(&data)
                .map_err(|e| DeliveryError::Persist(format!("corrupt session '{}': {}", session_id, e)))?;
            Ok(Some(record))
        }
        .boxed()
    }

    fn set<'a>(&'a self, session_id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.path_for(session_id)?;
            let data = serde_json::to_vec_pretty(record)
                .map_err(|e| DeliveryError::Persist(format!("failed to encode session '{}': {}", session_id, e)))?;
            let dir = self.dir.clone();
            tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &data))
                .await
                .map_err(|e| DeliveryError::Persist(format!("session writer task failed: {}", e)))??;
            debug!("Session {} saved", session_id);
            Ok(())
        }
        .boxed()
    }

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.path_for(session_id)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(DeliveryError::Persist(format!(
                    "failed to remove session '{}': {}",
                    session_id, e
                ))),
            }
        }
        .boxed()
    }
}

/// Process-local store, also used as the fake in tests.
#[derive(Default, Clone)]
pub struct MemorySessionStore {
    records: Arc<Mutex<HashMap<String, SessionRecord>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<SessionRecord>>> {
        async move { Ok(self.records.lock().await.get(session_id).cloned()) }.boxed()
    }

    fn set<'a>(&'a self, session_id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<()>> {
        async move {
            self.records.lock().await.insert(session_id.to_string(), record.clone());
            Ok(())
        }
        .boxed()
    }

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.records.lock().await.remove(session_id);
            Ok(())
        }
        .boxed()
    }
}
