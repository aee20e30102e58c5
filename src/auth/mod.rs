//! Credential resolution for the mail transport.
//!
//! [`CredentialProvider`] is a closed union with one resolver per
//! authentication method. Only the OAuth2 resolver touches the network or
//! the session store.
pub mod oauth;
pub mod session_store;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, AuthMethod};
use crate::error::{DeliveryError, Result};

pub use oauth::{OAuthClient, TokenEndpoint, TokenSet};
pub use session_store::{FileSessionStore, MemorySessionStore, SessionRecord, SessionStore};

/// Authorization material handed to the transport.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Static { sender: String, secret: String },
    OAuth2 { account_email: String, access_token: String },
}

impl Credential {
    /// Address the message is sent from, if the credential implies one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Credential::None => None,
            Credential::Static { sender, .. } => Some(sender),
            Credential::OAuth2 { account_email, .. } => Some(account_email),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Static { sender, .. } => f
                .debug_struct("Static")
                .field("sender", sender)
                .field("secret", &"<redacted>")
                .finish(),
            Credential::OAuth2 { account_email, access_token } => f
                .debug_struct("OAuth2")
                .field("account_email", account_email)
                .field("access_token", &format_args!("<{} chars>", access_token.len()))
                .finish(),
        }
    }
}

/// Where a single resolution attempt ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    None,
    Static,
    OAuth2Valid,
    OAuth2Refreshing,
    OAuth2Refreshed,
    OAuth2Failed,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub credential: Credential,
    pub state: ResolutionState,
}

pub trait ResolveCredential: Send + Sync {
    fn resolve<'a>(
        &'a self,
        session_id: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Resolution>>;
}

/// Email sending is disabled.
pub struct NoAuth;

impl ResolveCredential for NoAuth {
    fn resolve<'a>(&'a self, _: Option<&'a str>, _: &'a CancellationToken) -> BoxFuture<'a, Result<Resolution>> {
        async {
            debug!("Credential resolution: {:?}", ResolutionState::None);
            Err(DeliveryError::NotConfigured(
                "neither Google OAuth nor SMTP credentials are set".to_string(),
            ))
        }
        .boxed()
    }
}

/// Sender address and password from the deployment configuration.
pub struct StaticAuth {
    sender: Option<String>,
    secret: Option<String>,
}

impl StaticAuth {
    pub fn new(sender: Option<String>, secret: Option<String>) -> Self {
        StaticAuth { sender, secret }
    }
}

impl ResolveCredential for StaticAuth {
    fn resolve<'a>(&'a self, _: Option<&'a str>, _: &'a CancellationToken) -> BoxFuture<'a, Result<Resolution>> {
        async move {
            let sender = self.sender.as_deref().map(str::trim).unwrap_or_default();
            let secret = self.secret.as_deref().unwrap_or_default();
            if sender.is_empty() || secret.trim().is_empty() {
                return Err(DeliveryError::IncompleteConfig(
                    "either SMTP_FROM or SMTP_PASSWORD is not configured".to_string(),
                ));
            }
            Ok(Resolution {
                credential: Credential::Static { sender: sender.to_string(), secret: secret.to_string() },
                state: ResolutionState::Static,
            })
        }
        .boxed()
    }
}

/// Per-user OAuth2 session, refreshed on demand and written back when the token changed.
pub struct OAuth2Auth {
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenEndpoint>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OAuth2Auth {
    pub fn new(sessions: Arc<dyn SessionStore>, tokens: Arc<dyn TokenEndpoint>) -> Self {
        OAuth2Auth { sessions, tokens, locks: Mutex::new(HashMap::new()) }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    fn session_lock<'a>(&'a self, session_id: &'a str) -> SessionLock<'a> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = locks.entry(session_id.to_string()).or_default().clone();
        SessionLock { locks: &self.locks, session_id, lock }
    }

    /// Load, refresh and write back while holding the session's lock, so a
    /// concurrent caller re-reads the record this one wrote.
    async fn resolve_locked(&self, session_id: &str, cancel: &CancellationToken) -> Result<Resolution> {
        let entry = self.session_lock(session_id);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DeliveryError::Cancelled("waiting for the mailer session".to_string()))
            }
            guard = entry.lock.lock() => guard,
        };

        let record = match self.sessions.get(session_id).await? {
            Some(record) if record.is_authenticated() => record,
            _ => {
                return Err(DeliveryError::Unauthenticated(
                    "no authenticated mailer session, please log in".to_string(),
                ))
            }
        };

        let stored = record.token_set();
        debug!("Credential resolution: {:?}", ResolutionState::OAuth2Refreshing);
        let fresh = match self.tokens.fresh_token(&stored, cancel).await {
            Ok(tokens) => tokens,
            Err(DeliveryError::Cancelled(m)) => return Err(DeliveryError::Cancelled(m)),
            Err(DeliveryError::Refresh(m)) => return Err(DeliveryError::Refresh(m)),
            Err(other) => return Err(DeliveryError::Refresh(other.to_string())),
        };

        let state = if fresh.access_token != stored.access_token {
            self.sessions.set(session_id, &record.with_tokens(&fresh)).await?;
            info!("🔐 Access token refreshed for {}", record.account_email);
            ResolutionState::OAuth2Refreshed
        } else {
            ResolutionState::OAuth2Valid
        };

        Ok(Resolution {
            credential: Credential::OAuth2 {
                account_email: record.account_email,
                access_token: fresh.access_token,
            },
            state,
        })
    }
}

/// Handle on one session's lock. The map entry is dropped with the last handle,
/// including when the resolving future is dropped midway.
struct SessionLock<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    session_id: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Handles are only cloned and released under the map lock.
        drop(std::mem::take(&mut self.lock));
        if locks.get(self.session_id).map_or(false, |lock| Arc::strong_count(lock) <= 1) {
            locks.remove(self.session_id);
        }
    }
}

impl ResolveCredential for OAuth2Auth {
    fn resolve<'a>(
        &'a self,
        session_id: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Resolution>> {
        async move {
            let session_id = session_id.ok_or_else(|| {
                DeliveryError::Unauthenticated("no mailer session, please log in".to_string())
            })?;

            let result = self.resolve_locked(session_id, cancel).await;

            if let Err(e) = &result {
                warn!("Credential resolution: {:?} ({})", ResolutionState::OAuth2Failed, e);
            }
            result
        }
        .boxed()
    }
}

/// Login status of a mailer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub email: Option<String>,
    pub method: AuthMethod,
}

pub enum CredentialProvider {
    None(NoAuth),
    Static(StaticAuth),
    OAuth2(OAuth2Auth),
}

impl CredentialProvider {
    /// `tokens` is only used for the OAuth2 method.
    pub fn from_config(
        config: &AppConfig,
        sessions: Arc<dyn SessionStore>,
        tokens: Option<Arc<dyn TokenEndpoint>>,
    ) -> Result<Self> {
        match config.auth_method {
            AuthMethod::None => Ok(CredentialProvider::None(NoAuth)),
            AuthMethod::Static => Ok(CredentialProvider::Static(StaticAuth::new(
                config.static_sender.from.clone(),
                config.static_sender.password.clone(),
            ))),
            AuthMethod::OAuth2 => {
                let tokens = tokens.ok_or_else(|| {
                    DeliveryError::IncompleteConfig("OAuth2 selected without a token endpoint".to_string())
                })?;
                Ok(CredentialProvider::OAuth2(OAuth2Auth::new(sessions, tokens)))
            }
        }
    }

    pub fn method(&self) -> AuthMethod {
        match self {
            CredentialProvider::None(_) => AuthMethod::None,
            CredentialProvider::Static(_) => AuthMethod::Static,
            CredentialProvider::OAuth2(_) => AuthMethod::OAuth2,
        }
    }

    /// Only OAuth2 sessions can be authenticated.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let record = match self {
            CredentialProvider::OAuth2(oauth) => oauth.sessions().get(session_id).await?,
            _ => None,
        };
        let email = record.filter(|r| r.is_authenticated()).map(|r| r.account_email);

        Ok(SessionStatus { authenticated: email.is_some(), email, method: self.method() })
    }

    /// Forgets the session. Returns the email of the account that was logged in, if any.
    pub async fn logout(&self, session_id: &str) -> Result<Option<String>> {
        let CredentialProvider::OAuth2(oauth) = self else {
            return Ok(None);
        };
        let previous = oauth.sessions().get(session_id).await?;
        oauth.sessions().remove(session_id).await?;

        let email = previous.filter(|r| r.is_authenticated()).map(|r| r.account_email);
        info!("User logged out: {}", email.as_deref().unwrap_or("<unknown>"));
        Ok(email)
    }
}

impl ResolveCredential for CredentialProvider {
    fn resolve<'a>(
        &'a self,
        session_id: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Resolution>> {
        match self {
            CredentialProvider::None(auth) => auth.resolve(session_id, cancel),
            CredentialProvider::Static(auth) => auth.resolve(session_id, cancel),
            CredentialProvider::OAuth2(auth) => auth.resolve(session_id, cancel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticToken {
        access_token: &'static str,
        calls: AtomicUsize,
    }

    impl TokenEndpoint for StaticToken {
        fn fresh_token<'a>(&'a self, stored: &'a TokenSet, _: &'a CancellationToken) -> BoxFuture<'a, Result<TokenSet>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(TokenSet { access_token: self.access_token.to_string(), ..stored.clone() })
            }
            .boxed()
        }
    }

    fn record(email: &str) -> SessionRecord {
        SessionRecord {
            access_token: "AT1".to_string(),
            refresh_token: "RT1".to_string(),
            expiry: Some(Utc::now()),
            account_email: email.to_string(),
        }
    }

    #[tokio::test]
    async fn test_none_is_not_configured() {
        let err = NoAuth.resolve(None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_static_requires_sender_and_secret() {
        let cancel = CancellationToken::new();
        let blank = StaticAuth::new(Some("billing@example.com".into()), Some("  ".into()));
        assert!(matches!(blank.resolve(None, &cancel).await, Err(DeliveryError::IncompleteConfig(_))));

        let missing = StaticAuth::new(None, Some("secret".into()));
        assert!(matches!(missing.resolve(None, &cancel).await, Err(DeliveryError::IncompleteConfig(_))));

        let ok = StaticAuth::new(Some("billing@example.com".into()), Some("secret".into()));
        let resolution = ok.resolve(None, &cancel).await.unwrap();
        assert_eq!(resolution.state, ResolutionState::Static);
        assert_eq!(resolution.credential.sender(), Some("billing@example.com"));
    }

    #[tokio::test]
    async fn test_oauth_without_session_is_unauthenticated() {
        let store = Arc::new(MemorySessionStore::new());
        store.set("blank", &record("")).await.unwrap();
        let tokens = Arc::new(StaticToken { access_token: "AT1", calls: AtomicUsize::new(0) });
        let auth = OAuth2Auth::new(store, tokens.clone());
        let cancel = CancellationToken::new();

        assert!(matches!(auth.resolve(None, &cancel).await, Err(DeliveryError::Unauthenticated(_))));
        assert!(matches!(auth.resolve(Some("missing"), &cancel).await, Err(DeliveryError::Unauthenticated(_))));
        assert!(matches!(auth.resolve(Some("blank"), &cancel).await, Err(DeliveryError::Unauthenticated(_))));
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refreshed_token_is_written_back() {
        let store = Arc::new(MemorySessionStore::new());
        store.set("s1", &record("billing@example.com")).await.unwrap();
        let tokens = Arc::new(StaticToken { access_token: "AT2", calls: AtomicUsize::new(0) });
        let auth = OAuth2Auth::new(store.clone(), tokens);

        let resolution = auth.resolve(Some("s1"), &CancellationToken::new()).await.unwrap();
        assert_eq!(resolution.state, ResolutionState::OAuth2Refreshed);
        assert_eq!(
            resolution.credential,
            Credential::OAuth2 { account_email: "billing@example.com".into(), access_token: "AT2".into() }
        );
        assert_eq!(store.get("s1").await.unwrap().unwrap().access_token, "AT2");
        assert!(auth.locks.lock().unwrap().is_empty());
    }

    struct HangingToken;

    impl TokenEndpoint for HangingToken {
        fn fresh_token<'a>(&'a self, _: &'a TokenSet, _: &'a CancellationToken) -> BoxFuture<'a, Result<TokenSet>> {
            futures::future::pending().boxed()
        }
    }

    #[tokio::test]
    async fn test_dropped_resolution_releases_session_entry() {
        let store = Arc::new(MemorySessionStore::new());
        store.set("s1", &record("billing@example.com")).await.unwrap();
        let auth = OAuth2Auth::new(store, Arc::new(HangingToken));
        let cancel = CancellationToken::new();

        let abandoned = tokio::time::timeout(std::time::Duration::from_millis(50), auth.resolve(Some("s1"), &cancel)).await;
        assert!(abandoned.is_err());
        assert!(auth.locks.lock().unwrap().is_empty(), "abandoned resolution left its lock entry behind");

        // A second caller still gets the lock.
        let again = tokio::time::timeout(std::time::Duration::from_millis(50), auth.resolve(Some("s1"), &cancel)).await;
        assert!(again.is_err());
        assert!(auth.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_status_and_logout() {
        let store = Arc::new(MemorySessionStore::new());
        store.set("s1", &record("billing@example.com")).await.unwrap();
        let tokens = Arc::new(StaticToken { access_token: "AT1", calls: AtomicUsize::new(0) });
        let provider = CredentialProvider::OAuth2(OAuth2Auth::new(store.clone(), tokens));

        let status = provider.session_status("s1").await.unwrap();
        assert!(status.authenticated);
        assert_eq!(status.email.as_deref(), Some("billing@example.com"));
        assert_eq!(status.method, AuthMethod::OAuth2);

        assert_eq!(provider.logout("s1").await.unwrap().as_deref(), Some("billing@example.com"));
        assert!(!provider.session_status("s1").await.unwrap().authenticated);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let credential = Credential::OAuth2 { account_email: "a@example.com".into(), access_token: "ya29.secret".into() };
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("ya29.secret"));
        assert!(printed.contains("a@example.com"));
    }
}
