use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use hyper::client::HttpConnector;
use hyper::header::AUTHORIZATION;
use hyper::{Body, Client, Method, Request};
use hyper_rustls::HttpsConnector;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

use crate::config::OAuthSettings;
use crate::error::{DeliveryError, Result};

/// Scopes requested at login: identity plus full mail access for XOAUTH2.
pub const SCOPES: &[&str] = &["openid", "email", "profile", "https://mail.google.com/"];

const EXPIRY_SKEW_SECS: i64 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Access token, refresh token and expiry as handed out by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// A token without expiry never expires. Otherwise it must outlive `now` by a small margin.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => expiry - chrono::Duration::seconds(EXPIRY_SKEW_SECS) > now,
            None => true,
        }
    }

    fn from_token_info(info: TokenInfo, previous_refresh: &str) -> Result<TokenSet> {
        let access_token = info
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DeliveryError::Refresh("token endpoint returned no access token".to_string()))?;
        let refresh_token = info
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| previous_refresh.to_string());
        let expiry = info
            .expires_at
            .and_then(|at| DateTime::<Utc>::from_timestamp(at.unix_timestamp(), at.nanosecond()));

        Ok(TokenSet { access_token, refresh_token, expiry })
    }
}

/// Source of fresh access tokens.
pub trait TokenEndpoint: Send + Sync {
    /// Returns `stored` unchanged while it is valid, a refreshed set otherwise.
    fn fresh_token<'a>(
        &'a self,
        stored: &'a TokenSet,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<TokenSet>>;
}

/// Holds the single token of one grant. The authenticator reads the seed from
/// it and writes the token it obtained back into it.
#[derive(Clone, Default)]
struct GrantSlot(Arc<Mutex<Option<TokenInfo>>>);

impl GrantSlot {
    fn seeded(tokens: &TokenSet) -> Self {
        GrantSlot(Arc::new(Mutex::new(Some(TokenInfo {
            access_token: Some(tokens.access_token.clone()),
            refresh_token: Some(tokens.refresh_token.clone()),
            expires_at: None,
            id_token: None,
        }))))
    }

    fn take(&self) -> Option<TokenInfo> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl TokenStorage for GrantSlot {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        let mut slot = self.0.lock().map_err(|_| anyhow::anyhow!("token slot poisoned"))?;
        *slot = Some(token);
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Answers the consent step without a browser: with the code received on the
/// redirect URL, or with a refusal when a refresh grant was rejected.
struct CodeDelegate {
    code: Option<String>,
    redirect_url: String,
}

impl InstalledFlowDelegate for CodeDelegate {
    fn redirect_uri(&self) -> Option<&str> {
        Some(&self.redirect_url)
    }

    fn present_user_url<'a>(
        &'a self,
        _url: &'a str,
        _need_code: bool,
    ) -> BoxFuture<'a, std::result::Result<String, String>> {
        let answer = self
            .code
            .clone()
            .ok_or_else(|| "refresh token rejected, a new login is required".to_string());
        async move { answer }.boxed()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: String,
}

/// Authorization-code client for the identity provider (Google endpoints by default).
pub struct OAuthClient {
    settings: OAuthSettings,
    http: Client<HttpsConnector<HttpConnector>>,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();

        OAuthClient {
            settings,
            http: Client::builder().build(connector),
        }
    }

    /// Consent page URL. `state` is echoed back to the redirect URL.
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let scope = SCOPES.join(" ");
        let url = url::Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_url.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "select_account"),
            ],
        )
        .map_err(|e| DeliveryError::IncompleteConfig(format!("invalid OAuth authorization url: {}", e)))?;
        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, code: &str, cancel: &CancellationToken) -> Result<TokenSet> {
        info!("🔐 Exchanging authorization code for tokens");
        let info = self.grant(GrantSlot::default(), Some(code.to_string()), cancel).await?;
        TokenSet::from_token_info(info, "")
    }

    /// Email address of the account the token belongs to.
    pub async fn account_email(&self, access_token: &str, cancel: &CancellationToken) -> Result<String> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(&self.settings.userinfo_url)
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .body(Body::empty())
            .map_err(|e| DeliveryError::Unauthenticated(format!("invalid userinfo request: {}", e)))?;

        let info: UserInfo = self.call(request, cancel).await?;
        if info.email.trim().is_empty() {
            return Err(DeliveryError::Unauthenticated("identity provider returned no email address".to_string()));
        }
        Ok(info.email)
    }

    async fn refresh(&self, stored: &TokenSet, cancel: &CancellationToken) -> Result<TokenSet> {
        if stored.refresh_token.is_empty() {
            return Err(DeliveryError::Refresh("token expired and no refresh token is available".to_string()));
        }
        info!("🔄 Refreshing OAuth2 access token");
        let info = self.grant(GrantSlot::seeded(stored), None, cancel).await?;
        let tokens = TokenSet::from_token_info(info, &stored.refresh_token)?;
        debug!("Received access token ({} chars)", tokens.access_token.len());
        Ok(tokens)
    }

    fn application_secret(&self) -> ApplicationSecret {
        ApplicationSecret {
            client_id: self.settings.client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            auth_uri: self.settings.auth_url.clone(),
            token_uri: self.settings.token_url.clone(),
            redirect_uris: vec![self.settings.redirect_url.clone()],
            ..Default::default()
        }
    }

    /// Runs one grant against the token endpoint: the authorization-code
    /// exchange when `code` is given, the refresh grant on the seeded slot otherwise.
    async fn grant(&self, slot: GrantSlot, code: Option<String>, cancel: &CancellationToken) -> Result<TokenInfo> {
        let refresh = code.is_none();
        let delegate = CodeDelegate { code, redirect_url: self.settings.redirect_url.clone() };

        let exchange = async {
            let auth = InstalledFlowAuthenticator::builder(self.application_secret(), InstalledFlowReturnMethod::Interactive)
                .flow_delegate(Box::new(delegate))
                .with_storage(Box::new(slot.clone()))
                .build()
                .await
                .map_err(|e| DeliveryError::Refresh(format!("OAuth2 authenticator init failed: {}", e)))?;

            let obtained = if refresh {
                auth.force_refreshed_token(SCOPES).await
            } else {
                auth.token(SCOPES).await
            };
            obtained.map_err(|e| DeliveryError::Refresh(format!("token endpoint refused the grant: {}", e)))?;

            slot.take()
                .ok_or_else(|| DeliveryError::Refresh("token endpoint returned no token".to_string()))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled("token request cancelled".to_string())),
            outcome = tokio::time::timeout(REQUEST_TIMEOUT, exchange) => match outcome {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Refresh(format!("token endpoint did not answer within {:?}", REQUEST_TIMEOUT))),
            },
        }
    }

    /// Runs one userinfo request under the request deadline.
    async fn call<T: DeserializeOwned>(&self, request: Request<Body>, cancel: &CancellationToken) -> Result<T> {
        let fail = DeliveryError::Unauthenticated;
        let exchange = async {
            let response = self
                .http
                .request(request)
                .await
                .map_err(|e| fail(format!("identity provider unreachable: {}", e)))?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| fail(format!("failed to read identity provider response: {}", e)))?;

            if !status.is_success() {
                let detail = match serde_json::from_slice::<ErrorResponse>(&body) {
                    Ok(err) => match err.error_description {
                        Some(description) => format!("{} ({})", err.error, description),
                        None => err.error,
                    },
                    Err(_) => String::from_utf8_lossy(&body).trim().to_string(),
                };
                return Err(fail(format!("identity provider answered {}: {}", status, detail)));
            }

            serde_json::from_slice(&body)
                .map_err(|e| fail(format!("malformed identity provider response: {}", e)))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled("identity provider request cancelled".to_string())),
            outcome = tokio::time::timeout(REQUEST_TIMEOUT, exchange) => match outcome {
                Ok(result) => result,
                Err(_) => Err(fail(format!("identity provider did not answer within {:?}", REQUEST_TIMEOUT))),
            },
        }
    }
}

impl TokenEndpoint for OAuthClient {
    fn fresh_token<'a>(
        &'a self,
        stored: &'a TokenSet,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<TokenSet>> {
        async move {
            if stored.is_valid_at(Utc::now()) {
                debug!("Stored access token still valid");
                return Ok(stored.clone());
            }
            self.refresh(stored, cancel).await
        }
        .boxed()
    }
}
