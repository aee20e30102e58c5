use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;

use crate::error::DeliveryError;
use crate::renderer::PaperProfile;

const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";
const DEFAULT_STORAGE_PATH: &str = "./db";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Which kind of credential the mail transport is used with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Static,
    OAuth2,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Static => "plain",
            AuthMethod::OAuth2 => "oauth2",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage: StorageSettings,
    pub public_url: String,
    pub renderer: RendererSettings,
    pub smtp: SmtpSettings,
    pub static_sender: StaticSenderSettings,
    pub oauth: Option<OAuthSettings>,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub invoices: PathBuf,
    pub sessions: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    /// Remote endpoint (`http://host:9222`); `None` launches a local browser.
    pub remote_url: Option<String>,
    pub executable: Option<PathBuf>,
    pub render_timeout: Duration,
    pub export_timeout: Duration,
    pub paper: PaperProfile,
}

/// Transport endpoint. Host and port stay raw until send time so that a
/// missing value surfaces as `IncompleteConfig` for the invocation that needs it.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: Option<String>,
    pub tls: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct StaticSenderSettings {
    pub from: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    StartTls,
    Tls,
    None,
}

/// Validated transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
}

/// Raw environment, as read by the `config` crate (keys are lowercased variable names).
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    storage_path: Option<String>,
    public_url: Option<String>,
    chrome_remote_url: Option<String>,
    chrome_bin: Option<String>,
    render_timeout_secs: Option<String>,
    pdf_timeout_secs: Option<String>,
    pdf_paper_size: Option<String>,
    smtp_host: Option<String>,
    smtp_port: Option<String>,
    smtp_tls: Option<String>,
    smtp_timeout_secs: Option<String>,
    smtp_from: Option<String>,
    smtp_password: Option<String>,
    google_oauth_client_id: Option<String>,
    google_oauth_client_secret: Option<String>,
    oauth_redirect_url: Option<String>,
}

impl AppConfig {
    pub fn new() -> Result<Self> {
        let raw: RawSettings = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("Unable to read configuration from environment")?
            .try_deserialize()
            .context("Unable to parse configuration")?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let root = PathBuf::from(non_blank(raw.storage_path).unwrap_or_else(|| DEFAULT_STORAGE_PATH.to_string()));

        let public_url = non_blank(raw.public_url).unwrap_or_else(|| {
            warn!("PUBLIC_URL not set, defaulting to {}", DEFAULT_PUBLIC_URL);
            DEFAULT_PUBLIC_URL.to_string()
        });
        let public_url = public_url.trim_end_matches('/').to_string();

        let paper = match non_blank(raw.pdf_paper_size) {
            Some(name) => PaperProfile::from_str(&name)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid PDF_PAPER_SIZE")?,
            None => PaperProfile::A3,
        };

        let renderer = RendererSettings {
            remote_url: non_blank(raw.chrome_remote_url).map(|u| u.trim_end_matches('/').to_string()),
            executable: non_blank(raw.chrome_bin).map(PathBuf::from),
            render_timeout: seconds(raw.render_timeout_secs, 10).context("Invalid RENDER_TIMEOUT_SECS")?,
            export_timeout: seconds(raw.pdf_timeout_secs, 30).context("Invalid PDF_TIMEOUT_SECS")?,
            paper,
        };

        let smtp = SmtpSettings {
            host: non_blank(raw.smtp_host),
            port: non_blank(raw.smtp_port),
            tls: non_blank(raw.smtp_tls),
            timeout: seconds(raw.smtp_timeout_secs, 30).context("Invalid SMTP_TIMEOUT_SECS")?,
        };

        let static_sender = StaticSenderSettings {
            from: non_blank(raw.smtp_from),
            password: non_blank(raw.smtp_password),
        };

        let oauth = match (non_blank(raw.google_oauth_client_id), non_blank(raw.google_oauth_client_secret)) {
            (Some(client_id), Some(client_secret)) => Some(OAuthSettings {
                client_id,
                client_secret,
                redirect_url: non_blank(raw.oauth_redirect_url)
                    .unwrap_or_else(|| format!("{}/api/v1/mailer/auth/google/callback", public_url)),
                auth_url: GOOGLE_AUTH_URL.to_string(),
                token_url: GOOGLE_TOKEN_URL.to_string(),
                userinfo_url: GOOGLE_USERINFO_URL.to_string(),
            }),
            _ => None,
        };

        let auth_method = if static_sender.password.is_some() {
            warn!("⚠️  Using SMTP_PASSWORD is not recommended for security reasons. Prefer Google OAuth.");
            AuthMethod::Static
        } else if oauth.is_some() {
            info!("Google OAuth credentials loaded");
            AuthMethod::OAuth2
        } else {
            warn!("Neither Google OAuth nor SMTP credentials are set - email sending disabled");
            AuthMethod::None
        };

        Ok(AppConfig {
            storage: StorageSettings {
                invoices: root.join("invoices"),
                sessions: root.join("sessions"),
                root,
            },
            public_url,
            renderer,
            smtp,
            static_sender,
            oauth,
            auth_method,
        })
    }
}

impl SmtpSettings {
    pub fn endpoint(&self) -> Result<SmtpEndpoint, DeliveryError> {
        let (host, port) = match (&self.host, &self.port) {
            (Some(host), Some(port)) => (host.clone(), port),
            _ => {
                return Err(DeliveryError::IncompleteConfig(
                    "either SMTP_HOST or SMTP_PORT is not configured".to_string(),
                ))
            }
        };
        let port: u16 = port
            .parse()
            .map_err(|_| DeliveryError::IncompleteConfig(format!("malformed SMTP_PORT '{}'", port)))?;

        let tls = match self.tls.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None if port == 465 => TlsMode::Tls,
            None | Some("starttls") => TlsMode::StartTls,
            Some("tls") => TlsMode::Tls,
            Some("none") => TlsMode::None,
            Some(other) => {
                return Err(DeliveryError::IncompleteConfig(format!(
                    "unknown SMTP_TLS '{}' (expected starttls, tls or none)",
                    other
                )))
            }
        };

        Ok(SmtpEndpoint { host, port, tls })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn seconds(value: Option<String>, default: u64) -> Result<Duration> {
    match non_blank(value) {
        Some(v) => Ok(Duration::from_secs(v.parse().context("expected a number of seconds")?)),
        None => Ok(Duration::from_secs(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawSettings {
        RawSettings::default()
    }

    #[test]
    fn test_defaults_without_credentials() {
        let config = AppConfig::from_raw(raw()).unwrap();
        assert_eq!(config.auth_method, AuthMethod::None);
        assert_eq!(config.public_url, "http://localhost:8080");
        assert_eq!(config.renderer.paper, PaperProfile::A3);
        assert_eq!(config.renderer.render_timeout, Duration::from_secs(10));
        assert_eq!(config.renderer.export_timeout, Duration::from_secs(30));
        assert_eq!(config.storage.invoices, PathBuf::from("./db").join("invoices"));
    }

    #[test]
    fn test_password_wins_over_oauth() {
        let mut settings = raw();
        settings.smtp_password = Some("secret".into());
        settings.google_oauth_client_id = Some("id".into());
        settings.google_oauth_client_secret = Some("shh".into());
        assert_eq!(AppConfig::from_raw(settings).unwrap().auth_method, AuthMethod::Static);
    }

    #[test]
    fn test_oauth_redirect_defaults_to_public_url() {
        let mut settings = raw();
        settings.public_url = Some("https://billing.example.com/".into());
        settings.google_oauth_client_id = Some("id".into());
        settings.google_oauth_client_secret = Some("shh".into());
        let config = AppConfig::from_raw(settings).unwrap();
        assert_eq!(config.auth_method, AuthMethod::OAuth2);
        assert_eq!(
            config.oauth.unwrap().redirect_url,
            "https://billing.example.com/api/v1/mailer/auth/google/callback"
        );
    }

    #[test]
    fn test_smtp_endpoint_validation() {
        let mut smtp = SmtpSettings { host: Some("smtp.example.com".into()), port: None, tls: None, timeout: Duration::from_secs(5) };
        assert!(matches!(smtp.endpoint(), Err(DeliveryError::IncompleteConfig(_))));

        smtp.port = Some("abc".into());
        assert!(matches!(smtp.endpoint(), Err(DeliveryError::IncompleteConfig(_))));

        smtp.port = Some("465".into());
        assert_eq!(smtp.endpoint().unwrap().tls, TlsMode::Tls);

        smtp.port = Some("587".into());
        assert_eq!(smtp.endpoint().unwrap().tls, TlsMode::StartTls);

        smtp.tls = Some("NONE".into());
        assert_eq!(smtp.endpoint().unwrap().tls, TlsMode::None);
    }
}
