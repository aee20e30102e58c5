//! Outgoing mail: message construction and the SMTP transport.
pub mod message;

use futures::future::{BoxFuture, FutureExt};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::Tls;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::auth::Credential;
use crate::config::{SmtpSettings, TlsMode};
use crate::error::{DeliveryError, Result};

pub use message::{build_message, Attachment, DispatchMessage, Payload};

/// Server confirmation of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub code: u16,
    pub message: String,
}

/// Mail transport collaborator.
///
/// Implementations authenticate with the mechanism implied by the credential
/// and never refresh it themselves: a rejected credential is reported as
/// [`DeliveryError::AuthRejected`].
pub trait MailTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        credential: &'a Credential,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Ack>>;
}

/// SMTP transport. Opens one connection per message.
pub struct DispatchService {
    settings: SmtpSettings,
}

impl DispatchService {
    pub fn new(settings: SmtpSettings) -> Self {
        DispatchService { settings }
    }

    fn transport(&self, credential: &Credential) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let endpoint = self.settings.endpoint()?;

        let builder = match endpoint.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&endpoint.host).tls(Tls::None),
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&endpoint.host)
                .map_err(|e| DeliveryError::Transport(format!("smtp starttls relay init failed: {}", e)))?,
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&endpoint.host)
                .map_err(|e| DeliveryError::Transport(format!("smtp tls relay init failed: {}", e)))?,
        };
        let builder = builder.port(endpoint.port).timeout(Some(self.settings.timeout));

        let builder = match credential {
            Credential::None => {
                return Err(DeliveryError::NotConfigured("no credential for the mail transport".to_string()))
            }
            Credential::Static { sender, secret } => builder
                .credentials(Credentials::new(sender.clone(), secret.clone()))
                .authentication(vec![Mechanism::Plain, Mechanism::Login]),
            Credential::OAuth2 { account_email, access_token } => builder
                .credentials(Credentials::new(account_email.clone(), access_token.clone()))
                .authentication(vec![Mechanism::Xoauth2]),
        };

        debug!("SMTP transport {}:{} ({:?})", endpoint.host, endpoint.port, endpoint.tls);
        Ok(builder.build())
    }
}

impl MailTransport for DispatchService {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        credential: &'a Credential,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Ack>> {
        async move {
            let transport = self.transport(credential)?;

            info!("📤 Sending {} bytes to {} recipient(s)", payload.len(), payload.recipients().len());

            // Dropping the send future closes the connection.
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DeliveryError::Cancelled("mail transport send cancelled".to_string()))
                }
                result = transport.send(payload.message().clone()) => result.map_err(classify_smtp_error)?,
            };

            let ack = Ack {
                code: response.code().to_string().parse().unwrap_or(250),
                message: response.message().collect::<Vec<_>>().join(" "),
            };
            info!("✅ Message accepted by server ({} {})", ack.code, ack.message);
            Ok(ack)
        }
        .boxed()
    }
}

/// 534 and 535 mean the server refused the credential itself.
fn classify_smtp_error(e: lettre::transport::smtp::Error) -> DeliveryError {
    let code = e.status().and_then(|c| c.to_string().parse::<u16>().ok());
    match code {
        Some(534) | Some(535) => DeliveryError::AuthRejected(e.to_string()),
        _ if e.is_timeout() => DeliveryError::Timeout(format!("mail transport: {}", e)),
        _ => DeliveryError::Transport(format!("smtp send failed: {}", e)),
    }
}
