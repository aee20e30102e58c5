//! Invoice delivery: render the print page, resolve a credential, mail the
//! document and flip the invoice to `Sent`.
//!
//! The invoice status is the only thing the pipeline writes, and only after
//! the transport confirmed the message. Retries are left to the caller.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::auth::{ResolutionState, ResolveCredential};
use crate::config::AppConfig;
use crate::dispatch::{build_message, Ack, Attachment, DispatchMessage, MailTransport};
use crate::error::{DeliveryError, ErrorKind, Result};
use crate::invoice::{validate_id, InvoiceRepository, InvoiceStatus};
use crate::renderer::{PaperProfile, RenderRequest, RenderResult, Renderer, RendererSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Rendering,
    Rendered,
    ResolvingCredential,
    Dispatching,
    Sent,
    Failed(ErrorKind),
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Failed(_))
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Pending => f.write_str("pending"),
            DeliveryState::Rendering => f.write_str("rendering"),
            DeliveryState::Rendered => f.write_str("rendered"),
            DeliveryState::ResolvingCredential => f.write_str("resolving_credential"),
            DeliveryState::Dispatching => f.write_str("dispatching"),
            DeliveryState::Sent => f.write_str("sent"),
            DeliveryState::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

/// What the caller asks to send.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub invoice_id: String,
    /// Mailer session, only used with OAuth2.
    pub session_id: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug)]
pub struct DeliveryReport {
    pub invoice_id: String,
    /// Every state the invocation went through, `Pending` first.
    pub transitions: Vec<DeliveryState>,
    pub credential_state: Option<ResolutionState>,
    pub outcome: Result<Ack>,
}

impl DeliveryReport {
    pub fn state(&self) -> DeliveryState {
        self.transitions.last().copied().unwrap_or(DeliveryState::Pending)
    }

    pub fn is_sent(&self) -> bool {
        self.state() == DeliveryState::Sent
    }

    pub fn into_result(self) -> Result<Ack> {
        self.outcome
    }
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub public_url: String,
    pub render_timeout: Duration,
    pub export_timeout: Duration,
    pub paper: PaperProfile,
}

impl DeliverySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        DeliverySettings {
            public_url: config.public_url.clone(),
            render_timeout: config.renderer.render_timeout,
            export_timeout: config.renderer.export_timeout,
            paper: config.renderer.paper,
        }
    }

    fn render_request(&self, invoice_id: &str, timeout: Duration) -> RenderRequest {
        RenderRequest {
            url: format!("{}/invoices/{}/print", self.public_url.trim_end_matches('/'), invoice_id),
            timeout,
            paper: self.paper,
            title: invoice_id.to_string(),
        }
    }
}

struct StateTracker<'a> {
    invoice_id: &'a str,
    transitions: Vec<DeliveryState>,
}

impl<'a> StateTracker<'a> {
    fn new(invoice_id: &'a str) -> Self {
        StateTracker { invoice_id, transitions: vec![DeliveryState::Pending] }
    }

    fn advance(&mut self, next: DeliveryState) {
        let current = self.transitions.last().copied().unwrap_or(DeliveryState::Pending);
        match next {
            DeliveryState::Failed(_) => warn!("Invoice {}: {} -> {}", self.invoice_id, current, next),
            _ => info!("Invoice {}: {} -> {}", self.invoice_id, current, next),
        }
        self.transitions.push(next);
    }
}

pub struct DeliveryPipeline {
    renderer: Arc<dyn Renderer>,
    credentials: Arc<dyn ResolveCredential>,
    transport: Arc<dyn MailTransport>,
    invoices: Arc<dyn InvoiceRepository>,
    settings: DeliverySettings,
}

impl DeliveryPipeline {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        credentials: Arc<dyn ResolveCredential>,
        transport: Arc<dyn MailTransport>,
        invoices: Arc<dyn InvoiceRepository>,
        settings: DeliverySettings,
    ) -> Self {
        DeliveryPipeline { renderer, credentials, transport, invoices, settings }
    }

    /// Runs one delivery to a terminal state. Never retries.
    pub async fn deliver(&self, request: &DeliveryRequest, cancel: &CancellationToken) -> DeliveryReport {
        let mut tracker = StateTracker::new(&request.invoice_id);
        let mut credential_state = None;

        let outcome = self.run(request, cancel, &mut tracker, &mut credential_state).await;
        match &outcome {
            Ok(ack) => {
                tracker.advance(DeliveryState::Sent);
                info!("✅ Invoice {} sent to {} ({})", request.invoice_id, request.recipients.join(", "), ack.code);
            }
            Err(e) => {
                tracker.advance(DeliveryState::Failed(e.kind()));
                error!("❌ Delivery of invoice {} failed: {}", request.invoice_id, e);
            }
        }

        DeliveryReport {
            invoice_id: request.invoice_id.clone(),
            transitions: tracker.transitions,
            credential_state,
            outcome,
        }
    }

    async fn run(
        &self,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        tracker: &mut StateTracker<'_>,
        credential_state: &mut Option<ResolutionState>,
    ) -> Result<Ack> {
        validate_id(&request.invoice_id)?;

        tracker.advance(DeliveryState::Rendering);
        let render = self.settings.render_request(&request.invoice_id, self.settings.render_timeout);
        let document = self.render_document(&render, cancel).await?;
        tracker.advance(DeliveryState::Rendered);

        tracker.advance(DeliveryState::ResolvingCredential);
        let resolution = self.credentials.resolve(request.session_id.as_deref(), cancel).await?;
        *credential_state = Some(resolution.state);

        tracker.advance(DeliveryState::Dispatching);
        let sender = resolution
            .credential
            .sender()
            .ok_or_else(|| DeliveryError::NotConfigured("credential carries no sender address".to_string()))?
            .to_string();

        let payload = build_message(&DispatchMessage {
            sender,
            recipients: request.recipients.clone(),
            subject: request.subject.clone(),
            body: request.body.clone(),
            attachment: Attachment {
                filename: format!("{}.pdf", request.invoice_id),
                content_type: document.content_type().to_string(),
                content: document.into_bytes(),
            },
        })?;

        let ack = self.transport.send(&payload, &resolution.credential, cancel).await?;

        // The mail is out; cancellation no longer applies.
        self.mark_sent(&request.invoice_id).await?;
        Ok(ack)
    }

    async fn mark_sent(&self, invoice_id: &str) -> Result<()> {
        let mut invoice = self.invoices.load(invoice_id).await?;
        if invoice.status == InvoiceStatus::Sent {
            warn!("Invoice {} was already marked as sent", invoice_id);
        }
        invoice.status = InvoiceStatus::Sent;
        self.invoices.save(&invoice).await?;
        info!("Invoice {} status updated to sent", invoice_id);
        Ok(())
    }

    /// Renders an invoice's print page to a document without sending it.
    pub async fn export_document(&self, invoice_id: &str, cancel: &CancellationToken) -> Result<RenderResult> {
        validate_id(invoice_id)?;
        let request = self.settings.render_request(invoice_id, self.settings.export_timeout);
        info!("📄 Exporting invoice {} ({})", invoice_id, request.paper);

        let document = self.render_document(&request, cancel).await?;
        info!("✅ Invoice {} exported ({} bytes)", invoice_id, document.len());
        Ok(document)
    }

    /// Opens a session for this call only and closes it on every path.
    async fn render_document(&self, request: &RenderRequest, cancel: &CancellationToken) -> Result<RenderResult> {
        let mut session = self.renderer.open(cancel).await?;
        let result = render_in_tab(session.as_ref(), request, cancel).await;
        session.close().await;
        result
    }
}

async fn render_in_tab(
    session: &dyn RendererSession,
    request: &RenderRequest,
    cancel: &CancellationToken,
) -> Result<RenderResult> {
    let tab = session.open_tab().await?;
    let result = tab.render_to_document(request, cancel).await;
    tab.close().await;
    result
}
