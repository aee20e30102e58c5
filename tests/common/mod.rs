// Fakes shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use invoice_delivery::auth::{Credential, MemorySessionStore, SessionRecord, SessionStore, TokenEndpoint, TokenSet};
use invoice_delivery::dispatch::{Ack, MailTransport, Payload};
use invoice_delivery::error::{DeliveryError, Result};
use invoice_delivery::invoice::{Invoice, InvoiceRepository, InvoiceStatus};
use invoice_delivery::renderer::{RenderRequest, RenderResult, RenderTab, Renderer, RendererSession};

/// Ordered record of side effects across fakes.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// ---------- renderer ----------

#[derive(Clone)]
pub enum PageBehavior {
    Complete(Vec<u8>),
    ErrorMarker(String),
    NeverReady,
    Unreachable,
}

pub struct FakeRenderer {
    behavior: PageBehavior,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<RenderRequest>>>,
}

impl FakeRenderer {
    pub fn new(behavior: PageBehavior) -> Self {
        FakeRenderer {
            behavior,
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn opened(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Renderer for FakeRenderer {
    fn open<'a>(&'a self, _: &'a CancellationToken) -> BoxFuture<'a, Result<Box<dyn RendererSession>>> {
        async move {
            if let PageBehavior::Unreachable = self.behavior {
                return Err(DeliveryError::Transport("renderer unreachable".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                behavior: self.behavior.clone(),
                closes: self.closes.clone(),
                requests: self.requests.clone(),
            }) as Box<dyn RendererSession>)
        }
        .boxed()
    }
}

struct FakeSession {
    behavior: PageBehavior,
    closes: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RenderRequest>>>,
}

impl RendererSession for FakeSession {
    fn open_tab(&self) -> BoxFuture<'_, Result<Box<dyn RenderTab>>> {
        async move {
            Ok(Box::new(FakeTab { behavior: self.behavior.clone(), requests: self.requests.clone() })
                as Box<dyn RenderTab>)
        }
        .boxed()
    }

    // Counts every call so a double close shows up in the tests.
    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        async {}.boxed()
    }
}

struct FakeTab {
    behavior: PageBehavior,
    requests: Arc<Mutex<Vec<RenderRequest>>>,
}

impl RenderTab for FakeTab {
    fn render_to_document<'a>(
        &'a self,
        request: &'a RenderRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<RenderResult>> {
        async move {
            self.requests.lock().unwrap().push(request.clone());
            match &self.behavior {
                PageBehavior::Complete(bytes) => Ok(RenderResult::pdf(bytes.clone())),
                PageBehavior::ErrorMarker(message) => Err(invoice_delivery::renderer::render_error(message.clone())),
                PageBehavior::NeverReady | PageBehavior::Unreachable => tokio::select! {
                    _ = cancel.cancelled() => Err(DeliveryError::Cancelled("render cancelled".to_string())),
                    _ = tokio::time::sleep(request.timeout) => {
                        Err(DeliveryError::Timeout("no render marker before deadline".to_string()))
                    }
                },
            }
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

// ---------- credentials ----------

/// Session store that logs every write.
#[derive(Clone)]
pub struct RecordingSessionStore {
    inner: MemorySessionStore,
    pub writes: Arc<AtomicUsize>,
    log: EventLog,
}

impl RecordingSessionStore {
    pub fn new(log: EventLog) -> Self {
        RecordingSessionStore { inner: MemorySessionStore::new(), writes: Arc::new(AtomicUsize::new(0)), log }
    }

    pub async fn seed(&self, session_id: &str, record: &SessionRecord) {
        self.inner.set(session_id, record).await.unwrap();
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SessionStore for RecordingSessionStore {
    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<SessionRecord>>> {
        self.inner.get(session_id)
    }

    fn set<'a>(&'a self, session_id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<()>> {
        async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.log.push(format!("session_write:{}", record.access_token));
            self.inner.set(session_id, record).await
        }
        .boxed()
    }

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        self.inner.remove(session_id)
    }
}

/// Token endpoint that refreshes any token other than `current` into `current`.
pub struct FakeTokenEndpoint {
    current: String,
    delay: Duration,
    pub calls: AtomicUsize,
    pub refreshes: AtomicUsize,
    fail: Option<String>,
}

impl FakeTokenEndpoint {
    pub fn issuing(current: &str) -> Self {
        FakeTokenEndpoint {
            current: current.to_string(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            fail: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(message: &str) -> Self {
        FakeTokenEndpoint { fail: Some(message.to_string()), ..FakeTokenEndpoint::issuing("") }
    }
}

impl TokenEndpoint for FakeTokenEndpoint {
    fn fresh_token<'a>(&'a self, stored: &'a TokenSet, _: &'a CancellationToken) -> BoxFuture<'a, Result<TokenSet>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.fail {
                return Err(DeliveryError::Refresh(message.clone()));
            }
            if stored.access_token == self.current {
                return Ok(stored.clone());
            }
            tokio::time::sleep(self.delay).await;
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(TokenSet {
                access_token: self.current.clone(),
                refresh_token: stored.refresh_token.clone(),
                expiry: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            })
        }
        .boxed()
    }
}

pub fn session_record(access_token: &str, email: &str) -> SessionRecord {
    SessionRecord {
        access_token: access_token.to_string(),
        refresh_token: "RT1".to_string(),
        expiry: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
        account_email: email.to_string(),
    }
}

// ---------- transport ----------

pub struct FakeTransport {
    outcome: Result<Ack>,
    pub sent: Mutex<Vec<(Payload, Credential)>>,
    log: EventLog,
}

impl FakeTransport {
    pub fn accepting(log: EventLog) -> Self {
        FakeTransport { outcome: Ok(Ack { code: 250, message: "2.0.0 OK".to_string() }), sent: Mutex::new(Vec::new()), log }
    }

    pub fn failing(error: DeliveryError, log: EventLog) -> Self {
        FakeTransport { outcome: Err(error), sent: Mutex::new(Vec::new()), log }
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl MailTransport for FakeTransport {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        credential: &'a Credential,
        _: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Ack>> {
        async move {
            let token = match credential {
                Credential::OAuth2 { access_token, .. } => access_token.clone(),
                Credential::Static { .. } => "static".to_string(),
                Credential::None => "none".to_string(),
            };
            self.log.push(format!("send:{}", token));
            self.sent.lock().unwrap().push((payload.clone(), credential.clone()));
            self.outcome.clone()
        }
        .boxed()
    }
}

// ---------- invoices ----------

#[derive(Default)]
pub struct MemoryInvoices {
    invoices: Mutex<HashMap<String, Invoice>>,
    pub loads: AtomicUsize,
    pub saves: AtomicUsize,
}

impl MemoryInvoices {
    pub fn with_draft(id: &str) -> Self {
        let repo = MemoryInvoices::default();
        let mut fields = Map::new();
        fields.insert("email_target".to_string(), serde_json::json!("client@example.org"));
        repo.invoices.lock().unwrap().insert(
            id.to_string(),
            Invoice { id: id.to_string(), status: InvoiceStatus::Draft, fields },
        );
        repo
    }

    pub fn status(&self, id: &str) -> InvoiceStatus {
        self.invoices.lock().unwrap()[id].status
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl InvoiceRepository for MemoryInvoices {
    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Invoice>> {
        async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.invoices
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| DeliveryError::Persist(format!("invoice {} not found", id)))
        }
        .boxed()
    }

    fn save<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, Result<()>> {
        async move {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.invoices.lock().unwrap().insert(invoice.id.clone(), invoice.clone());
            Ok(())
        }
        .boxed()
    }
}
