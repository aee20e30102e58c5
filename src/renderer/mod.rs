//! Document rendering through an external browser process.
//!
//! The pipeline only depends on the capability traits below; `chrome`
//! provides the CDP implementation and tests substitute their own.
pub mod chrome;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};

pub use chrome::ChromeRenderer;

/// Element id the print page inserts once the document is ready.
pub const RENDER_COMPLETE_MARKER: &str = "pdf-render-complete";
/// Element id the print page inserts when it failed to build the document.
pub const RENDER_ERROR_MARKER: &str = "pdf-render-error";

const GENERIC_RENDER_ERROR: &str = "page reported a render error";

/// Named paper size, in inches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperProfile {
    A4,
    A3,
    Letter,
}

impl PaperProfile {
    pub fn width_inches(&self) -> f64 {
        match self {
            PaperProfile::A4 => 8.27,
            PaperProfile::A3 => 11.69,
            PaperProfile::Letter => 8.5,
        }
    }

    pub fn height_inches(&self) -> f64 {
        match self {
            PaperProfile::A4 => 11.69,
            PaperProfile::A3 => 16.54,
            PaperProfile::Letter => 11.0,
        }
    }
}

impl FromStr for PaperProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a4" => Ok(PaperProfile::A4),
            "a3" => Ok(PaperProfile::A3),
            "letter" => Ok(PaperProfile::Letter),
            other => Err(format!("unknown paper size '{}' (expected a4, a3 or letter)", other)),
        }
    }
}

impl fmt::Display for PaperProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaperProfile::A4 => "A4",
            PaperProfile::A3 => "A3",
            PaperProfile::Letter => "Letter",
        };
        write!(f, "{} ({}in x {}in)", name, self.width_inches(), self.height_inches())
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub timeout: Duration,
    pub paper: PaperProfile,
    pub title: String,
}

/// Captured document. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    bytes: Vec<u8>,
    content_type: &'static str,
}

impl RenderResult {
    pub fn pdf(bytes: Vec<u8>) -> Self {
        RenderResult { bytes, content_type: "application/pdf" }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Starts or connects to the renderer process.
pub trait Renderer: Send + Sync {
    fn open<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Box<dyn RendererSession>>>;
}

/// One connection to a renderer process.
pub trait RendererSession: Send + Sync {
    /// Creates an isolated render context. Tabs of one session can be used concurrently.
    fn open_tab(&self) -> BoxFuture<'_, Result<Box<dyn RenderTab>>>;

    /// Releases the process or connection. Calling it again is a no-op.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub trait RenderTab: Send + Sync {
    fn render_to_document<'a>(
        &'a self,
        request: &'a RenderRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<RenderResult>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// What the page currently signals through its markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Pending,
    Complete,
    Failed(String),
}

/// Expression evaluated in the page to look for both markers at once.
pub(crate) fn marker_scan_script() -> String {
    format!(
        r#"(() => {{
    const failed = document.getElementById("{error}");
    return {{
        complete: document.getElementById("{complete}") !== null,
        error: failed !== null,
        message: failed ? (failed.textContent || "") : ""
    }};
}})()"#,
        error = RENDER_ERROR_MARKER,
        complete = RENDER_COMPLETE_MARKER,
    )
}

/// Markers found by one scan of the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct MarkerScan {
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
}

/// The error marker wins if a page inserts both.
impl From<MarkerScan> for MarkerState {
    fn from(scan: MarkerScan) -> Self {
        if scan.error {
            MarkerState::Failed(scan.message.trim().to_string())
        } else if scan.complete {
            MarkerState::Complete
        } else {
            MarkerState::Pending
        }
    }
}

/// Polls `scan` every `interval` until the page shows a marker.
///
/// Returns once the completion marker is present, fails with
/// `ApplicationRender` on the error marker and with `Timeout` when no marker
/// showed up within `timeout`. A failing scan counts as pending.
pub(crate) async fn wait_for_marker<'a, F>(url: &str, timeout: Duration, interval: Duration, scan: F) -> Result<()>
where
    F: Fn() -> BoxFuture<'a, Result<MarkerScan>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let timed_out = || DeliveryError::Timeout(format!("no render marker on {} after {:?}", url, timeout));

    loop {
        let state = match tokio::time::timeout_at(deadline, scan()).await {
            Err(_) => return Err(timed_out()),
            Ok(Ok(found)) => MarkerState::from(found),
            // The execution context is replaced while the page (re)loads.
            Ok(Err(e)) => {
                debug!("Marker scan failed: {}", e);
                MarkerState::Pending
            }
        };

        match state {
            MarkerState::Complete => return Ok(()),
            MarkerState::Failed(message) => return Err(render_error(message)),
            MarkerState::Pending => {}
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(timed_out());
        }
        tokio::time::sleep_until((now + interval).min(deadline)).await;
    }
}

/// Turns the error marker text into the pipeline error, using a generic phrase for an empty message.
pub fn render_error(message: String) -> DeliveryError {
    if message.is_empty() {
        DeliveryError::ApplicationRender(GENERIC_RENDER_ERROR.to_string())
    } else {
        DeliveryError::ApplicationRender(message)
    }
}
