use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::emulation::SetEmulatedMediaParams;
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::cdp::js_protocol::runtime::{EvaluateParams, EventConsoleApiCalled, EventExceptionThrown};
use chromiumoxide::handler::Handler;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    marker_scan_script, wait_for_marker, MarkerScan, RenderRequest, RenderResult, RenderTab, Renderer,
    RendererSession,
};
use crate::config::RendererSettings;
use crate::error::{DeliveryError, Result};

const MARKER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CDP_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const EXECUTABLE_CANDIDATES: [&str; 3] = ["chromium-browser", "google-chrome", "chromium"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChromeEndpoint {
    /// Launch a headless browser as a child process.
    Local { executable: Option<PathBuf> },
    /// Attach to an already running browser (`http://host:9222`).
    Remote { url: String },
}

/// Opens one browser per session, either launched locally or attached remotely.
pub struct ChromeRenderer {
    endpoint: ChromeEndpoint,
}

impl ChromeRenderer {
    pub fn new(endpoint: ChromeEndpoint) -> Self {
        ChromeRenderer { endpoint }
    }

    pub fn from_settings(settings: &RendererSettings) -> Self {
        let endpoint = match &settings.remote_url {
            Some(url) => {
                info!("Renderer mode: remote ({})", url);
                ChromeEndpoint::Remote { url: url.clone() }
            }
            None => {
                info!("Renderer mode: local");
                ChromeEndpoint::Local { executable: settings.executable.clone() }
            }
        };
        ChromeRenderer::new(endpoint)
    }

    async fn connect(&self) -> Result<ChromeSession> {
        match &self.endpoint {
            ChromeEndpoint::Local { executable } => {
                let profile_dir = tempfile::Builder::new()
                    .prefix("invoice-renderer-")
                    .tempdir()
                    .map_err(|e| DeliveryError::Transport(format!("unable to create browser profile dir: {}", e)))?;

                let executable = executable.clone().or_else(find_executable);
                match &executable {
                    Some(path) => debug!("Using browser executable at {}", path.display()),
                    None => debug!("Using default browser executable"),
                }

                let config = launch_config(executable.as_deref(), profile_dir.path())?;
                let (browser, handler) = Browser::launch(config)
                    .await
                    .map_err(|e| DeliveryError::Transport(format!("could not launch browser: {}", e)))?;

                Ok(ChromeSession::start(browser, handler, false, Some(profile_dir)))
            }
            ChromeEndpoint::Remote { url } => {
                let ws_url = discover_websocket_url(url).await?;
                debug!("Remote browser websocket: {}", ws_url);

                let (browser, handler) = Browser::connect(ws_url)
                    .await
                    .map_err(|e| DeliveryError::Transport(format!("could not connect to browser at {}: {}", url, e)))?;

                Ok(ChromeSession::start(browser, handler, true, None))
            }
        }
    }
}

impl Renderer for ChromeRenderer {
    fn open<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Box<dyn RendererSession>>> {
        async move {
            let session = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DeliveryError::Cancelled("renderer start was cancelled".to_string()));
                }
                session = self.connect() => session?,
            };
            info!("🖨️  Renderer session opened");
            Ok(Box::new(session) as Box<dyn RendererSession>)
        }
        .boxed()
    }
}

/// A browser connection plus the task driving its CDP event loop.
pub struct ChromeSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    remote: bool,
    // Removed when the session is dropped.
    _profile_dir: Option<tempfile::TempDir>,
    closed: bool,
}

impl ChromeSession {
    fn start(
        browser: Browser,
        mut handler: Handler,
        remote: bool,
        profile_dir: Option<tempfile::TempDir>,
    ) -> Self {
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Renderer protocol event error: {}", e);
                }
            }
            debug!("Renderer event loop exited");
        });

        ChromeSession {
            browser,
            handler_task,
            remote,
            _profile_dir: profile_dir,
            closed: false,
        }
    }

    async fn kill(&mut self) {
        if let Some(Err(e)) = self.browser.kill().await {
            warn!("Unable to kill browser process: {}", e);
        }
    }
}

impl RendererSession for ChromeSession {
    fn open_tab(&self) -> BoxFuture<'_, Result<Box<dyn RenderTab>>> {
        async move {
            let page = self
                .browser
                .new_page("about:blank")
                .await
                .map_err(|e| DeliveryError::Transport(format!("failed to create tab: {}", e)))?;
            let listeners = forward_page_events(&page).await;
            Ok(Box::new(ChromeTab { page, listeners }) as Box<dyn RenderTab>)
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if self.closed {
                return;
            }
            self.closed = true;

            // A remote browser is shared: only the connection is dropped.
            if !self.remote {
                let exit = match within_grace(self.browser.close(), CLOSE_GRACE).await {
                    StepOutcome::Done => within_grace(self.browser.wait(), CLOSE_GRACE).await,
                    outcome => outcome,
                };
                match exit {
                    StepOutcome::Done => {}
                    StepOutcome::Failed(e) => {
                        warn!("Browser did not close cleanly ({}), killing it", e);
                        self.kill().await;
                    }
                    StepOutcome::Overdue => {
                        warn!("Browser did not exit within {:?}, killing it", CLOSE_GRACE);
                        self.kill().await;
                    }
                }
            }

            self.handler_task.abort();
            info!("Renderer session closed");
        }
        .boxed()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StepOutcome {
    Done,
    Failed(String),
    Overdue,
}

/// Runs one shutdown step, giving up after `grace`.
async fn within_grace<F, T, E>(step: F, grace: Duration) -> StepOutcome
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(grace, step).await {
        Ok(Ok(_)) => StepOutcome::Done,
        Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
        Err(_) => StepOutcome::Overdue,
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Renderer session dropped without close()");
            self.handler_task.abort();
        }
    }
}

pub struct ChromeTab {
    page: Page,
    listeners: Vec<JoinHandle<()>>,
}

impl ChromeTab {
    /// Navigates, sets the title and switches to print media.
    async fn prepare(&self, request: &RenderRequest) -> Result<()> {
        self.page
            .goto(request.url.as_str())
            .await
            .map_err(|e| DeliveryError::Transport(format!("failed to navigate to {}: {}", request.url, e)))?;

        let title = serde_json::to_string(&request.title).unwrap_or_default();
        if let Err(e) = self.page.evaluate_expression(expression(format!("document.title = {}", title))).await {
            warn!("Unable to set document title for {}: {}", request.url, e);
        }

        self.page
            .execute(SetEmulatedMediaParams::builder().media("print").build())
            .await
            .map_err(|e| DeliveryError::Transport(format!("failed to switch to print media: {}", e)))?;
        Ok(())
    }

    async fn scan_markers(&self, script: &str) -> Result<MarkerScan> {
        let result = self
            .page
            .evaluate_expression(expression(script.to_string()))
            .await
            .map_err(|e| DeliveryError::Transport(format!("marker scan failed: {}", e)))?;
        result
            .into_value::<MarkerScan>()
            .map_err(|e| DeliveryError::Transport(format!("unexpected marker scan result: {}", e)))
    }

    async fn render(&self, request: &RenderRequest) -> Result<RenderResult> {
        let started = Instant::now();

        tokio::time::timeout(request.timeout, self.prepare(request))
            .await
            .map_err(|_| DeliveryError::Timeout(format!("{} did not load within {:?}", request.url, request.timeout)))??;

        let script = marker_scan_script();
        let remaining = request.timeout.saturating_sub(started.elapsed());
        wait_for_marker(&request.url, remaining, MARKER_POLL_INTERVAL, || self.scan_markers(&script).boxed()).await?;

        let params = PrintToPdfParams::builder()
            .print_background(true)
            .paper_width(request.paper.width_inches())
            .paper_height(request.paper.height_inches())
            .build();
        let bytes = tokio::time::timeout(request.timeout, self.page.pdf(params))
            .await
            .map_err(|_| DeliveryError::Timeout(format!("document capture of {} timed out", request.url)))?
            .map_err(|e| DeliveryError::Transport(format!("failed to capture document for {}: {}", request.url, e)))?;

        info!(
            "✅ Rendered {} ({} bytes, {}) in {:?}",
            request.url,
            bytes.len(),
            request.paper,
            started.elapsed()
        );
        Ok(RenderResult::pdf(bytes))
    }
}

impl RenderTab for ChromeTab {
    fn render_to_document<'a>(
        &'a self,
        request: &'a RenderRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<RenderResult>> {
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Err(DeliveryError::Cancelled(format!("rendering {} was cancelled", request.url)))
                }
                result = self.render(request) => result,
            }
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let ChromeTab { page, listeners } = *self;
        async move {
            for listener in &listeners {
                listener.abort();
            }
            if let Err(e) = page.close().await {
                debug!("Unable to close tab: {}", e);
            }
        }
        .boxed()
    }
}

fn expression(script: String) -> EvaluateParams {
    let mut params = EvaluateParams::new(script);
    params.return_by_value = Some(true);
    params.await_promise = Some(true);
    params
}

/// Forwards page exceptions and console output to the log, under `renderer::page`.
async fn forward_page_events(page: &Page) -> Vec<JoinHandle<()>> {
    let mut listeners = Vec::new();

    match page.event_listener::<EventExceptionThrown>().await {
        Ok(mut events) => listeners.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                warn!(target: "renderer::page", "[exception] {}", event.exception_details.text);
            }
        })),
        Err(e) => debug!("Unable to listen for page exceptions: {}", e),
    }

    match page.event_listener::<EventConsoleApiCalled>().await {
        Ok(mut events) => listeners.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                for arg in &event.args {
                    let text = arg
                        .value
                        .as_ref()
                        .map(|v| v.to_string())
                        .or_else(|| arg.description.clone())
                        .unwrap_or_default();
                    info!(target: "renderer::page", "[console] {:?}: {}", event.r#type, text);
                }
            }
        })),
        Err(e) => debug!("Unable to listen for page console: {}", e),
    }

    listeners
}

fn launch_config(executable: Option<&Path>, profile_dir: &Path) -> Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .request_timeout(CDP_REQUEST_TIMEOUT)
        .user_data_dir(profile_dir)
        .arg("--disable-gpu")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--mute-audio")
        .arg("--ignore-certificate-errors");

    if cfg!(target_os = "linux") {
        // Container friendly flags.
        builder = builder
            .no_sandbox()
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-software-rasterizer");
    }

    if let Some(path) = executable {
        builder = builder.chrome_executable(path);
    }

    builder
        .build()
        .map_err(|e| DeliveryError::Transport(format!("invalid browser configuration: {}", e)))
}

fn find_executable() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    EXECUTABLE_CANDIDATES.iter().find_map(|name| {
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    web_socket_debugger_url: Option<String>,
}

fn parse_version_info(body: &[u8]) -> Result<String> {
    let info: VersionInfo = serde_json::from_slice(body)
        .map_err(|e| DeliveryError::Transport(format!("malformed json/version response: {}", e)))?;
    info.web_socket_debugger_url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| DeliveryError::Transport("json/version response missing 'webSocketDebuggerUrl'".to_string()))
}

async fn discover_websocket_url(remote_url: &str) -> Result<String> {
    let uri: hyper::Uri = format!("{}/json/version", remote_url)
        .parse()
        .map_err(|e| DeliveryError::Transport(format!("invalid renderer url '{}': {}", remote_url, e)))?;

    let client = hyper::Client::new();
    let response = tokio::time::timeout(CDP_REQUEST_TIMEOUT, client.get(uri))
        .await
        .map_err(|_| DeliveryError::Timeout(format!("renderer at {} did not answer", remote_url)))?
        .map_err(|e| DeliveryError::Transport(format!("failed to get remote browser version info: {}", e)))?;

    if !response.status().is_success() {
        return Err(DeliveryError::Transport(format!(
            "remote browser version info returned {}",
            response.status()
        )));
    }

    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| DeliveryError::Transport(format!("failed to read remote browser version info: {}", e)))?;
    parse_version_info(&body)
}
