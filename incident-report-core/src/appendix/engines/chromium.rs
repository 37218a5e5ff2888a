use super::devtools::DevToolsConnection;
use super::{RenderEngine, RenderRequest, RenderSession};
use crate::error::RenderError;
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;

const ENGINE_NAME: &str = "chromium";

/// Headless Chromium driven over the DevTools pipe.
///
/// One browser process lives as long as the engine and serves every job.
/// Each session gets its own browser context (separate cookies, storage and
/// cache) with a single page, disposed when the session drops. A browser that
/// has gone away is relaunched by the next session.
pub struct ChromiumEngine {
    binary: PathBuf,
    browser: BrowserSlot,
}

/// A running browser with the connection to it
struct Browser {
    connection: Arc<DevToolsConnection>,
    /// Killed on drop
    _process: Option<Child>,
    _profile: Option<TempDir>,
}

/// The one browser an engine keeps, launched lazily
#[derive(Default)]
struct BrowserSlot {
    current: AsyncMutex<Option<Browser>>,
    launches: AtomicUsize,
}

impl BrowserSlot {
    /// Connection to the live browser, launching one if there is none
    async fn get_or_launch<F, Fut>(&self, launch: F) -> Result<Arc<DevToolsConnection>, RenderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Browser, RenderError>>,
    {
        let mut current = self.current.lock().await;
        if let Some(browser) = current.as_ref().filter(|b| b.connection.is_alive()) {
            return Ok(browser.connection.clone());
        }
        if current.take().is_some() {
            log::warn!("⚠️  Browser connection lost, relaunching");
        }
        let browser = launch().await?;
        self.launches.fetch_add(1, Ordering::Relaxed);
        let connection = browser.connection.clone();
        *current = Some(browser);
        Ok(connection)
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }
}

fn unavailable(reason: String) -> RenderError {
    RenderError::EngineUnavailable {
        engine: ENGINE_NAME.to_string(),
        reason,
    }
}

impl ChromiumEngine {
    pub fn new(binary: impl AsRef<Path>) -> Result<Self, RenderError> {
        let binary = binary.as_ref().to_path_buf();
        if !binary.is_file() {
            return Err(unavailable(format!("{} is not a file", binary.display())));
        }
        Ok(Self {
            binary,
            browser: BrowserSlot::default(),
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Browser processes started so far
    pub fn launches(&self) -> usize {
        self.browser.launches()
    }

    #[cfg(unix)]
    async fn launch(&self) -> Result<Browser, RenderError> {
        use std::os::fd::AsRawFd;
        use std::process::Stdio;
        use tokio::net::unix::pipe;
        use tokio::process::Command;

        let profile = tempfile::Builder::new()
            .prefix("incident-report-browser-")
            .tempdir()
            .map_err(|e| unavailable(format!("could not create profile directory: {e}")))?;

        let pipe_error = |e: std::io::Error| unavailable(format!("could not create DevTools pipe: {e}"));
        let (to_browser, browser_reads) = pipe::pipe().map_err(pipe_error)?;
        let (browser_writes, from_browser) = pipe::pipe().map_err(pipe_error)?;
        let browser_reads = browser_reads.into_blocking_fd().map_err(pipe_error)?;
        let browser_writes = browser_writes.into_blocking_fd().map_err(pipe_error)?;
        let (read_fd, write_fd) = (browser_reads.as_raw_fd(), browser_writes.as_raw_fd());

        let mut command = Command::new(&self.binary);
        command
            .args(browser_args(profile.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // SAFETY: only async-signal-safe calls (fcntl, dup2, close) run in the child
        unsafe {
            command.pre_exec(move || attach_pipe_fds(read_fd, write_fd));
        }
        let process = command
            .spawn()
            .map_err(|e| unavailable(format!("could not start {}: {e}", self.binary.display())))?;
        drop(browser_reads);
        drop(browser_writes);

        let connection = DevToolsConnection::new(from_browser, to_browser);
        let version = connection
            .call(None, "Browser.getVersion", json!({}))
            .await
            .map_err(|e| unavailable(format!("browser did not answer: {e}")))?;
        log::info!(
            "🌐 Launched {} (pid {})",
            version["product"].as_str().unwrap_or(ENGINE_NAME),
            process.id().map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
        );

        Ok(Browser {
            connection: Arc::new(connection),
            _process: Some(process),
            _profile: Some(profile),
        })
    }

    #[cfg(not(unix))]
    async fn launch(&self) -> Result<Browser, RenderError> {
        Err(unavailable("the DevTools pipe needs a unix host".to_string()))
    }
}

fn browser_args(profile: &Path) -> Vec<String> {
    vec![
        "--headless=new".to_string(),
        "--remote-debugging-pipe".to_string(),
        "--disable-gpu".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-extensions".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        format!("--user-data-dir={}", profile.join("profile").display()),
        "about:blank".to_string(),
    ]
}

/// Chromium reads commands from fd 3 and writes replies to fd 4
#[cfg(unix)]
fn attach_pipe_fds(read_fd: i32, write_fd: i32) -> std::io::Result<()> {
    // Lift both ends above 4 first so neither dup2 overwrites the other
    unsafe {
        let read_high = libc::fcntl(read_fd, libc::F_DUPFD, 10);
        let write_high = libc::fcntl(write_fd, libc::F_DUPFD, 10);
        if read_high < 0 || write_high < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::dup2(read_high, 3) < 0 || libc::dup2(write_high, 4) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        libc::close(read_high);
        libc::close(write_high);
    }
    Ok(())
}

impl std::fmt::Debug for ChromiumEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumEngine")
            .field("binary", &self.binary)
            .field("launches", &self.launches())
            .finish()
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn is_healthy(&self) -> bool {
        self.binary.is_file()
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        let connection = self.browser.get_or_launch(|| self.launch()).await?;
        let session = ChromiumSession::open(connection).await?;
        Ok(Box::new(session))
    }
}

/// One isolated browser context holding one page
struct ChromiumSession {
    connection: Arc<DevToolsConnection>,
    context_id: String,
}

impl ChromiumSession {
    async fn open(connection: Arc<DevToolsConnection>) -> Result<Self, RenderError> {
        let context = connection
            .call(None, "Target.createBrowserContext", json!({ "disposeOnDetach": true }))
            .await
            .map_err(|e| unavailable(format!("could not create browser context: {e}")))?;
        let context_id = string_field(&context, "browserContextId")
            .ok_or_else(|| unavailable("browser context reply has no id".to_string()))?;
        Ok(Self { connection, context_id })
    }

    async fn print(&self, request: &RenderRequest) -> Result<Vec<u8>, String> {
        let target = self
            .connection
            .call(
                None,
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": self.context_id }),
            )
            .await?;
        let target_id = string_field(&target, "targetId").ok_or("createTarget reply has no targetId")?;

        let attached = self
            .connection
            .call(None, "Target.attachToTarget", json!({ "targetId": target_id, "flatten": true }))
            .await?;
        let page = string_field(&attached, "sessionId").ok_or("attachToTarget reply has no sessionId")?;
        let page = Some(page.as_str());

        let tree = self.connection.call(page, "Page.getFrameTree", json!({})).await?;
        let frame_id = tree["frameTree"]["frame"]["id"]
            .as_str()
            .ok_or("frame tree has no main frame")?
            .to_string();
        self.connection
            .call(
                page,
                "Page.setDocumentContent",
                json!({ "frameId": frame_id, "html": request.html }),
            )
            .await?;

        let (width_pt, height_pt) = request.page_size.dimensions_pt();
        let printed = self
            .connection
            .call(
                page,
                "Page.printToPDF",
                json!({
                    "printBackground": true,
                    "preferCSSPageSize": true,
                    "displayHeaderFooter": false,
                    "paperWidth": width_pt / 72.0,
                    "paperHeight": height_pt / 72.0,
                }),
            )
            .await?;
        let data = printed["data"].as_str().ok_or("printToPDF reply has no data")?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| format!("printToPDF data is not base64: {e}"))
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        log::debug!("Rendering section '{}' in browser context {}", request.title, self.context_id);
        let bytes = self.print(request).await.map_err(|reason| RenderError::Failed {
            section: request.title.clone(),
            reason,
        })?;
        if !bytes.starts_with(b"%PDF-") {
            return Err(RenderError::InvalidOutput {
                section: request.title.clone(),
                reason: "output does not start with a PDF header".to_string(),
            });
        }
        Ok(bytes)
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = self.connection.clone();
        let context_id = std::mem::take(&mut self.context_id);
        runtime.spawn(async move {
            if let Err(e) = connection
                .call(
                    None,
                    "Target.disposeBrowserContext",
                    json!({ "browserContextId": context_id }),
                )
                .await
            {
                log::debug!("Browser context {} not disposed: {}", context_id, e);
            }
        });
    }
}
