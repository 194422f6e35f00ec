//! Playwright browser automation
//!
//! Each session runs one long-lived `node` process executing a fixed driver
//! script. Commands and replies travel as line-delimited JSON over the
//! process's stdin/stdout, and every command carries an id so that replies
//! to abandoned commands can be told apart and skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command as TokioCommand};
use tracing::{debug, info, warn};

use crate::browser::{BrowserContext, BrowserEngine, BrowserSession, Page};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Driver executed by node; speaks the protocol described in the module docs
const DRIVER_SCRIPT: &str = r#"
const readline = require('readline');
const moduleName = process.env.PLAYWRIGHT_MODULE || 'playwright';
let pw;
try {
  pw = require(require.resolve(moduleName, { paths: [process.cwd()] }));
} catch (e) {
  process.stdout.write(JSON.stringify({ id: 0, ok: false, fatal: true, error: 'Cannot find module ' + moduleName }) + '\n');
  process.exit(3);
}
const browserType = pw[process.env.PLAYWRIGHT_BROWSER || 'chromium'];
const headless = process.env.PLAYWRIGHT_HEADLESS !== '0';
const handles = new Map();
let nextHandle = 1;
let browser = null;

function put(obj) { const h = nextHandle++; handles.set(h, obj); return h; }
function get(h) { const o = handles.get(h); if (!o) throw new Error('unknown handle ' + h); return o; }

async function dispatch(cmd) {
  switch (cmd.op) {
    case 'launch': browser = await browserType.launch({ headless }); return null;
    case 'newContext': {
      const ctx = await browser.newContext({ viewport: cmd.viewport });
      ctx.setDefaultTimeout(cmd.timeout);
      return put(ctx);
    }
    case 'newPage': return put(await get(cmd.context).newPage());
    case 'goto': await get(cmd.page).goto(cmd.url); return null;
    case 'fill': await get(cmd.page).fill(cmd.selector, cmd.value); return null;
    case 'click': await get(cmd.page).click(cmd.selector); return null;
    case 'waitForSelector': await get(cmd.page).waitForSelector(cmd.selector, { timeout: cmd.timeout }); return null;
    case 'textContent': {
      const el = await get(cmd.page).waitForSelector(cmd.selector);
      return (await el.textContent()) || '';
    }
    case 'url': return get(cmd.page).url();
    case 'screenshot': await get(cmd.page).screenshot({ path: cmd.path }); return null;
    case 'close': await get(cmd.handle).close(); handles.delete(cmd.handle); return null;
    case 'closeBrowser': if (browser) { await browser.close(); browser = null; } return null;
    case 'exit': return null;
    default: throw new Error('unknown op ' + cmd.op);
  }
}

const rl = readline.createInterface({ input: process.stdin });
rl.on('line', async (line) => {
  let cmd;
  try { cmd = JSON.parse(line); } catch (e) { return; }
  let reply;
  try {
    const result = await dispatch(cmd);
    reply = { id: cmd.id, ok: true, result: result === undefined ? null : result };
  } catch (e) {
    reply = { id: cmd.id, ok: false, error: String((e && e.message) || e) };
  }
  process.stdout.write(JSON.stringify(reply) + '\n');
  if (cmd.op === 'exit') process.exit(0);
});
rl.on('close', async () => {
  if (browser) await browser.close();
  process.exit(0);
});
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    /// Node executable
    pub node_binary: PathBuf,

    /// Module name or path resolved from `working_dir`
    pub driver_module: String,

    /// Directory node runs in; must be able to resolve `driver_module`
    pub working_dir: Option<PathBuf>,

    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Default timeout for page actions, in milliseconds
    pub default_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            driver_module: "playwright".to_string(),
            working_dir: None,
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            default_timeout_ms: 30000,
        }
    }
}

// ============================================================================
// Driver connection
// ============================================================================

#[derive(Debug, Deserialize)]
struct DriverReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    fatal: bool,
}

type DriverReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type DriverWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct DriverIo {
    writer: DriverWriter,
    reader: DriverReader,
}

/// Request/reply channel to one driver process
struct DriverConnection {
    io: tokio::sync::Mutex<DriverIo>,
    next_id: AtomicU64,
    child: parking_lot::Mutex<Option<Child>>,
}

impl DriverConnection {
    fn new(
        writer: DriverWriter,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        child: Option<Child>,
    ) -> Self {
        Self {
            io: tokio::sync::Mutex::new(DriverIo {
                writer,
                reader: BufReader::new(reader).lines(),
            }),
            next_id: AtomicU64::new(1),
            child: parking_lot::Mutex::new(child),
        }
    }

    /// Send one command and wait for its reply
    async fn call(&self, op: &str, mut args: Value) -> OrchestratorResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !args.is_object() {
            args = json!({});
        }
        args["id"] = json!(id);
        args["op"] = json!(op);

        let mut line = serde_json::to_string(&args)?;
        line.push('\n');

        let mut io = self.io.lock().await;
        io.writer.write_all(line.as_bytes()).await?;
        io.writer.flush().await?;

        loop {
            let raw = io
                .reader
                .next_line()
                .await?
                .ok_or_else(|| OrchestratorError::DriverExited(format!("no reply to '{}'", op)))?;

            let reply: DriverReply = match serde_json::from_str(&raw) {
                Ok(reply) => reply,
                Err(_) => {
                    debug!("[driver] {}", raw);
                    continue;
                }
            };

            if reply.fatal {
                let message = reply.error.unwrap_or_default();
                return Err(if message.contains("Cannot find module") {
                    OrchestratorError::PlaywrightNotFound
                } else {
                    OrchestratorError::DriverExited(message)
                });
            }

            if reply.id != id {
                // Reply to a command whose caller was cancelled
                debug!("Discarding stale driver reply {}", reply.id);
                continue;
            }

            return if reply.ok {
                Ok(reply.result.unwrap_or(Value::Null))
            } else {
                Err(OrchestratorError::Browser(
                    reply.error.unwrap_or_else(|| format!("'{}' failed", op)),
                ))
            };
        }
    }

    async fn handle(&self, op: &str, args: Value) -> OrchestratorResult<u64> {
        let result = self.call(op, args).await?;
        result
            .as_u64()
            .ok_or_else(|| OrchestratorError::Browser(format!("'{}' returned no handle", op)))
    }

    /// Wait for the driver process to exit, killing it if it lingers
    async fn reap(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!("Driver exited with {}", status),
                Ok(Err(e)) => warn!("Failed to wait for driver: {}", e),
                Err(_) => {
                    warn!("Driver did not exit; killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

// ============================================================================
// Engine / session / context / page
// ============================================================================

/// [`BrowserEngine`] backed by Playwright
pub struct PlaywrightEngine {
    config: PlaywrightConfig,
}

impl PlaywrightEngine {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    fn command(&self, script: &Path) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.config.node_binary);
        cmd.arg(script)
            .env("PLAYWRIGHT_MODULE", &self.config.driver_module)
            .env("PLAYWRIGHT_BROWSER", self.config.browser.as_str())
            .env("PLAYWRIGHT_HEADLESS", if self.config.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl BrowserEngine for PlaywrightEngine {
    async fn launch(&self) -> OrchestratorResult<Box<dyn BrowserSession>> {
        let script_dir = tempfile::tempdir()?;
        let script = script_dir.path().join("driver.js");
        tokio::fs::write(&script, DRIVER_SCRIPT).await?;

        let mut child = self.command(&script).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OrchestratorError::PlaywrightNotFound
            } else {
                OrchestratorError::Io(e)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::DriverExited("stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::DriverExited("stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[driver stderr] {}", line);
                }
            });
        }

        let conn = Arc::new(DriverConnection::new(
            Box::new(stdin),
            Box::new(stdout),
            Some(child),
        ));

        // Dropping `conn` on failure kills the process
        conn.call("launch", json!({})).await?;
        info!("Launched {} browser", self.config.browser.as_str());

        Ok(Box::new(PlaywrightSession {
            conn,
            config: self.config.clone(),
            closed: AtomicBool::new(false),
            _script_dir: script_dir,
        }))
    }
}

struct PlaywrightSession {
    conn: Arc<DriverConnection>,
    config: PlaywrightConfig,
    closed: AtomicBool,
    _script_dir: tempfile::TempDir,
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    async fn new_context(&self) -> OrchestratorResult<Box<dyn BrowserContext>> {
        let handle = self
            .conn
            .handle(
                "newContext",
                json!({
                    "viewport": {
                        "width": self.config.viewport_width,
                        "height": self.config.viewport_height,
                    },
                    "timeout": self.config.default_timeout_ms,
                }),
            )
            .await?;
        Ok(Box::new(PlaywrightContext {
            conn: self.conn.clone(),
            handle,
        }))
    }

    async fn close(&self) -> OrchestratorResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.conn.call("closeBrowser", json!({})).await;
        if let Err(e) = self.conn.call("exit", json!({})).await {
            debug!("Driver exit: {}", e);
        }
        self.conn.reap().await;
        result.map(|_| ())
    }
}

struct PlaywrightContext {
    conn: Arc<DriverConnection>,
    handle: u64,
}

#[async_trait]
impl BrowserContext for PlaywrightContext {
    async fn new_page(&self) -> OrchestratorResult<Box<dyn Page>> {
        let handle = self
            .conn
            .handle("newPage", json!({ "context": self.handle }))
            .await?;
        Ok(Box::new(PlaywrightPage {
            conn: self.conn.clone(),
            handle,
        }))
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.conn.call("close", json!({ "handle": self.handle })).await?;
        Ok(())
    }
}

struct PlaywrightPage {
    conn: Arc<DriverConnection>,
    handle: u64,
}

#[async_trait]
impl Page for PlaywrightPage {
    async fn goto(&self, url: &str) -> OrchestratorResult<()> {
        self.conn
            .call("goto", json!({ "page": self.handle, "url": url }))
            .await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> OrchestratorResult<()> {
        self.conn
            .call(
                "fill",
                json!({ "page": self.handle, "selector": selector, "value": value }),
            )
            .await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> OrchestratorResult<()> {
        self.conn
            .call("click", json!({ "page": self.handle, "selector": selector }))
            .await?;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> OrchestratorResult<()> {
        self.conn
            .call(
                "waitForSelector",
                json!({
                    "page": self.handle,
                    "selector": selector,
                    "timeout": timeout.as_millis() as u64,
                }),
            )
            .await?;
        Ok(())
    }

    async fn text_content(&self, selector: &str) -> OrchestratorResult<String> {
        let text = self
            .conn
            .call("textContent", json!({ "page": self.handle, "selector": selector }))
            .await?;
        Ok(text.as_str().unwrap_or_default().to_string())
    }

    async fn url(&self) -> OrchestratorResult<String> {
        let url = self.conn.call("url", json!({ "page": self.handle })).await?;
        Ok(url.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self, path: &Path) -> OrchestratorResult<()> {
        // The driver may run in another working directory
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        self.conn
            .call(
                "screenshot",
                json!({ "page": self.handle, "path": path.to_string_lossy() }),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.conn.call("close", json!({ "handle": self.handle })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Connection wired to an in-process fake driver
    fn fake_driver<F>(respond: F) -> DriverConnection
    where
        F: Fn(Value) -> Vec<String> + Send + 'static,
    {
        let (client_out, driver_in) = duplex(4096);
        let (mut driver_out, client_in) = duplex(4096);

        tokio::spawn(async move {
            let mut lines = BufReader::new(driver_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let cmd: Value = serde_json::from_str(&line).unwrap();
                for reply in respond(cmd) {
                    driver_out.write_all(reply.as_bytes()).await.unwrap();
                    driver_out.write_all(b"\n").await.unwrap();
                }
            }
        });

        DriverConnection::new(Box::new(client_out), Box::new(client_in), None)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let conn = fake_driver(|cmd| {
            assert_eq!(cmd["op"], "url");
            assert_eq!(cmd["page"], 4);
            vec![json!({"id": cmd["id"], "ok": true, "result": "http://app/home"}).to_string()]
        });

        let result = conn.call("url", json!({"page": 4})).await.unwrap();
        assert_eq!(result, json!("http://app/home"));
    }

    #[tokio::test]
    async fn test_stale_and_noise_lines_skipped() {
        let conn = fake_driver(|cmd| {
            vec![
                "driver warming up".to_string(),
                json!({"id": 999, "ok": true, "result": "stale"}).to_string(),
                json!({"id": cmd["id"], "ok": true, "result": 7}).to_string(),
            ]
        });

        assert_eq!(conn.handle("newPage", json!({"context": 1})).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_error_reply_is_browser_error() {
        let conn = fake_driver(|cmd| {
            vec![json!({"id": cmd["id"], "ok": false, "error": "Timeout 2000ms exceeded"}).to_string()]
        });

        let err = conn
            .call("waitForSelector", json!({"page": 1, "selector": "#title"}))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Browser(msg) => assert!(msg.contains("Timeout 2000ms")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_module_is_not_found() {
        let conn = fake_driver(|_| {
            vec![json!({"id": 0, "ok": false, "fatal": true, "error": "Cannot find module playwright"}).to_string()]
        });

        assert!(matches!(
            conn.call("launch", json!({})).await,
            Err(OrchestratorError::PlaywrightNotFound)
        ));
    }

    #[tokio::test]
    async fn test_missing_node_binary() {
        let engine = PlaywrightEngine::new(PlaywrightConfig {
            node_binary: PathBuf::from("/nonexistent/node-binary"),
            ..Default::default()
        });

        assert!(matches!(
            engine.launch().await,
            Err(OrchestratorError::PlaywrightNotFound)
        ));
    }
}
