//! Browser automation contract
//!
//! A session owns the browser process, a context isolates cookies and
//! storage, and a page is the unit a single UI case drives. The UI executor
//! is the only caller that opens or closes sessions and contexts.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::OrchestratorResult;

/// Launches browser sessions
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self) -> OrchestratorResult<Box<dyn BrowserSession>>;
}

/// A running browser
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_context(&self) -> OrchestratorResult<Box<dyn BrowserContext>>;

    /// Shut the browser down. Called exactly once by the owner.
    async fn close(&self) -> OrchestratorResult<()>;
}

/// Isolated cookie/storage scope within a session
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> OrchestratorResult<Box<dyn Page>>;

    async fn close(&self) -> OrchestratorResult<()>;
}

/// One tab
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> OrchestratorResult<()>;

    async fn fill(&self, selector: &str, value: &str) -> OrchestratorResult<()>;

    async fn click(&self, selector: &str) -> OrchestratorResult<()>;

    /// Block until `selector` matches an element or `timeout` elapses
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> OrchestratorResult<()>;

    /// Wait for `selector`, then read its text content
    async fn text_content(&self, selector: &str) -> OrchestratorResult<String>;

    async fn url(&self) -> OrchestratorResult<String>;

    async fn screenshot(&self, path: &Path) -> OrchestratorResult<()>;

    async fn close(&self) -> OrchestratorResult<()>;
}
