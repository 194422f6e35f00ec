//! End-to-end coordinator behavior against fake collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use testrun_common::{
    CaseDetails, CaseStatus, Database, Environment, Error, Run, RunStatus, RunStore, TestCase,
};
use testrun_orchestrator::{
    ArtifactConfig, BrowserContext, BrowserEngine, BrowserSession, Collaborators, Coordinator,
    HttpRequest, HttpResponse, HttpTransport, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, Page, ReportTool, RunDispatcher, StopOutcome, TransportError,
};

// ============================================================================
// Fakes
// ============================================================================

/// Database wrapper that remembers every saved status
struct RecordingStore {
    db: Database,
    saved: Mutex<Vec<(i64, RunStatus)>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            db: Database::open_memory().unwrap(),
            saved: Mutex::new(Vec::new()),
        }
    }

    fn statuses(&self, run_id: i64) -> Vec<RunStatus> {
        self.saved
            .lock()
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl RunStore for RecordingStore {
    fn load_run(&self, id: i64) -> testrun_common::Result<Option<Run>> {
        self.db.load_run(id)
    }

    fn load_cases(&self, project_id: i64, ids: Option<&[i64]>) -> testrun_common::Result<Vec<TestCase>> {
        self.db.load_cases(project_id, ids)
    }

    fn load_environment(&self, id: i64) -> testrun_common::Result<Option<Environment>> {
        self.db.load_environment(id)
    }

    fn save_run(&self, run: &Run) -> testrun_common::Result<()> {
        self.saved.lock().push((run.id, run.status));
        self.db.save_run(run)
    }
}

/// Transport answering by path: `/status/<code>`, `/slow/<ms>`, `/hang`, `/json`
#[derive(Default)]
struct ScriptedTransport {
    paths: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request
            .url
            .splitn(4, '/')
            .nth(3)
            .map(|p| format!("/{}", p))
            .unwrap_or_default();
        self.paths.lock().push(path.clone());

        let json_response = |status: u16, body: Value| HttpResponse {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string(),
        };

        if let Some(code) = path.strip_prefix("/status/") {
            let code: u16 = code.parse().map_err(|_| TransportError("bad code".into()))?;
            return Ok(json_response(code, json!({"code": code})));
        }
        if let Some(ms) = path.strip_prefix("/slow/") {
            let ms: u64 = ms.parse().map_err(|_| TransportError("bad delay".into()))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(json_response(200, json!({"slept": ms})));
        }
        if path == "/hang" {
            futures::future::pending::<()>().await;
        }
        Err(TransportError(format!("connection failed: {}", request.url)))
    }
}

#[derive(Debug, Default)]
struct BrowserLog {
    launches: usize,
    sessions_closed: usize,
    contexts_opened: usize,
    contexts_closed: usize,
    pages_opened: usize,
    pages_closed: usize,
    calls: Vec<String>,
}

/// Behavior shared by every handle of the fake browser
#[derive(Default)]
struct BrowserScript {
    fail_launch: bool,
    missing_selectors: HashSet<String>,
    hang_selectors: HashSet<String>,
    panic_on_path: Option<String>,
}

#[derive(Clone, Default)]
struct FakeBrowser {
    log: Arc<Mutex<BrowserLog>>,
    script: Arc<BrowserScript>,
}

impl FakeBrowser {
    fn with_script(script: BrowserScript) -> Self {
        Self {
            log: Arc::default(),
            script: Arc::new(script),
        }
    }
}

#[async_trait]
impl BrowserEngine for FakeBrowser {
    async fn launch(&self) -> OrchestratorResult<Box<dyn BrowserSession>> {
        self.log.lock().launches += 1;
        if self.script.fail_launch {
            return Err(OrchestratorError::PlaywrightNotFound);
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl BrowserSession for FakeBrowser {
    async fn new_context(&self) -> OrchestratorResult<Box<dyn BrowserContext>> {
        self.log.lock().contexts_opened += 1;
        Ok(Box::new(FakeContext(self.clone())))
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.log.lock().sessions_closed += 1;
        Ok(())
    }
}

struct FakeContext(FakeBrowser);

#[async_trait]
impl BrowserContext for FakeContext {
    async fn new_page(&self) -> OrchestratorResult<Box<dyn Page>> {
        self.0.log.lock().pages_opened += 1;
        Ok(Box::new(FakePage {
            browser: self.0.clone(),
            url: Mutex::new("about:blank".into()),
        }))
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.0.log.lock().contexts_closed += 1;
        Ok(())
    }
}

struct FakePage {
    browser: FakeBrowser,
    url: Mutex<String>,
}

impl FakePage {
    fn record(&self, call: String) {
        self.browser.log.lock().calls.push(call);
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str) -> OrchestratorResult<()> {
        self.record(format!("goto {}", url));
        if let Some(path) = &self.browser.script.panic_on_path {
            if url.ends_with(path.as_str()) {
                panic!("driver crashed on {}", url);
            }
        }
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> OrchestratorResult<()> {
        self.record(format!("fill {} {}", selector, value));
        Ok(())
    }

    async fn click(&self, selector: &str) -> OrchestratorResult<()> {
        self.record(format!("click {}", selector));
        if self.browser.script.hang_selectors.contains(selector) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> OrchestratorResult<()> {
        self.record(format!("wait_for {}", selector));
        if self.browser.script.missing_selectors.contains(selector) {
            return Err(OrchestratorError::Browser(format!(
                "Timeout {}ms exceeded waiting for {}",
                timeout.as_millis(),
                selector
            )));
        }
        Ok(())
    }

    async fn text_content(&self, selector: &str) -> OrchestratorResult<String> {
        self.record(format!("text {}", selector));
        Ok("Welcome to the dashboard".into())
    }

    async fn url(&self) -> OrchestratorResult<String> {
        Ok(self.url.lock().clone())
    }

    async fn screenshot(&self, path: &Path) -> OrchestratorResult<()> {
        self.record("screenshot".into());
        tokio::fs::write(path, b"\x89PNG").await?;
        Ok(())
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.browser.log.lock().pages_closed += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeReportTool {
    fail: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ReportTool for FakeReportTool {
    async fn generate(&self, raw_dir: &Path, out_dir: &Path) -> OrchestratorResult<PathBuf> {
        self.calls.lock().push(raw_dir.to_path_buf());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(OrchestratorError::Report("allure exited with 1".into()));
        }
        Ok(out_dir.to_path_buf())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<RecordingStore>,
    transport: Arc<ScriptedTransport>,
    browser: FakeBrowser,
    report_tool: Arc<FakeReportTool>,
    coordinator: Arc<Coordinator>,
    environment_id: i64,
}

const PROJECT: i64 = 1;

impl Harness {
    fn new() -> Self {
        Self::build(FakeBrowser::default(), FakeReportTool::default(), |_| {})
    }

    fn build(
        browser: FakeBrowser,
        report_tool: FakeReportTool,
        tweak: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig {
            artifacts: ArtifactConfig {
                screenshots_dir: dir.path().join("screenshots"),
                results_dir: dir.path().join("allure-results"),
                reports_dir: dir.path().join("allure-reports"),
            },
            ..Default::default()
        };
        tweak(&mut config);

        let store = Arc::new(RecordingStore::new());
        let environment_id = store
            .db
            .insert_environment(PROJECT, "staging", "http://sut.local", &HashMap::new())
            .unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let report_tool = Arc::new(report_tool);

        let coordinator = Arc::new(Coordinator::new(
            &config,
            Collaborators {
                store: store.clone(),
                transport: transport.clone(),
                browser: Arc::new(browser.clone()),
                report_tool: report_tool.clone(),
            },
        ));

        Self {
            _dir: dir,
            store,
            transport,
            browser,
            report_tool,
            coordinator,
            environment_id,
        }
    }

    fn api_case(&self, name: &str, endpoint: &str, expected_status: u16) -> i64 {
        self.store
            .db
            .insert_case(
                PROJECT,
                name,
                "api",
                &json!({"method": "GET", "endpoint": endpoint, "expected_status": expected_status}),
                1,
            )
            .unwrap()
    }

    fn ui_case(&self, name: &str, steps: Value) -> i64 {
        self.store
            .db
            .insert_case(PROJECT, name, "ui", &json!({ "steps": steps }), 1)
            .unwrap()
    }

    fn run(&self) -> i64 {
        self.store.db.create_run(PROJECT, self.environment_id, 1).unwrap().id
    }

    fn browser_log(&self) -> parking_lot::MutexGuard<'_, BrowserLog> {
        self.browser.log.lock()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_two_api_cases_one_failing() {
    let h = Harness::new();
    h.api_case("health", "/status/200", 200);
    h.api_case("missing", "/status/404", 200);
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let result = run.result.as_ref().unwrap();
    assert_eq!(result.api_results.len(), 2);
    assert_eq!(result.api_results[0].status, CaseStatus::Passed);
    assert_eq!(result.api_results[1].status, CaseStatus::Failed);
    assert_eq!(result.summary.total, 2);
    assert_eq!(result.summary.failed, 1);
    assert!(result.ui_results.is_empty());

    // Nothing to drive in the browser
    assert_eq!(h.browser_log().launches, 0);

    let persisted = h.store.load_run(run_id).unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Failed);
    assert!(persisted.start_time.is_some());
    assert!(persisted.end_time.is_some());
    assert_eq!(persisted.result, run.result);
}

#[tokio::test]
async fn scenario_ui_case_selector_never_appears() {
    let browser = FakeBrowser::with_script(BrowserScript {
        missing_selectors: HashSet::from(["#title".to_string()]),
        ..Default::default()
    });
    let h = Harness::build(browser, FakeReportTool::default(), |_| {});
    h.ui_case(
        "title shows",
        json!([
            {"action": "navigate", "value": "/"},
            {"action": "wait_for_selector", "selector": "#title", "value": 2000}
        ]),
    );
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let case = &run.result.as_ref().unwrap().ui_results[0];
    assert_eq!(case.status, CaseStatus::Failed);
    let screenshot = case.screenshot().expect("failure screenshot");
    assert!(Path::new(screenshot).exists());
    assert!(screenshot.contains(&format!("run-{}", run_id)));
    match &case.details {
        CaseDetails::Ui { steps, failed_step, .. } => {
            assert_eq!(steps.len(), 1);
            assert_eq!(*failed_step, Some(1));
        }
        other => panic!("unexpected details: {:?}", other),
    }

    let log = h.browser_log();
    assert_eq!(log.calls[0], "goto http://sut.local/");
    assert_eq!(log.pages_opened, 1);
    assert_eq!(log.pages_closed, 1);
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn scenario_no_cases_selected() {
    let h = Harness::new();
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Passed);
    let result = run.result.unwrap();
    assert!(result.api_results.is_empty());
    assert!(result.ui_results.is_empty());
    assert_eq!(result.summary.total, 0);
    assert_eq!(h.browser_log().launches, 0);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn status_sequence_never_skips_running() {
    let h = Harness::new();
    h.api_case("ok", "/status/200", 200);
    let run_id = h.run();

    h.coordinator.execute(run_id, None).await.unwrap();
    assert_eq!(h.store.statuses(run_id), vec![RunStatus::Running, RunStatus::Passed]);

    // A terminal run cannot be executed again and is left untouched
    let err = h.coordinator.execute(run_id, None).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Store(Error::InvalidStateTransition { .. })
    ));
    assert_eq!(h.store.statuses(run_id).len(), 2);
}

#[tokio::test]
async fn passes_only_when_every_case_passes() {
    let h = Harness::new();
    h.api_case("a", "/status/200", 200);
    h.api_case("b", "/status/201", 201);
    h.ui_case(
        "dashboard",
        json!([
            {"action": "goto", "value": "/dashboard"},
            {"action": "fill", "selector": "#q", "value": 42},
            {"action": "click", "selector": "#go"},
            {"action": "assert_text", "selector": "h1", "expected": "dashboard"},
            {"action": "assert_url", "expected": "/dashboard"},
            {"action": "screenshot"}
        ]),
    );
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    let result = run.result.as_ref().unwrap();
    assert_eq!(result.summary.passed, 3);
    assert!(!result.cancelled);
    assert!(run.report_path.as_deref().unwrap().ends_with(&format!("run-{}", run_id)));
}

#[tokio::test]
async fn results_follow_input_order() {
    let h = Harness::new();
    let ids = vec![
        h.api_case("slowest", "/slow/60", 200),
        h.api_case("slow", "/slow/30", 200),
        h.api_case("fast", "/slow/1", 200),
    ];
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();
    let order: Vec<i64> = run.result.unwrap().api_results.iter().map(|r| r.test_case_id).collect();
    assert_eq!(order, ids);
    assert_eq!(*h.transport.paths.lock(), vec!["/slow/60", "/slow/30", "/slow/1"]);
}

#[tokio::test]
async fn case_filter_selects_subset() {
    let h = Harness::new();
    h.api_case("a", "/status/200", 200);
    let b = h.api_case("b", "/status/500", 200);
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, Some(&[b])).await.unwrap();
    let result = run.result.unwrap();
    assert_eq!(result.api_results.len(), 1);
    assert_eq!(result.api_results[0].test_case_id, b);
}

#[tokio::test]
async fn failing_ui_case_does_not_stop_the_next() {
    let browser = FakeBrowser::with_script(BrowserScript {
        missing_selectors: HashSet::from(["#gone".to_string()]),
        ..Default::default()
    });
    let h = Harness::build(browser, FakeReportTool::default(), |_| {});
    h.ui_case("broken", json!([{"action": "wait_for_selector", "selector": "#gone"}]));
    h.ui_case("invalid", json!([{"action": "hover", "selector": "#menu"}]));
    h.ui_case("fine", json!([{"action": "click", "selector": "#ok"}]));
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();
    let statuses: Vec<CaseStatus> = run.result.unwrap().ui_results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![CaseStatus::Failed, CaseStatus::Error, CaseStatus::Passed]);

    let log = h.browser_log();
    assert_eq!(log.launches, 1);
    assert_eq!(log.contexts_opened, 1);
    assert_eq!(log.contexts_closed, 1);
    // The invalid case never reaches the browser
    assert_eq!(log.pages_opened, 2);
    assert_eq!(log.pages_closed, 2);
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn stop_cancels_running_run() {
    let browser = FakeBrowser::with_script(BrowserScript {
        hang_selectors: HashSet::from(["#spinner".to_string()]),
        ..Default::default()
    });
    let h = Harness::build(browser, FakeReportTool::default(), |_| {});
    h.api_case("health", "/status/200", 200);
    h.api_case("stuck", "/hang", 200);
    h.ui_case("stuck", json!([{"action": "click", "selector": "#spinner"}]));
    h.ui_case("never", json!([{"action": "navigate"}]));
    let run_id = h.run();

    let coordinator = h.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.execute(run_id, None).await });

    {
        let browser = h.browser.clone();
        let transport = h.transport.clone();
        eventually(move || {
            browser.log.lock().calls.iter().any(|c| c == "click #spinner")
                && transport.paths.lock().iter().any(|p| p == "/hang")
        })
        .await;
    }
    assert_eq!(h.coordinator.stop(run_id).unwrap(), StopOutcome::Signalled);

    let run = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run honors cancellation")
        .unwrap()
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let result = run.result.as_ref().unwrap();
    assert!(result.cancelled);
    assert_eq!(result.api_results.len(), 2);
    assert_eq!(result.api_results[0].status, CaseStatus::Passed);
    assert!(result.api_results[1].cancelled);
    assert_eq!(result.ui_results.len(), 1);
    assert_eq!(result.ui_results[0].error.as_deref(), Some("cancelled"));
    assert!(!h.coordinator.registry().is_registered(run_id));
    assert_eq!(h.browser_log().pages_closed, 1);
    assert_eq!(h.browser_log().sessions_closed, 1);

    // Reports are still produced for what ran
    assert_eq!(h.report_tool.calls.lock().len(), 1);
    assert!(run.report_path.is_some());

    assert_eq!(
        h.coordinator.stop(run_id).unwrap(),
        StopOutcome::NotRunning { status: RunStatus::Failed }
    );
}

#[tokio::test]
async fn stop_during_report_still_cancels_run() {
    let h = Harness::build(
        FakeBrowser::default(),
        FakeReportTool {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        },
        |_| {},
    );
    h.api_case("health", "/status/200", 200);
    let run_id = h.run();

    let coordinator = h.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.execute(run_id, None).await });

    {
        let report_tool = h.report_tool.clone();
        eventually(move || !report_tool.calls.lock().is_empty()).await;
    }
    assert_eq!(h.coordinator.stop(run_id).unwrap(), StopOutcome::Signalled);

    let run = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("report generation honors cancellation")
        .unwrap()
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let result = run.result.as_ref().unwrap();
    assert!(result.cancelled);
    assert_eq!(result.api_results[0].status, CaseStatus::Passed);
    assert!(run.report_path.is_none());
    assert!(!h.coordinator.registry().is_registered(run_id));
    assert_eq!(h.store.statuses(run_id), vec![RunStatus::Running, RunStatus::Failed]);
}

#[tokio::test]
async fn stop_ignores_pending_run() {
    let h = Harness::new();
    let run_id = h.run();
    assert_eq!(
        h.coordinator.stop(run_id).unwrap(),
        StopOutcome::NotRunning { status: RunStatus::Pending }
    );
    assert!(matches!(
        h.coordinator.stop(999),
        Err(OrchestratorError::Store(Error::NotFound { .. }))
    ));
}

#[tokio::test]
async fn missing_environment_fails_run() {
    let h = Harness::new();
    h.api_case("a", "/status/200", 200);
    let run_id = h.store.db.create_run(PROJECT, 4242, 1).unwrap().id;

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.result.as_ref().unwrap().error.as_deref().unwrap();
    assert!(error.contains("environment"), "{}", error);
    assert!(run.report_path.is_none());
    assert!(h.coordinator.registry().is_empty());
    assert_eq!(h.store.statuses(run_id), vec![RunStatus::Running, RunStatus::Failed]);
}

#[tokio::test]
async fn panic_in_browser_fails_run_and_releases_browser() {
    let browser = FakeBrowser::with_script(BrowserScript {
        panic_on_path: Some("/explode".into()),
        ..Default::default()
    });
    let h = Harness::build(browser, FakeReportTool::default(), |_| {});
    h.ui_case("boom", json!([{"action": "navigate", "value": "/explode"}]));
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.result.as_ref().unwrap().error.as_deref().unwrap();
    assert!(error.contains("driver crashed"), "{}", error);
    assert!(h.coordinator.registry().is_empty());

    let log = h.browser_log();
    assert_eq!(log.contexts_closed, 1);
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn browser_launch_failure_errors_ui_cases() {
    let browser = FakeBrowser::with_script(BrowserScript {
        fail_launch: true,
        ..Default::default()
    });
    let h = Harness::build(browser, FakeReportTool::default(), |_| {});
    h.api_case("a", "/status/200", 200);
    h.ui_case("one", json!([{"action": "navigate"}]));
    h.ui_case("two", json!([{"action": "navigate"}]));
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let result = run.result.unwrap();
    assert_eq!(result.api_results[0].status, CaseStatus::Passed);
    assert_eq!(result.ui_results.len(), 2);
    for case in &result.ui_results {
        assert_eq!(case.status, CaseStatus::Error);
        assert!(case.error.as_deref().unwrap().contains("Playwright not found"));
    }
}

#[tokio::test]
async fn unknown_case_kind_is_reported() {
    let h = Harness::new();
    h.api_case("a", "/status/200", 200);
    h.store
        .db
        .insert_case(PROJECT, "load", "perf", &json!({}), 1)
        .unwrap();
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let result = run.result.unwrap();
    assert_eq!(result.invalid_results.len(), 1);
    assert_eq!(result.summary.total, 2);
    assert_eq!(result.summary.error, 1);
}

#[tokio::test]
async fn report_failure_keeps_verdict() {
    let h = Harness::build(
        FakeBrowser::default(),
        FakeReportTool {
            fail: true,
            ..Default::default()
        },
        |_| {},
    );
    h.api_case("a", "/status/200", 200);
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert!(run.report_path.is_none());
}

#[tokio::test]
async fn case_timeout_is_case_level_error() {
    let h = Harness::build(FakeBrowser::default(), FakeReportTool::default(), |config| {
        config.case_timeout_secs = 0;
    });
    h.api_case("stuck", "/hang", 200);
    h.api_case("fine", "/status/200", 200);
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();
    let result = run.result.unwrap();
    assert_eq!(result.api_results.len(), 2);
    assert_eq!(result.api_results[0].status, CaseStatus::Error);
    assert!(result.api_results[0].error.as_deref().unwrap().contains("timed out"));
    assert!(!result.cancelled);
}

#[tokio::test]
async fn ui_case_timeout_fails_case_and_closes_page() {
    let browser = FakeBrowser::with_script(BrowserScript {
        hang_selectors: HashSet::from(["#spinner".to_string()]),
        ..Default::default()
    });
    let h = Harness::build(browser, FakeReportTool::default(), |config| {
        config.case_timeout_secs = 0;
    });
    h.ui_case(
        "stuck",
        json!([
            {"action": "navigate", "value": "/"},
            {"action": "click", "selector": "#spinner"}
        ]),
    );
    h.ui_case("fine", json!([{"action": "navigate", "value": "/ok"}]));
    let run_id = h.run();

    let run = h.coordinator.execute(run_id, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let result = run.result.as_ref().unwrap();
    assert!(!result.cancelled);
    let case = &result.ui_results[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert!(case.error.as_deref().unwrap().contains("timed out"));
    assert!(Path::new(case.screenshot().expect("failure screenshot")).exists());
    match &case.details {
        CaseDetails::Ui { steps, failed_step, .. } => {
            assert_eq!(steps.len(), 1);
            assert_eq!(*failed_step, Some(1));
        }
        other => panic!("unexpected details: {:?}", other),
    }
    assert_eq!(result.ui_results[1].status, CaseStatus::Passed);

    let log = h.browser_log();
    assert_eq!(log.pages_opened, 2);
    assert_eq!(log.pages_closed, 2);
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn missing_run_is_rejected() {
    let h = Harness::new();
    assert!(matches!(
        h.coordinator.execute(77, None).await,
        Err(OrchestratorError::Store(Error::NotFound { .. }))
    ));
}

#[tokio::test]
async fn dispatcher_runs_each_run_once() {
    let h = Harness::new();
    h.api_case("a", "/slow/20", 200);
    let first = h.run();
    let second = h.run();

    let dispatcher = RunDispatcher::new(h.coordinator.clone(), 1);
    let a = dispatcher.dispatch(first, None).unwrap();
    assert!(dispatcher.dispatch(first, None).is_none());
    let b = dispatcher.dispatch(second, None).unwrap();
    assert_eq!(dispatcher.in_flight(), 2);

    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(dispatcher.in_flight(), 0);
    for id in [first, second] {
        assert_eq!(h.store.load_run(id).unwrap().unwrap().status, RunStatus::Passed);
        assert_eq!(h.store.statuses(id), vec![RunStatus::Running, RunStatus::Passed]);
    }
}
