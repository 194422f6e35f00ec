//! Test-run orchestrator
//!
//! Takes a pending run to a terminal state:
//! - Classifies the run's cases into API and UI groups
//! - Drives API cases through an HTTP transport and UI cases through a
//!   Playwright-backed browser
//! - Aggregates results, writes Allure raw results and renders the report
//! - Supports cooperative cancellation through the execution registry
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RunDispatcher (semaphore: max_concurrent_runs)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordinator::execute(run_id, filter)                       │
//! │    ├── registry.register(run_id) -> Registration            │
//! │    ├── load environment + cases, partition by kind          │
//! │    ├── join!(                                               │
//! │    │     ApiCaseExecutor  -> HttpTransport (reqwest)        │
//! │    │     UiCaseExecutor   -> BrowserEngine (playwright)     │
//! │    │                          └── StepInterpreter           │
//! │    │   )                                                    │
//! │    ├── aggregate(api, ui, invalid) -> Verdict               │
//! │    ├── ReportGenerator -> ReportTool (allure)               │
//! │    └── store.save_run(terminal)                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordinator::stop(run_id) -> registry.cancel(run_id)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregate;
pub mod api;
pub mod artifacts;
pub mod browser;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod interpreter;
pub mod playwright;
pub mod registry;
pub mod report;
pub mod spec;
pub mod ui;

pub use aggregate::{aggregate, Verdict};
pub use api::ApiCaseExecutor;
pub use artifacts::{ArtifactConfig, ArtifactLayout};
pub use browser::{BrowserContext, BrowserEngine, BrowserSession, Page};
pub use config::OrchestratorConfig;
pub use coordinator::{Collaborators, Coordinator, StopOutcome};
pub use dispatcher::RunDispatcher;
pub use error::{OrchestratorError, OrchestratorResult};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use interpreter::{FailureKind, StepFailure, StepInterpreter};
pub use playwright::{Browser, PlaywrightConfig, PlaywrightEngine};
pub use registry::{EntryState, ExecutionRegistry, Registration, RunContext};
pub use report::{AllureCli, ReportConfig, ReportGenerator, ReportTool};
pub use spec::{ApiCaseSpec, StepAction};
pub use ui::UiCaseExecutor;
