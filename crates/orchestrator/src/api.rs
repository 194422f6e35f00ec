//! API case executor
//!
//! Cases run sequentially against one environment. Each case issues exactly
//! one request, raced against the per-case timeout and the run's
//! cancellation token.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use testrun_common::{CaseDetails, CaseResult, CaseStatus, Environment, TestCase};

use crate::config::OrchestratorConfig;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::registry::RunContext;
use crate::spec::ApiCaseSpec;

pub struct ApiCaseExecutor {
    transport: Arc<dyn HttpTransport>,
    case_timeout: Duration,
    request_timeout: Duration,
    max_body_bytes: usize,
    default_base_url: String,
}

impl ApiCaseExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &OrchestratorConfig) -> Self {
        Self {
            transport,
            case_timeout: config.case_timeout(),
            request_timeout: config.request_timeout(),
            max_body_bytes: config.max_captured_body_bytes,
            default_base_url: config.default_api_base_url.clone(),
        }
    }

    /// Run `cases` in order against `environment`.
    ///
    /// Returns one result per dispatched case, in input order. A stop request
    /// ends dispatch after the current case, which is recorded as cancelled.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        cases: &[TestCase],
        environment: &Environment,
    ) -> Vec<CaseResult> {
        let base_url = environment.base_url_or(&self.default_base_url);
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            if ctx.is_cancelled() {
                info!("Run {}: cancelled before API case {}", ctx.run_id, case.id);
                results.push(CaseResult::new(case, CaseStatus::Error, empty_details()).cancelled());
                break;
            }

            let started = Instant::now();
            let result = self
                .run_case(ctx, case, base_url)
                .await
                .with_duration_ms(started.elapsed().as_millis() as u64);
            info!(
                "Run {}: API case {} ({}) {}",
                ctx.run_id, case.id, case.name, result.status
            );

            let stop = result.cancelled;
            results.push(result);
            if stop {
                break;
            }
        }

        results
    }

    async fn run_case(&self, ctx: &RunContext, case: &TestCase, base_url: &str) -> CaseResult {
        let spec = match ApiCaseSpec::from_test_data(&case.test_data) {
            Ok(spec) => spec,
            Err(e) => {
                return CaseResult::new(case, CaseStatus::Error, empty_details())
                    .with_error(format!("validation error: {}", e));
            }
        };

        let url = spec.url(base_url);
        let request = HttpRequest {
            method: spec.method,
            url: url.clone(),
            headers: spec.headers.clone(),
            query: spec.query.clone(),
            json_body: spec.json_body.clone(),
            timeout: self.request_timeout,
        };
        let details = |response: Option<&HttpResponse>| CaseDetails::Api {
            method: Some(spec.method.to_string()),
            url: Some(url.clone()),
            expected_status: Some(spec.expected_status),
            response_status: response.map(|r| r.status),
            response_body: response.map(|r| truncate_body(&r.body, self.max_body_bytes)),
        };

        debug!("Run {}: case {} -> {} {}", ctx.run_id, case.id, spec.method, url);

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return CaseResult::new(case, CaseStatus::Error, details(None)).cancelled();
            }
            outcome = tokio::time::timeout(self.case_timeout, self.transport.send(&request)) => outcome,
        };

        match outcome {
            Err(_) => CaseResult::new(case, CaseStatus::Error, details(None)).with_error(format!(
                "case timed out after {}s",
                self.case_timeout.as_secs()
            )),
            Ok(Err(e)) => CaseResult::new(case, CaseStatus::Error, details(None)).with_error(e.to_string()),
            Ok(Ok(response)) => match check_response(&spec, &response) {
                Ok(()) => CaseResult::new(case, CaseStatus::Passed, details(Some(&response))),
                Err(mismatch) => {
                    CaseResult::new(case, CaseStatus::Failed, details(Some(&response))).with_error(mismatch)
                }
            },
        }
    }
}

fn empty_details() -> CaseDetails {
    CaseDetails::Api {
        method: None,
        url: None,
        expected_status: None,
        response_status: None,
        response_body: None,
    }
}

/// Compare a response with what the case expects
fn check_response(spec: &ApiCaseSpec, response: &HttpResponse) -> Result<(), String> {
    if response.status != spec.expected_status {
        return Err(format!(
            "expected status {}, got {}",
            spec.expected_status, response.status
        ));
    }

    let Some(expected) = &spec.expected_response else {
        return Ok(());
    };

    // Literal comparison only for a textual expectation against a non-JSON body
    if let (false, Value::String(text)) = (response.is_json(), expected) {
        return if response.body == *text {
            Ok(())
        } else {
            Err(format!("expected body '{}', got '{}'", text, response.body))
        };
    }

    let actual: Value = serde_json::from_str(&response.body)
        .map_err(|e| format!("response body is not valid JSON: {}", e))?;
    if actual == *expected {
        Ok(())
    } else {
        Err(format!("expected body {}, got {}", expected, actual))
    }
}

fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [{} bytes truncated]", &body[..end], body.len() - end)
}
