//! Case parameter schemas
//!
//! API cases carry `{method, endpoint, headers?, params?, json?,
//! expected_status?, expected_response?}`; UI cases carry `{steps: [...]}`
//! where each step is `{action, selector?, value?, expected?}`. Both are
//! parsed and validated here before any external call is made.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::http::HttpMethod;

/// Status expected when an API case does not declare one
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Pause used by `wait` when no value is given
pub const DEFAULT_WAIT_MS: u64 = 5000;

/// Timeout used by `wait_for_selector` when no value is given
pub const DEFAULT_SELECTOR_TIMEOUT_MS: u64 = 30000;

// ============================================================================
// API cases
// ============================================================================

/// API case parameters as stored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiCaseParams {
    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, Value>,

    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    #[serde(default, alias = "json_body", alias = "jsonBody")]
    pub json: Option<Value>,

    #[serde(default, alias = "expectedStatus")]
    pub expected_status: Option<u16>,

    #[serde(default, alias = "expectedResponse")]
    pub expected_response: Option<Value>,
}

/// A validated API case, ready to be issued
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCaseSpec {
    pub method: HttpMethod,
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<Value>,
    pub expected_status: u16,
    pub expected_response: Option<Value>,
}

impl ApiCaseSpec {
    /// Parse and validate the `test_data` of an API case
    pub fn from_test_data(test_data: &Value) -> Result<Self, String> {
        let params: ApiCaseParams = if test_data.is_null() {
            ApiCaseParams::default()
        } else {
            ApiCaseParams::deserialize(test_data)
                .map_err(|e| format!("malformed API case parameters: {}", e))?
        };

        let method = params
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| "missing HTTP method".to_string())?;
        let method: HttpMethod = method.parse()?;

        let endpoint = params
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| "missing endpoint".to_string())?;
        let endpoint = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        };

        Ok(Self {
            method,
            endpoint,
            headers: stringify_map(params.headers, "header")?,
            query: stringify_map(params.params, "query parameter")?,
            json_body: params.json,
            expected_status: params.expected_status.unwrap_or(DEFAULT_EXPECTED_STATUS),
            expected_response: params.expected_response,
        })
    }

    /// Target URL for this case against `base_url`
    pub fn url(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.endpoint)
    }
}

fn stringify_map(map: BTreeMap<String, Value>, what: &str) -> Result<Vec<(String, String)>, String> {
    map.into_iter()
        .map(|(key, value)| match scalar_to_string(&value) {
            Some(s) => Ok((key, s)),
            None => Err(format!("{} '{}' must be a scalar value", what, key)),
        })
        .collect()
}

/// Render a JSON scalar the way it would appear in a form field or URL
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// UI cases
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
struct UiCaseParams {
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// A step as stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub expected: Option<Value>,
}

/// A validated step of the UI action language
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Load `base_url + path`
    Navigate { path: String },
    Fill { selector: String, value: String },
    Click { selector: String },
    /// Unconditional pause
    Wait { ms: u64 },
    WaitForSelector { selector: String, timeout_ms: u64 },
    AssertText { selector: String, expected: String },
    AssertUrl { expected: String },
    Screenshot,
}

impl StepAction {
    /// Short label used in traces and artifact names
    pub fn name(&self) -> String {
        match self {
            StepAction::Navigate { path } => format!("navigate:{}", path),
            StepAction::Fill { selector, .. } => format!("fill:{}", selector),
            StepAction::Click { selector } => format!("click:{}", selector),
            StepAction::Wait { ms } => format!("wait:{}ms", ms),
            StepAction::WaitForSelector { selector, .. } => format!("wait_for_selector:{}", selector),
            StepAction::AssertText { selector, .. } => format!("assert_text:{}", selector),
            StepAction::AssertUrl { expected } => format!("assert_url:{}", expected),
            StepAction::Screenshot => "screenshot".to_string(),
        }
    }

    /// Validate one stored step
    pub fn parse(step: &RawStep) -> Result<Self, String> {
        let action = step
            .action
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| "missing action".to_string())?;

        let selector = || {
            step.selector
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| format!("'{}' requires a selector", action))
        };
        let value = || -> Result<Option<String>, String> {
            match &step.value {
                None | Some(Value::Null) => Ok(None),
                Some(v) => scalar_to_string(v)
                    .map(Some)
                    .ok_or_else(|| format!("'{}' value must be a scalar", action)),
            }
        };
        let millis = |default: u64| -> Result<u64, String> {
            match value()? {
                None => Ok(default),
                Some(raw) if raw.trim().is_empty() => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("'{}' value must be milliseconds, got '{}'", action, raw)),
            }
        };
        let expected = || {
            step.expected
                .as_ref()
                .and_then(scalar_to_string)
                .ok_or_else(|| format!("'{}' requires an expected value", action))
        };

        match action {
            "navigate" | "goto" => Ok(StepAction::Navigate {
                path: value()?
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "/".to_string()),
            }),
            "fill" => Ok(StepAction::Fill {
                selector: selector()?,
                value: value()?.ok_or_else(|| "'fill' requires a value".to_string())?,
            }),
            "click" => Ok(StepAction::Click { selector: selector()? }),
            "wait" => Ok(StepAction::Wait {
                ms: millis(DEFAULT_WAIT_MS)?,
            }),
            "wait_for_selector" => Ok(StepAction::WaitForSelector {
                selector: selector()?,
                timeout_ms: millis(DEFAULT_SELECTOR_TIMEOUT_MS)?,
            }),
            "assert_text" => Ok(StepAction::AssertText {
                selector: selector()?,
                expected: expected()?,
            }),
            "assert_url" => Ok(StepAction::AssertUrl { expected: expected()? }),
            "screenshot" => Ok(StepAction::Screenshot),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// A step list that failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepValidationError {
    /// Offending step, `None` when the parameter map itself is malformed
    pub index: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for StepValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "step {}: {}", index, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Parse and validate the `test_data` of a UI case into its ordered steps
pub fn parse_steps(test_data: &Value) -> Result<Vec<StepAction>, StepValidationError> {
    let params: UiCaseParams = if test_data.is_null() {
        UiCaseParams::default()
    } else {
        UiCaseParams::deserialize(test_data).map_err(|e| StepValidationError {
            index: None,
            message: format!("malformed UI case parameters: {}", e),
        })?
    };

    params
        .steps
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            StepAction::parse(raw).map_err(|message| StepValidationError {
                index: Some(index),
                message,
            })
        })
        .collect()
}
