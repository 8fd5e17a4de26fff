use std::collections::BTreeMap;
use std::time::Duration;

use flakeguard_core::{AnalysisProvider, AnalysisRequest, FlakeError, Severity};
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Offline provider producing a fixed remediation template per request.
#[derive(Debug, Clone)]
pub struct MockAnalysisProvider {
    adapter_version: String,
}

impl Default for MockAnalysisProvider {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
        }
    }
}

impl MockAnalysisProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnalysisProvider for MockAnalysisProvider {
    fn analyze(&self, request: &AnalysisRequest) -> Result<String, FlakeError> {
        let severity = request.severity.map_or("unknown", Severity::as_str);
        let score = request
            .score
            .map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"));

        let mut hints = Vec::new();
        if request.is_retry_flaky {
            hints.push("failures usually pass on retry; look for races and unawaited async work");
        }
        if request.has_time_pattern {
            hints.push("failures cluster by time; check clock, timezone and scheduled-job coupling");
        }
        if request.has_environment_pattern {
            hints.push("failures cluster by environment; compare browser, OS and config drift");
        }
        if hints.is_empty() {
            hints.push("no dominant pattern; inspect recent failing runs for shared fixtures");
        }

        Ok(format!(
            "[{}] {}: severity {severity}, score {score}, {} of {} runs failed. {}.",
            self.adapter_version,
            request.test_id,
            request.fail_count,
            request.total_runs,
            hints.join("; ")
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAnalysisConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub auth_bearer_token: Option<String>,
}

impl HttpAnalysisConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            headers: BTreeMap::new(),
            auth_bearer_token: None,
        }
    }

    /// Reads `url`, `timeout_ms`, `headers` and `auth_bearer_env` from a
    /// JSON params object.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] when `url` is missing, headers
    /// are not string-valued, or the named bearer env var is unset.
    pub fn from_params(params: &Value) -> Result<Self, FlakeError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FlakeError::Configuration("http analysis provider requires params.url".to_string())
            })?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers.as_object().ok_or_else(|| {
                FlakeError::Configuration("params.headers must be an object".to_string())
            })?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    FlakeError::Configuration(format!(
                        "params.headers values must be strings, key='{key}'"
                    ))
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token = params
            .get("auth_bearer_env")
            .and_then(Value::as_str)
            .map(|env_name| {
                std::env::var(env_name).map_err(|_| {
                    FlakeError::Configuration(format!(
                        "missing env var '{env_name}' required by params.auth_bearer_env"
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }
}

/// Posts the analysis request as JSON and reads `analysis_text` from the
/// response body.
#[derive(Debug, Clone)]
pub struct HttpJsonAnalysisProvider {
    adapter_version: String,
    config: HttpAnalysisConfig,
}

impl HttpJsonAnalysisProvider {
    #[must_use]
    pub fn new(config: HttpAnalysisConfig) -> Self {
        Self {
            adapter_version: "http_json.v1".to_string(),
            config,
        }
    }
}

impl AnalysisProvider for HttpJsonAnalysisProvider {
    fn analyze(&self, request: &AnalysisRequest) -> Result<String, FlakeError> {
        let outbound_json = json!({
            "adapter_version": self.adapter_version,
            "request": request,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let body: Value = match req.send_json(&outbound_json) {
            Ok(response) => response.into_json().map_err(|err| {
                FlakeError::Analysis(format!("invalid analysis response body: {err}"))
            })?,
            Err(ureq::Error::Status(code, _response)) => {
                return Err(FlakeError::Analysis(format!("http status {code}")));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(FlakeError::Analysis(format!("http transport failure: {err}")));
            }
        };

        let text = body
            .get("analysis_text")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                FlakeError::Analysis("analysis response missing analysis_text".to_string())
            })?;

        debug!(test_id = %request.test_id, bytes = text.len(), "analysis received");
        Ok(text.to_string())
    }
}
