//! HTTP/HTTPS probe handler.
//!
//! Issues one or more requests against the target and aggregates response
//! codes and timings. Registered twice, once per URL scheme, so the registry
//! advertises `http` and `https` as distinct capabilities.
//!
//! # Parameters
//!
//! - `method` (string, default `GET`)
//! - `headers` (map of string → string)
//! - `body` (string)
//! - `status_codes` (list of acceptable codes, default `[200]`)
//! - `follow_redirects` (bool, default `true`)
//! - `verify_ssl` (bool, default `true`)
//! - `content_check` (substring the body must contain)
//! - `request_attempts` (int, default 1, max 10)
//! - `retry_interval` (seconds between attempts, default 1.0)

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

use super::{ProbeError, ProbeHandler, ProbeRequest, ProbeResult, ProbeStatus};
use crate::constants;

const MAX_REQUEST_ATTEMPTS: u64 = 10;

/// Bytes of body retained as evidence per attempt.
const CONTENT_SAMPLE_LIMIT: usize = 512;

/// Probe handler for HTTP and HTTPS targets.
pub struct HttpHandler {
    scheme: &'static str,
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler").field("scheme", &self.scheme).finish()
    }
}

#[derive(Debug)]
struct AttemptOutcome {
    success: bool,
    status_code: Option<u16>,
    response_time_ms: f64,
    content_length: Option<u64>,
    content_sample: Option<String>,
    error: Option<String>,
}

impl HttpHandler {
    /// Handler registered under the `http` tag.
    pub fn plain() -> Self {
        Self { scheme: "http" }
    }

    /// Handler registered under the `https` tag.
    pub fn tls() -> Self {
        Self { scheme: "https" }
    }

    /// Builds the request URL. Targets that already carry a scheme are used
    /// as-is; bare hosts get this handler's scheme and the optional port.
    fn build_url(&self, target: &str, port: Option<u16>) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            return target.to_string();
        }
        match port {
            Some(port) => format!("{}://{}:{}", self.scheme, target, port),
            None => format!("{}://{}", self.scheme, target),
        }
    }

    async fn run_attempt(
        &self,
        client: &reqwest::Client,
        url: &str,
        method: &reqwest::Method,
        headers: &Map<String, Value>,
        body: Option<&str>,
    ) -> AttemptOutcome {
        let started = Instant::now();

        let mut request = client.request(method.clone(), url);
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(name, value);
            }
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        match request.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let content_length = response.content_length();
                let body = response.text().await.unwrap_or_default();
                let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

                AttemptOutcome {
                    success: true,
                    status_code: Some(status_code),
                    response_time_ms,
                    content_length: content_length.or(Some(body.len() as u64)),
                    content_sample: Some(body.chars().take(CONTENT_SAMPLE_LIMIT).collect()),
                    error: None,
                }
            }
            Err(e) => AttemptOutcome {
                success: false,
                status_code: e.status().map(|s| s.as_u16()),
                response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                content_length: None,
                content_sample: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn aggregate(
        attempts: &[AttemptOutcome],
        expected_codes: &[u16],
        content_check: Option<&str>,
    ) -> (ProbeStatus, Option<String>, Map<String, Value>) {
        let total = attempts.len();
        let successes: Vec<&AttemptOutcome> = attempts.iter().filter(|a| a.success).collect();
        let success_rate = (successes.len() as f64 / total.max(1) as f64) * 100.0;

        let mut metrics = Map::new();
        metrics.insert("total_requests".into(), json!(total));
        metrics.insert("successful_requests".into(), json!(successes.len()));
        metrics.insert("failed_requests".into(), json!(total - successes.len()));
        metrics.insert("success_rate".into(), json!((success_rate * 10.0).round() / 10.0));

        let times: Vec<f64> = successes.iter().map(|a| a.response_time_ms).collect();
        if !times.is_empty() {
            let min = times.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = times.iter().cloned().fold(0.0, f64::max);
            let avg = times.iter().sum::<f64>() / times.len() as f64;
            metrics.insert("min_response_time".into(), json!((min * 100.0).round() / 100.0));
            metrics.insert("max_response_time".into(), json!((max * 100.0).round() / 100.0));
            metrics.insert("avg_response_time".into(), json!((avg * 100.0).round() / 100.0));
        }

        let mut distribution: Map<String, Value> = Map::new();
        for attempt in attempts {
            if let Some(code) = attempt.status_code {
                let entry = distribution.entry(code.to_string()).or_insert(json!(0));
                *entry = json!(entry.as_u64().unwrap_or(0) + 1);
            }
        }
        metrics.insert("status_code_distribution".into(), Value::Object(distribution));

        if let Some(code) = successes.last().and_then(|a| a.status_code) {
            metrics.insert("status_code".into(), json!(code));
        }

        let lengths: Vec<u64> = successes.iter().filter_map(|a| a.content_length).collect();
        if !lengths.is_empty() {
            metrics.insert(
                "content_length_avg".into(),
                json!(lengths.iter().sum::<u64>() / lengths.len() as u64),
            );
        }

        if successes.is_empty() {
            let error = attempts
                .iter()
                .find_map(|a| a.error.clone())
                .unwrap_or_else(|| "all requests failed".to_string());
            return (ProbeStatus::Failed, Some(error), metrics);
        }

        let unexpected: Vec<u16> = successes
            .iter()
            .filter_map(|a| a.status_code)
            .filter(|code| !expected_codes.contains(code))
            .collect();
        if !unexpected.is_empty() {
            return (
                ProbeStatus::Failed,
                Some(format!("unexpected status codes: {unexpected:?}")),
                metrics,
            );
        }

        if let Some(needle) = content_check {
            let misses = successes
                .iter()
                .filter(|a| {
                    a.content_sample
                        .as_deref()
                        .map_or(true, |sample| !sample.contains(needle))
                })
                .count();
            if misses > 0 {
                return (
                    ProbeStatus::Failed,
                    Some(format!("content check failed in {misses} responses")),
                    metrics,
                );
            }
        }

        if success_rate < 50.0 {
            return (
                ProbeStatus::Failed,
                Some(format!("low success rate: {success_rate:.1}%")),
                metrics,
            );
        }

        (ProbeStatus::Success, None, metrics)
    }
}

#[async_trait]
impl ProbeHandler for HttpHandler {
    fn protocol(&self) -> &'static str {
        self.scheme
    }

    fn validate(&self, request: &ProbeRequest) -> Result<(), ProbeError> {
        if request.target.is_empty() {
            return Err(ProbeError::InvalidConfig("target must not be empty".into()));
        }
        let attempts = request.param_u64("request_attempts", 1);
        if attempts == 0 || attempts > MAX_REQUEST_ATTEMPTS {
            return Err(ProbeError::InvalidConfig(format!(
                "request_attempts must be in 1..={MAX_REQUEST_ATTEMPTS}"
            )));
        }
        let method = request.param_str("method", "GET");
        method
            .parse::<reqwest::Method>()
            .map_err(|_| ProbeError::InvalidConfig(format!("invalid HTTP method: {method}")))?;
        Ok(())
    }

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        self.validate(request)?;

        let url = self.build_url(&request.target, request.port);
        let method: reqwest::Method = request
            .param_str("method", "GET")
            .parse()
            .map_err(|_| ProbeError::InvalidConfig("invalid HTTP method".into()))?;
        let attempts = request.param_u64("request_attempts", 1);
        let retry_interval = Duration::from_secs_f64(request.param_f64("retry_interval", 1.0));
        let follow_redirects = request.param_bool("follow_redirects", true);
        let verify_ssl = request.param_bool("verify_ssl", true);
        let user_agent = request
            .param_str("user_agent", &constants::user_agent())
            .to_string();
        let headers = request
            .parameters
            .get("headers")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let body = request
            .parameters
            .get("body")
            .and_then(Value::as_str)
            .map(str::to_string);
        let expected_codes: Vec<u16> = request
            .parameters
            .get("status_codes")
            .and_then(Value::as_array)
            .map(|codes| codes.iter().filter_map(|c| c.as_u64().map(|c| c as u16)).collect())
            .unwrap_or_else(|| vec![200]);
        let content_check = request
            .parameters
            .get("content_check")
            .and_then(Value::as_str)
            .map(str::to_string);

        let redirect_policy = if follow_redirects {
            reqwest::redirect::Policy::limited(request.param_u64("max_redirects", 10) as usize)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .timeout(request.timeout)
            .redirect(redirect_policy)
            .danger_accept_invalid_certs(!verify_ssl)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProbeError::Execution(format!("failed to build HTTP client: {e}")))?;

        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(attempts as usize);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(retry_interval).await;
            }
            outcomes.push(
                self.run_attempt(&client, &url, &method, &headers, body.as_deref())
                    .await,
            );
        }

        let (status, error_message, metrics) =
            Self::aggregate(&outcomes, &expected_codes, content_check.as_deref());

        let mut result = ProbeResult::new(self.scheme, &request.target, request.port);
        result.status = status;
        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        result.error_message = error_message;
        result.metrics = metrics;
        result.raw_data.insert("url".into(), json!(url));
        result.raw_data.insert(
            "request_results".into(),
            Value::Array(
                outcomes
                    .iter()
                    .map(|a| {
                        json!({
                            "success": a.success,
                            "status_code": a.status_code,
                            "response_time_ms": a.response_time_ms,
                            "content_length": a.content_length,
                            "error": a.error,
                        })
                    })
                    .collect(),
            ),
        );

        Ok(result)
    }
}
