//! TCP connect probe handler.
//!
//! Opens one or more TCP connections to `target:port`, measuring connect
//! latency. Optionally writes a payload and reads back a response sample.
//!
//! # Parameters
//!
//! - `connection_count` (int, default 3, max 20)
//! - `interval` (seconds between attempts, default 0.5)
//! - `send_data` (string written after connect)
//! - `expect_response` (bool, read up to 1 KiB after sending, default false)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{ProbeError, ProbeHandler, ProbeRequest, ProbeResult, ProbeStatus};

const MAX_CONNECTION_COUNT: u64 = 20;
const RESPONSE_SAMPLE_LIMIT: usize = 1024;

/// Probe handler for raw TCP reachability.
#[derive(Debug)]
pub struct TcpHandler;

impl TcpHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ConnectOutcome {
    success: bool,
    connect_time_ms: f64,
    response: Option<String>,
    error: Option<String>,
}

async fn single_connection(
    target: &str,
    port: u16,
    timeout: Duration,
    send_data: Option<&str>,
    expect_response: bool,
) -> ConnectOutcome {
    let started = Instant::now();

    let stream = match tokio::time::timeout(timeout, TcpStream::connect((target, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return ConnectOutcome {
                success: false,
                connect_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                response: None,
                error: Some(e.to_string()),
            }
        }
        Err(_) => {
            return ConnectOutcome {
                success: false,
                connect_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                response: None,
                error: Some("connect timed out".to_string()),
            }
        }
    };

    let connect_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    let mut stream = stream;
    let mut response = None;

    if let Some(payload) = send_data {
        if let Err(e) = stream.write_all(payload.as_bytes()).await {
            return ConnectOutcome {
                success: false,
                connect_time_ms,
                response: None,
                error: Some(format!("write failed: {e}")),
            };
        }

        if expect_response {
            let mut buf = vec![0u8; RESPONSE_SAMPLE_LIMIT];
            match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    response = Some(String::from_utf8_lossy(&buf[..n]).into_owned());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return ConnectOutcome {
                        success: false,
                        connect_time_ms,
                        response: None,
                        error: Some(format!("read failed: {e}")),
                    }
                }
                Err(_) => {
                    return ConnectOutcome {
                        success: false,
                        connect_time_ms,
                        response: None,
                        error: Some("read timed out".to_string()),
                    }
                }
            }
        }
    }

    ConnectOutcome {
        success: true,
        connect_time_ms,
        response,
        error: None,
    }
}

#[async_trait]
impl ProbeHandler for TcpHandler {
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    fn validate(&self, request: &ProbeRequest) -> Result<(), ProbeError> {
        if request.target.is_empty() {
            return Err(ProbeError::InvalidConfig("target must not be empty".into()));
        }
        if request.port.is_none() {
            return Err(ProbeError::InvalidConfig("port is required for tcp probes".into()));
        }
        let count = request.param_u64("connection_count", 3);
        if count == 0 || count > MAX_CONNECTION_COUNT {
            return Err(ProbeError::InvalidConfig(format!(
                "connection_count must be in 1..={MAX_CONNECTION_COUNT}"
            )));
        }
        Ok(())
    }

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        self.validate(request)?;
        let port = request.port.unwrap_or_default();

        let count = request.param_u64("connection_count", 3);
        let interval = Duration::from_secs_f64(request.param_f64("interval", 0.5));
        let send_data = request
            .parameters
            .get("send_data")
            .and_then(Value::as_str)
            .map(str::to_string);
        let expect_response = request.param_bool("expect_response", false);

        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(count as usize);
        for attempt in 0..count {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            outcomes.push(
                single_connection(
                    &request.target,
                    port,
                    request.timeout,
                    send_data.as_deref(),
                    expect_response,
                )
                .await,
            );
        }

        let successes: Vec<&ConnectOutcome> = outcomes.iter().filter(|o| o.success).collect();
        let success_rate = (successes.len() as f64 / outcomes.len() as f64) * 100.0;

        let mut result = ProbeResult::new("tcp", &request.target, request.port);
        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        result.metrics.insert("connection_attempts".into(), json!(outcomes.len()));
        result
            .metrics
            .insert("successful_connections".into(), json!(successes.len()));
        result
            .metrics
            .insert("success_rate".into(), json!((success_rate * 10.0).round() / 10.0));

        if !successes.is_empty() {
            let times: Vec<f64> = successes.iter().map(|o| o.connect_time_ms).collect();
            let min = times.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = times.iter().cloned().fold(0.0, f64::max);
            let avg = times.iter().sum::<f64>() / times.len() as f64;
            result
                .metrics
                .insert("min_connect_time_ms".into(), json!((min * 100.0).round() / 100.0));
            result
                .metrics
                .insert("max_connect_time_ms".into(), json!((max * 100.0).round() / 100.0));
            result
                .metrics
                .insert("avg_connect_time_ms".into(), json!((avg * 100.0).round() / 100.0));
        }

        result.raw_data.insert(
            "connection_results".into(),
            Value::Array(
                outcomes
                    .iter()
                    .map(|o| {
                        json!({
                            "success": o.success,
                            "connect_time_ms": o.connect_time_ms,
                            "response": o.response,
                            "error": o.error,
                        })
                    })
                    .collect(),
            ),
        );

        result.status = if successes.len() == outcomes.len() {
            ProbeStatus::Success
        } else if successes.is_empty() {
            result.error_message = outcomes
                .iter()
                .find_map(|o| o.error.clone())
                .or_else(|| Some("all connection attempts failed".to_string()));
            ProbeStatus::Failed
        } else {
            result.error_message = Some(format!(
                "{} of {} connection attempts failed",
                outcomes.len() - successes.len(),
                outcomes.len()
            ));
            ProbeStatus::Failed
        };

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tokio::net::TcpListener;

    fn request_for(target: &str, port: Option<u16>, parameters: Value) -> ProbeRequest {
        ProbeRequest {
            target: target.to_string(),
            port,
            timeout: Duration::from_secs(2),
            parameters: parameters.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    #[test]
    fn test_validate_requires_port() {
        let handler = TcpHandler::new();
        let err = handler.validate(&request_for("example.com", None, json!({}))).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
        assert!(handler.validate(&request_for("example.com", Some(443), json!({}))).is_ok());
    }

    #[test]
    fn test_validate_bounds_connection_count() {
        let handler = TcpHandler::new();
        let too_many = request_for("example.com", Some(80), json!({"connection_count": 50}));
        assert!(handler.validate(&too_many).is_err());
    }

    #[tokio::test]
    async fn test_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((_stream, _)) = listener.accept().await else { break };
            }
        });

        let handler = TcpHandler::new();
        let request = request_for(
            "127.0.0.1",
            Some(port),
            json!({"connection_count": 2, "interval": 0.01}),
        );
        let result = handler.probe(&request).await.unwrap();

        assert_eq!(result.status, ProbeStatus::Success);
        assert_eq!(result.metrics["successful_connections"], json!(2));
        assert_eq!(result.metrics["success_rate"], json!(100.0));
        assert!(result.metrics.contains_key("avg_connect_time_ms"));
    }

    #[tokio::test]
    async fn test_probe_refused_connection() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = TcpHandler::new();
        let request = request_for(
            "127.0.0.1",
            Some(port),
            json!({"connection_count": 1}),
        );
        let result = handler.probe(&request).await.unwrap();

        assert_eq!(result.status, ProbeStatus::Failed);
        assert!(result.error_message.is_some());
        assert_eq!(result.metrics["successful_connections"], json!(0));
    }
}
