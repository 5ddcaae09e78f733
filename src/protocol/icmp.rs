//! ICMP probe handler.
//!
//! Shells out to the system `ping` binary instead of opening raw sockets, so
//! the agent needs no elevated privileges. Output parsing covers the summary
//! lines emitted by both Linux (`rtt min/avg/max/mdev`) and BSD/macOS
//! (`round-trip min/avg/max/stddev`) ping implementations.
//!
//! # Parameters
//!
//! - `packet_count` (int, default 4, max 20)
//! - `packet_size` (payload bytes, default 56)
//! - `interval` (seconds between packets, default 1.0, min 0.2)

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use super::{ProbeError, ProbeHandler, ProbeRequest, ProbeResult, ProbeStatus};

const MAX_PACKET_COUNT: u64 = 20;

/// Probe handler for ICMP echo via the system `ping` command.
#[derive(Debug)]
pub struct IcmpHandler;

impl IcmpHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IcmpHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics scraped from ping's summary output.
#[derive(Debug, Default, PartialEq)]
struct PingStats {
    transmitted: u64,
    received: u64,
    loss_percent: f64,
    rtt_min_ms: Option<f64>,
    rtt_avg_ms: Option<f64>,
    rtt_max_ms: Option<f64>,
}

/// Parses the `N packets transmitted, M received/M packets received, X% packet loss`
/// and `min/avg/max` summary lines.
fn parse_ping_output(output: &str) -> PingStats {
    let mut stats = PingStats::default();

    for line in output.lines() {
        if line.contains("packets transmitted") {
            for part in line.split(',') {
                let part = part.trim();
                if let Some(raw) = part.strip_suffix("packets transmitted") {
                    stats.transmitted = raw.trim().parse().unwrap_or(0);
                } else if part.ends_with("received") {
                    let raw = part
                        .trim_end_matches("packets received")
                        .trim_end_matches("received")
                        .trim();
                    stats.received = raw.parse().unwrap_or(0);
                } else if let Some(idx) = part.find("% packet loss") {
                    stats.loss_percent = part[..idx].trim().parse().unwrap_or(100.0);
                }
            }
        } else if (line.starts_with("rtt min/avg/max")
            || line.starts_with("round-trip min/avg/max"))
            && line.contains('=')
        {
            if let Some((_, values)) = line.split_once('=') {
                let values = values.trim().trim_end_matches(" ms");
                let mut parts = values.split('/');
                stats.rtt_min_ms = parts.next().and_then(|v| v.trim().parse().ok());
                stats.rtt_avg_ms = parts.next().and_then(|v| v.trim().parse().ok());
                stats.rtt_max_ms = parts.next().and_then(|v| v.trim().parse().ok());
            }
        }
    }

    stats
}

#[async_trait]
impl ProbeHandler for IcmpHandler {
    fn protocol(&self) -> &'static str {
        "icmp"
    }

    fn validate(&self, request: &ProbeRequest) -> Result<(), ProbeError> {
        if request.target.is_empty() {
            return Err(ProbeError::InvalidConfig("target must not be empty".into()));
        }
        let count = request.param_u64("packet_count", 4);
        if count == 0 || count > MAX_PACKET_COUNT {
            return Err(ProbeError::InvalidConfig(format!(
                "packet_count must be in 1..={MAX_PACKET_COUNT}"
            )));
        }
        Ok(())
    }

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        self.validate(request)?;

        let count = request.param_u64("packet_count", 4);
        let size = request.param_u64("packet_size", 56);
        let interval = request.param_f64("interval", 1.0).max(0.2);

        let mut command = Command::new("ping");
        command
            .arg("-c")
            .arg(count.to_string())
            .arg("-s")
            .arg(size.to_string())
            .arg("-i")
            .arg(format!("{interval:.1}"))
            .arg(&request.target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut result = ProbeResult::new("icmp", &request.target, None);

        let output = match tokio::time::timeout(request.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProbeError::Execution(format!("failed to run ping: {e}")));
            }
            Err(_) => {
                result.status = ProbeStatus::Timeout;
                result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                result.error_message = Some("ping timed out".to_string());
                return Ok(result);
            }
        };

        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let stats = parse_ping_output(&stdout);

        result.metrics.insert("packets_sent".into(), json!(stats.transmitted));
        result.metrics.insert("packets_received".into(), json!(stats.received));
        result
            .metrics
            .insert("packet_loss_percent".into(), json!(stats.loss_percent));
        if let Some(min) = stats.rtt_min_ms {
            result.metrics.insert("rtt_min_ms".into(), json!(min));
        }
        if let Some(avg) = stats.rtt_avg_ms {
            result.metrics.insert("rtt_avg_ms".into(), json!(avg));
        }
        if let Some(max) = stats.rtt_max_ms {
            result.metrics.insert("rtt_max_ms".into(), json!(max));
        }
        result.raw_data.insert("stdout".into(), json!(stdout));
        if !stderr.is_empty() {
            result.raw_data.insert("stderr".into(), json!(stderr));
        }

        result.status = if !output.status.success() || stats.received == 0 {
            result.error_message = Some(if stderr.is_empty() {
                "no echo replies received".to_string()
            } else {
                stderr.trim().to_string()
            });
            ProbeStatus::Failed
        } else if stats.received < stats.transmitted {
            result.error_message = Some(format!("packet loss: {:.1}%", stats.loss_percent));
            ProbeStatus::Failed
        } else {
            ProbeStatus::Success
        };

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;

    #[test]
    fn test_parse_linux_ping_output() {
        let output = "\
PING 127.0.0.1 (127.0.0.1) 56(84) bytes of data.
64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms

--- 127.0.0.1 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2037ms
rtt min/avg/max/mdev = 0.035/0.045/0.056/0.008 ms
";
        let stats = parse_ping_output(output);
        assert_eq!(stats.transmitted, 3);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.loss_percent, 0.0);
        assert_eq!(stats.rtt_min_ms, Some(0.035));
        assert_eq!(stats.rtt_avg_ms, Some(0.045));
        assert_eq!(stats.rtt_max_ms, Some(0.056));
    }

    #[test]
    fn test_parse_macos_ping_output() {
        let output = "\
--- example.com ping statistics ---
4 packets transmitted, 4 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 11.352/12.961/15.790/1.767 ms
";
        let stats = parse_ping_output(output);
        assert_eq!(stats.transmitted, 4);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.rtt_avg_ms, Some(12.961));
    }

    #[test]
    fn test_parse_lossy_ping_output() {
        let output = "\
--- 10.0.0.9 ping statistics ---
5 packets transmitted, 2 received, 60% packet loss, time 4096ms
rtt min/avg/max/mdev = 10.1/11.2/12.3/0.9 ms
";
        let stats = parse_ping_output(output);
        assert_eq!(stats.transmitted, 5);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.loss_percent, 60.0);
    }

    #[test]
    fn test_parse_empty_output() {
        let stats = parse_ping_output("");
        assert_eq!(stats, PingStats::default());
    }

    #[test]
    fn test_validate_bounds() {
        let handler = IcmpHandler::new();
        let request = ProbeRequest {
            target: "example.com".to_string(),
            port: None,
            timeout: Duration::from_secs(5),
            parameters: serde_json::json!({"packet_count": 100})
                .as_object()
                .cloned()
                .unwrap_or_else(Map::new),
        };
        assert!(handler.validate(&request).is_err());

        let empty_target = ProbeRequest {
            target: String::new(),
            port: None,
            timeout: Duration::from_secs(5),
            parameters: Map::new(),
        };
        assert!(handler.validate(&empty_target).is_err());
    }
}
