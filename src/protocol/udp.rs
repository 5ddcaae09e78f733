//! UDP packet probe handler.
//!
//! Fires sequenced datagrams at `target:port`. With `expect_response` the
//! probe waits for an echo per packet and reports loss and round-trip times;
//! without it, delivery of the send itself is the health signal (an ICMP
//! port-unreachable often surfaces as an error on the next send).
//!
//! # Parameters
//!
//! - `packet_count` (int, default 5, max 100)
//! - `packet_size` (payload bytes, default 64, max 65507)
//! - `interval` (seconds between packets, default 0.2)
//! - `expect_response` (bool, default false)
//! - `response_timeout` (seconds to wait per packet, default 2.0)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{ProbeError, ProbeHandler, ProbeRequest, ProbeResult, ProbeStatus};

const MAX_PACKET_COUNT: u64 = 100;
const MAX_PACKET_SIZE: u64 = 65_507;

/// Probe handler for UDP reachability.
#[derive(Debug)]
pub struct UdpHandler;

impl UdpHandler {
    pub fn new() -> Self {
        Self
    }

    /// Sequenced payload: a marker plus the sequence number, padded out to
    /// `size` bytes so loss can be attributed per packet.
    fn packet_payload(size: usize, sequence: u64) -> Vec<u8> {
        let header = format!("NETPROBE {sequence} ");
        let mut payload = header.into_bytes();
        payload.resize(size.max(payload.len()), b'x');
        payload.truncate(size.max(8));
        payload
    }
}

impl Default for UdpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct PacketOutcome {
    sent: bool,
    responded: bool,
    rtt_ms: Option<f64>,
    error: Option<String>,
}

#[async_trait]
impl ProbeHandler for UdpHandler {
    fn protocol(&self) -> &'static str {
        "udp"
    }

    fn validate(&self, request: &ProbeRequest) -> Result<(), ProbeError> {
        if request.target.is_empty() {
            return Err(ProbeError::InvalidConfig("target must not be empty".into()));
        }
        if request.port.is_none() {
            return Err(ProbeError::InvalidConfig("port is required for udp probes".into()));
        }
        let count = request.param_u64("packet_count", 5);
        if count == 0 || count > MAX_PACKET_COUNT {
            return Err(ProbeError::InvalidConfig(format!(
                "packet_count must be in 1..={MAX_PACKET_COUNT}"
            )));
        }
        let size = request.param_u64("packet_size", 64);
        if size == 0 || size > MAX_PACKET_SIZE {
            return Err(ProbeError::InvalidConfig(format!(
                "packet_size must be in 1..={MAX_PACKET_SIZE}"
            )));
        }
        Ok(())
    }

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        self.validate(request)?;
        let port = request.port.unwrap_or_default();

        let packet_count = request.param_u64("packet_count", 5);
        let packet_size = request.param_u64("packet_size", 64) as usize;
        let interval = Duration::from_secs_f64(request.param_f64("interval", 0.2));
        let expect_response = request.param_bool("expect_response", false);
        let response_timeout =
            Duration::from_secs_f64(request.param_f64("response_timeout", 2.0));

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ProbeError::Execution(format!("failed to bind UDP socket: {e}")))?;
        socket
            .connect((request.target.as_str(), port))
            .await
            .map_err(|e| ProbeError::Execution(format!("failed to resolve target: {e}")))?;

        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(packet_count as usize);
        let mut recv_buf = vec![0u8; MAX_PACKET_SIZE as usize];

        for sequence in 0..packet_count {
            if sequence > 0 {
                tokio::time::sleep(interval).await;
            }

            let payload = Self::packet_payload(packet_size, sequence);
            let sent_at = Instant::now();

            match socket.send(&payload).await {
                Ok(_) => {
                    if expect_response {
                        match tokio::time::timeout(response_timeout, socket.recv(&mut recv_buf))
                            .await
                        {
                            Ok(Ok(_n)) => outcomes.push(PacketOutcome {
                                sent: true,
                                responded: true,
                                rtt_ms: Some(sent_at.elapsed().as_secs_f64() * 1000.0),
                                error: None,
                            }),
                            Ok(Err(e)) => outcomes.push(PacketOutcome {
                                sent: true,
                                responded: false,
                                rtt_ms: None,
                                error: Some(e.to_string()),
                            }),
                            Err(_) => outcomes.push(PacketOutcome {
                                sent: true,
                                responded: false,
                                rtt_ms: None,
                                error: Some("response timed out".to_string()),
                            }),
                        }
                    } else {
                        outcomes.push(PacketOutcome {
                            sent: true,
                            responded: false,
                            rtt_ms: None,
                            error: None,
                        });
                    }
                }
                Err(e) => outcomes.push(PacketOutcome {
                    sent: false,
                    responded: false,
                    rtt_ms: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        let sent = outcomes.iter().filter(|o| o.sent).count();
        let received = outcomes.iter().filter(|o| o.responded).count();

        let mut result = ProbeResult::new("udp", &request.target, request.port);
        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        result.metrics.insert("packets_sent".into(), json!(sent));

        if expect_response {
            let loss = if sent > 0 {
                ((sent - received) as f64 / sent as f64) * 100.0
            } else {
                100.0
            };
            result.metrics.insert("packets_received".into(), json!(received));
            result
                .metrics
                .insert("packet_loss_percent".into(), json!((loss * 10.0).round() / 10.0));

            let rtts: Vec<f64> = outcomes.iter().filter_map(|o| o.rtt_ms).collect();
            if !rtts.is_empty() {
                let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = rtts.iter().cloned().fold(0.0, f64::max);
                let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
                result
                    .metrics
                    .insert("min_response_time_ms".into(), json!((min * 100.0).round() / 100.0));
                result
                    .metrics
                    .insert("max_response_time_ms".into(), json!((max * 100.0).round() / 100.0));
                result
                    .metrics
                    .insert("avg_response_time_ms".into(), json!((avg * 100.0).round() / 100.0));
            }

            result.status = if received == 0 {
                result.error_message = Some("no responses received".to_string());
                ProbeStatus::Failed
            } else if received < sent {
                result.error_message = Some(format!("packet loss: {loss:.1}%"));
                ProbeStatus::Failed
            } else {
                ProbeStatus::Success
            };
        } else {
            result.status = if sent == outcomes.len() {
                ProbeStatus::Success
            } else {
                result.error_message = outcomes
                    .iter()
                    .find_map(|o| o.error.clone())
                    .or_else(|| Some("send failures".to_string()));
                ProbeStatus::Failed
            };
        }

        result.raw_data.insert(
            "packet_results".into(),
            Value::Array(
                outcomes
                    .iter()
                    .map(|o| {
                        json!({
                            "sent": o.sent,
                            "responded": o.responded,
                            "rtt_ms": o.rtt_ms,
                            "error": o.error,
                        })
                    })
                    .collect(),
            ),
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn request_for(target: &str, port: Option<u16>, parameters: Value) -> ProbeRequest {
        ProbeRequest {
            target: target.to_string(),
            port,
            timeout: Duration::from_secs(2),
            parameters: parameters.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    #[test]
    fn test_validate_requires_port_and_bounds() {
        let handler = UdpHandler::new();
        assert!(handler.validate(&request_for("example.com", None, json!({}))).is_err());
        assert!(handler
            .validate(&request_for("example.com", Some(53), json!({"packet_count": 0})))
            .is_err());
        assert!(handler
            .validate(&request_for("example.com", Some(53), json!({"packet_size": 100000})))
            .is_err());
        assert!(handler.validate(&request_for("example.com", Some(53), json!({}))).is_ok());
    }

    #[test]
    fn test_packet_payload_sequenced_and_sized() {
        let payload = UdpHandler::packet_payload(64, 3);
        assert_eq!(payload.len(), 64);
        assert!(payload.starts_with(b"NETPROBE 3 "));
    }

    #[tokio::test]
    async fn test_probe_against_local_echo() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..n], peer).await;
            }
        });

        let handler = UdpHandler::new();
        let request = request_for(
            "127.0.0.1",
            Some(port),
            json!({
                "packet_count": 3,
                "interval": 0.01,
                "expect_response": true,
                "response_timeout": 1.0,
            }),
        );
        let result = handler.probe(&request).await.unwrap();

        assert_eq!(result.status, ProbeStatus::Success);
        assert_eq!(result.metrics["packets_sent"], json!(3));
        assert_eq!(result.metrics["packets_received"], json!(3));
        assert_eq!(result.metrics["packet_loss_percent"], json!(0.0));
        assert!(result.metrics.contains_key("avg_response_time_ms"));
    }

    #[tokio::test]
    async fn test_probe_silent_peer_counts_loss() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        // Keep the socket open but never respond.
        let _keep = silent;

        let handler = UdpHandler::new();
        let request = request_for(
            "127.0.0.1",
            Some(port),
            json!({
                "packet_count": 2,
                "interval": 0.01,
                "expect_response": true,
                "response_timeout": 0.05,
            }),
        );
        let result = handler.probe(&request).await.unwrap();

        assert_eq!(result.status, ProbeStatus::Failed);
        assert_eq!(result.metrics["packet_loss_percent"], json!(100.0));
    }
}
