//! Protocol probe framework.
//!
//! Every probe protocol is a compiled-in handler implementing [`ProbeHandler`].
//! Handlers are registered once at startup into a name-keyed [`ProtocolRegistry`];
//! the registry is immutable afterwards and a duplicate registration is a
//! programmer error. Looking up an unknown protocol yields
//! [`ProbeError::Unsupported`], which the executor surfaces as a task rejection.
//!
//! # Handler contract
//!
//! - Handlers must be safe to invoke concurrently; they hold no mutable state
//!   across invocations.
//! - The executor enforces the hard deadline externally. Handlers still bound
//!   their own I/O so they terminate promptly when things go wrong.

pub mod http;
pub mod icmp;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Outcome classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// The probe met its success criteria.
    Success,
    /// The probe ran but the target did not answer in time.
    Timeout,
    /// The probe could not be carried out (resolution failure, refused
    /// connection, malformed target).
    Error,
    /// The probe ran to completion but the target failed the health criteria
    /// (e.g. unexpected HTTP status, partial packet loss).
    Failed,
}

/// Result of one probe execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub protocol: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: ProbeStatus,
    pub duration_ms: f64,
    /// Seconds since the Unix epoch at probe completion.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Numeric/string observables (success rates, latencies, status codes).
    pub metrics: Map<String, Value>,
    /// Protocol-specific evidence (per-attempt records, response excerpts).
    pub raw_data: Map<String, Value>,
}

impl ProbeResult {
    /// Creates a result shell stamped with the current time; callers fill in
    /// status, duration and observables.
    pub fn new(protocol: &str, target: &str, port: Option<u16>) -> Self {
        Self {
            protocol: protocol.to_string(),
            target: target.to_string(),
            port,
            status: ProbeStatus::Error,
            duration_ms: 0.0,
            timestamp: chrono::Utc::now().timestamp(),
            error_message: None,
            metrics: Map::new(),
            raw_data: Map::new(),
        }
    }
}

/// A single probe assignment as the executor hands it to a handler.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub target: String,
    pub port: Option<u16>,
    /// Deadline for the whole probe. The executor also enforces this with a
    /// hard cancel.
    pub timeout: Duration,
    /// Protocol-specific parameters from the job.
    pub parameters: Map<String, Value>,
}

impl ProbeRequest {
    /// Integer parameter with a default.
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.parameters.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// Float parameter with a default.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.parameters.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    /// String parameter with a default.
    pub fn param_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameters.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    /// Boolean parameter with a default.
    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.parameters.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

/// Errors surfaced by probe handlers and the registry.
#[derive(Debug)]
pub enum ProbeError {
    /// No handler is registered for the requested protocol.
    Unsupported(String),
    /// A handler was registered twice under the same name.
    DuplicateHandler(String),
    /// The job's parameters are invalid for this protocol.
    InvalidConfig(String),
    /// The probe could not be executed.
    Execution(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported(protocol) => write!(f, "unsupported protocol: {protocol}"),
            Self::DuplicateHandler(protocol) => {
                write!(f, "protocol handler already registered: {protocol}")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid probe configuration: {msg}"),
            Self::Execution(msg) => write!(f, "probe execution failed: {msg}"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// A compiled-in probe implementation for one protocol.
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    /// Protocol tag this handler serves (`icmp`, `tcp`, ...).
    fn protocol(&self) -> &'static str;

    /// Validates the request before any network activity.
    fn validate(&self, request: &ProbeRequest) -> Result<(), ProbeError>;

    /// Runs the probe. Must honor `request.timeout` and never block the
    /// caller on an undeadlined syscall.
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError>;
}

impl std::fmt::Debug for dyn ProbeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeHandler")
            .field("protocol", &self.protocol())
            .finish()
    }
}

/// Name-keyed registry of probe handlers.
///
/// Populated once at startup; lookups are lock-free afterwards because the
/// registry is shared immutably behind an `Arc`.
pub struct ProtocolRegistry {
    handlers: HashMap<&'static str, Arc<dyn ProbeHandler>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.supported_protocols())
            .finish()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry with every built-in handler registered.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration, which can only happen through a
    /// programming error in this constructor.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        for handler in [
            Arc::new(icmp::IcmpHandler::new()) as Arc<dyn ProbeHandler>,
            Arc::new(tcp::TcpHandler::new()),
            Arc::new(udp::UdpHandler::new()),
            Arc::new(http::HttpHandler::plain()),
            Arc::new(http::HttpHandler::tls()),
        ] {
            registry
                .register(handler)
                .expect("built-in protocol registered twice");
        }
        registry
    }

    /// Registers a handler under its protocol tag.
    pub fn register(&mut self, handler: Arc<dyn ProbeHandler>) -> Result<(), ProbeError> {
        let protocol = handler.protocol();
        if self.handlers.contains_key(protocol) {
            return Err(ProbeError::DuplicateHandler(protocol.to_string()));
        }
        log::debug!("Registered protocol handler: {}", protocol);
        self.handlers.insert(protocol, handler);
        Ok(())
    }

    /// Looks up the handler for `protocol`.
    pub fn handler(&self, protocol: &str) -> Result<Arc<dyn ProbeHandler>, ProbeError> {
        self.handlers
            .get(protocol)
            .cloned()
            .ok_or_else(|| ProbeError::Unsupported(protocol.to_string()))
    }

    /// Whether `protocol` has a registered handler.
    pub fn is_supported(&self, protocol: &str) -> bool {
        self.handlers.contains_key(protocol)
    }

    /// Sorted list of registered protocol tags; advertised as the agent's
    /// capability set during registration.
    pub fn supported_protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> =
            self.handlers.keys().map(|p| (*p).to_string()).collect();
        protocols.sort();
        protocols
    }
}
