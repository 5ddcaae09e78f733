//! netprobe-agent library.
//!
//! A distributed network-probe agent: a long-lived process that keeps one
//! authenticated WebSocket session to its control plane, executes probe
//! tasks (ICMP/TCP/UDP/HTTP/HTTPS) under a bounded worker pool, batches
//! results back over the channel, and self-updates over the air with signed
//! packages and rollback.

// Library modules
pub mod agent;
pub mod channel;
pub mod collector;
pub mod config;
pub mod constants;
pub mod executor;
pub mod monitor;
pub mod protocol;
pub mod update;

// Re-export commonly used types
pub use agent::Agent;
pub use channel::{ChannelError, ControlChannel, Envelope};
pub use collector::{ResultBatch, ResultCollector};
pub use config::AgentConfig;
pub use executor::{ExecutionStatus, TaskExecutor, TaskReport, TaskSpec};
pub use monitor::{ResourceMetrics, ResourceMonitor};
pub use protocol::{ProbeHandler, ProbeRequest, ProbeResult, ProbeStatus, ProtocolRegistry};
pub use update::{SignatureManager, UpdateClient, UpdateStatus};
