//! Packet-generation engine: the control-plane contract and its types.
//!
//! [`Engine`] is what the traffic layer drives. [`client::DroneClient`] talks
//! to a remote engine over the wire protocol in [`rpc`]/[`wire`];
//! [`sim::SimEngine`] is an in-process engine with a simulated bridge behind
//! it, and [`server`] exposes any engine over the same protocol.

pub mod client;
pub mod rpc;
pub mod server;
pub mod sim;
pub mod wire;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::headers::Protocol;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-port stream identifier. Only unique within one port, and reused
/// after every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub id: PortId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub track_stream_stats: bool,
}

/// Full configuration of one stream, as pushed by a modify call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub enabled: bool,
    pub frame_len: u16,
    pub num_packets: u64,
    pub packets_per_sec: f64,
    pub protocols: Vec<Protocol>,
}

impl StreamConfig {
    /// Correlation tag carried by the signature layer, if the stream has one.
    pub fn tag(&self) -> Option<u32> {
        self.protocols.iter().find_map(|p| match p {
            Protocol::Signature { tag } => Some(*tag),
            _ => None,
        })
    }
}

/// Aggregate counters for one port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortStats {
    pub port: PortId,
    pub transmit_active: bool,
    pub capture_active: bool,
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub rx_pps: u64,
    pub rx_bps: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
    pub tx_pps: u64,
    pub tx_bps: u64,
    pub rx_drops: u64,
    pub rx_errors: u64,
    pub rx_fifo_errors: u64,
    pub rx_frame_errors: u64,
}

/// Counters for the frames of one correlation tag seen on one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub port: PortId,
    pub tag: u32,
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed engine message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("engine connection closed")]
    Closed,

    #[error("engine message of {size} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unexpected engine response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: &'static str, got: String },

    #[error("engine error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("unknown port {0}")]
    UnknownPort(PortId),

    #[error("no port named {0}")]
    UnknownPortName(String),

    #[error("unknown stream {stream} on port {port}")]
    UnknownStream { port: PortId, stream: StreamId },

    #[error("stream {stream} on port {port} cannot be rendered: {reason}")]
    InvalidStream {
        port: PortId,
        stream: StreamId,
        reason: String,
    },
}

impl EngineError {
    /// Numeric code used when the error crosses the wire.
    pub fn code(&self) -> u32 {
        match self {
            EngineError::UnknownPort(_)
            | EngineError::UnknownPortName(_)
            | EngineError::UnknownStream { .. } => 404,
            EngineError::InvalidStream { .. } => 422,
            EngineError::FrameTooLarge { .. } => 413,
            EngineError::Codec(_) | EngineError::UnexpectedResponse { .. } => 400,
            EngineError::Remote { code, .. } => *code,
            EngineError::Io(_) | EngineError::Closed => 500,
        }
    }
}

/// Control-plane operations of a packet-generation engine.
///
/// Port-list operations take an explicit list so the caller decides which
/// ports take part in a run.
#[async_trait::async_trait]
pub trait Engine: Send {
    async fn port_configs(&mut self) -> Result<Vec<PortConfig>, EngineError>;

    async fn set_stream_tracking(&mut self, port: PortId, enabled: bool) -> Result<(), EngineError>;

    async fn add_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError>;

    async fn delete_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError>;

    async fn modify_streams(&mut self, port: PortId, streams: &[StreamConfig]) -> Result<(), EngineError>;

    async fn start_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError>;

    async fn stop_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError>;

    async fn start_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError>;

    async fn stop_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError>;

    async fn clear_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError>;

    async fn clear_stream_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError>;

    async fn port_stats(&mut self, ports: &[PortId]) -> Result<Vec<PortStats>, EngineError>;

    async fn stream_stats(&mut self, ports: &[PortId]) -> Result<Vec<StreamStats>, EngineError>;

    /// Capture buffer of a port as a pcap file image.
    async fn capture_buffer(&mut self, port: PortId) -> Result<Vec<u8>, EngineError>;

    async fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}
