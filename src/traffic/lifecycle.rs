//! Stream allocation and per-run cleanup.
//!
//! Engine stream ids are only unique per port and start over after every
//! run. The correlation tag is what ties statistics back to a stream: it is
//! drawn from one counter that only ever goes up.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::registry::Interface;
use super::TrafficError;
use crate::engine::{Engine, EngineError, PortId, StreamConfig, StreamId};
use crate::headers::{build_stack, StreamPattern, FRAME_LEN};

/// A stream created on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    pub port: PortId,
    pub id: StreamId,
    pub tag: u32,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    next_tag: u32,
    /// Tags issued since the last reset, with the interface that sent them.
    run_tags: BTreeMap<u32, String>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_tag(&self) -> u32 {
        self.next_tag
    }

    pub fn run_tags(&self) -> &BTreeMap<u32, String> {
        &self.run_tags
    }

    /// Create the next engine stream on `iface` and hand out its tag.
    ///
    /// Fails without touching the engine once the tag counter cannot advance.
    pub async fn allocate<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        iface: &mut Interface,
    ) -> Result<StreamHandle, TrafficError> {
        let following = self
            .next_tag
            .checked_add(1)
            .ok_or(TrafficError::TagsExhausted)?;
        let handle = StreamHandle {
            port: iface.port(),
            id: StreamId(iface.next_stream_id),
            tag: self.next_tag,
        };
        engine.add_streams(handle.port, &[handle.id]).await?;

        iface.stream_ids.push(handle.id);
        iface.next_stream_id += 1;
        self.next_tag = following;
        self.run_tags.insert(handle.tag, iface.name().to_string());
        Ok(handle)
    }

    /// Allocate a stream and push its full configuration.
    pub async fn add_stream<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        iface: &mut Interface,
        pattern: &StreamPattern,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        let handle = self.allocate(engine, iface).await?;
        let config = StreamConfig {
            id: handle.id,
            enabled: true,
            frame_len: FRAME_LEN,
            num_packets,
            packets_per_sec,
            protocols: build_stack(&iface.endpoint(), pattern, handle.tag),
        };
        engine.modify_streams(handle.port, &[config]).await?;
        debug!(
            interface = iface.name(),
            stream = %handle.id,
            tag = handle.tag,
            num_packets,
            packets_per_sec,
            "stream configured"
        );
        Ok(handle)
    }

    /// Delete every stream created since the last reset and restart the
    /// per-interface ids at 1. The tag counter is left alone.
    ///
    /// All interfaces are reset even if a delete fails; the first failure is
    /// returned.
    pub async fn reset_for_next_run<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        interfaces: &mut [Interface],
    ) -> Result<(), EngineError> {
        let mut first_err = None;
        for iface in interfaces.iter_mut() {
            if !iface.stream_ids.is_empty() {
                if let Err(e) = engine.delete_streams(iface.port(), &iface.stream_ids).await {
                    warn!(interface = iface.name(), error = %e, "failed to delete streams");
                    first_err.get_or_insert(e);
                }
            }
            iface.stream_ids.clear();
            iface.next_stream_id = 1;
        }
        self.run_tags.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
