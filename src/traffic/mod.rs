//! Traffic generation and stream accounting.
//!
//! [`Traffic`] owns an engine connection and everything a test needs around
//! it: registered interfaces, the streams issued for the next run, and the
//! result of the last one. Typical use is register, add streams, run, then
//! read per-interface counters with [`Traffic::get_stats`].

pub mod lifecycle;
pub mod registry;
pub mod run;
pub mod stats;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TrafficConfig;
use crate::engine::{Engine, EngineError, PortStats};
use crate::headers::{IpVersion, MacAddr, StreamPattern};

pub use lifecycle::{Lifecycle, StreamHandle};
pub use registry::{Interface, Registry};
pub use run::{RunController, RunResult, RunState};
pub use stats::InterfaceStats;

/// Step id used by [`Traffic::learning`].
pub const LEARNING_STEP: &str = "learning";
const LEARNING_PACKETS: u64 = 2;
const LEARNING_PPS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("engine has no port named {name}")]
    UnknownInterface { name: String },

    #[error("interface {name} is not registered")]
    NotRegistered { name: String },

    #[error("no run has completed yet")]
    NoRunResult,

    #[error("correlation tags exhausted")]
    TagsExhausted,

    #[error("run {test_id}/{step_id} did not finish within {timeout:?}")]
    RunTimeout {
        test_id: String,
        step_id: String,
        timeout: Duration,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to write capture {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct Traffic<E> {
    engine: E,
    registry: Registry,
    lifecycle: Lifecycle,
    controller: RunController,
    last_result: Option<RunResult>,
}

impl<E: Engine> Traffic<E> {
    /// Take over `engine` and enumerate its ports.
    pub async fn new(mut engine: E, config: &TrafficConfig) -> Result<Self, TrafficError> {
        let ports = engine.port_configs().await?;
        info!(ports = ports.len(), "engine ports enumerated");
        Ok(Self {
            engine,
            registry: Registry::new(ports, config.addressing.clone()),
            lifecycle: Lifecycle::new(),
            controller: RunController::new(&config.run),
            last_result: None,
        })
    }

    /// Run `f` against a fresh session and close it afterwards, whether `f`
    /// succeeded or not.
    pub async fn session<T, F>(engine: E, config: &TrafficConfig, f: F) -> Result<T, TrafficError>
    where
        E: 'static,
        F: for<'a> FnOnce(&'a mut Traffic<E>) -> BoxFuture<'a, Result<T, TrafficError>>,
    {
        let mut traffic = Traffic::new(engine, config).await?;
        let outcome = f(&mut traffic).await;
        let closed = traffic.close().await;
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "session close failed after error");
                }
                Err(e)
            }
        }
    }

    /// Delete any streams still on the engine and close the connection.
    pub async fn close(&mut self) -> Result<(), TrafficError> {
        let reset = self
            .lifecycle
            .reset_for_next_run(&mut self.engine, self.registry.interfaces_mut())
            .await;
        self.engine.close().await?;
        info!("traffic session closed");
        reset?;
        Ok(())
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    // -----------------------------------------------------------------------
    // Interfaces
    // -----------------------------------------------------------------------

    /// Every port name the engine offers, registered or not.
    pub fn interface_names(&self) -> Vec<&str> {
        self.registry.port_names()
    }

    /// Register the engine port called `name` and enable per-stream
    /// counters on it.
    pub async fn register(&mut self, name: &str) -> Result<&Interface, TrafficError> {
        let (port, new) = self.registry.register(name)?;
        if new {
            self.engine.set_stream_tracking(port, true).await?;
            info!(%name, %port, "interface registered");
        }
        self.registry.resolve(name)
    }

    pub fn resolve(&self, name: &str) -> Result<&Interface, TrafficError> {
        self.registry.resolve(name)
    }

    pub fn interface_mac(&self, name: &str) -> Result<MacAddr, TrafficError> {
        Ok(self.registry.resolve(name)?.mac())
    }

    pub fn interfaces(&self) -> &[Interface] {
        self.registry.interfaces()
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Tag the next stream will carry.
    pub fn next_tag(&self) -> u32 {
        self.lifecycle.next_tag()
    }

    /// Add a stream sent from `src` following `pattern`.
    pub async fn add_stream(
        &mut self,
        src: &str,
        pattern: StreamPattern,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        let iface = self.registry.resolve_mut(src)?;
        let handle = self
            .lifecycle
            .add_stream(&mut self.engine, iface, &pattern, num_packets, packets_per_sec)
            .await?;
        Ok(handle)
    }

    /// Unicast IPv4 UDP from `src` to `dst`.
    pub async fn add_udp_stream(
        &mut self,
        src: &str,
        dst: &str,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        self.add_unicast(src, dst, IpVersion::V4, num_packets, packets_per_sec)
            .await
    }

    /// Unicast IPv6 UDP from `src` to `dst`.
    pub async fn add_udp6_stream(
        &mut self,
        src: &str,
        dst: &str,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        self.add_unicast(src, dst, IpVersion::V6, num_packets, packets_per_sec)
            .await
    }

    async fn add_unicast(
        &mut self,
        src: &str,
        dst: &str,
        ip: IpVersion,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        let dst = self.registry.resolve(dst)?.endpoint();
        self.add_stream(src, StreamPattern::Unicast { dst, ip }, num_packets, packets_per_sec)
            .await
    }

    /// Ethernet broadcast carrying IPv4 UDP to the configured broadcast
    /// address.
    pub async fn add_broadcast_stream(
        &mut self,
        src: &str,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        self.add_broadcast(src, IpVersion::V4, num_packets, packets_per_sec)
            .await
    }

    /// Ethernet broadcast carrying IPv6 UDP to all-nodes.
    pub async fn add_broadcast6_stream(
        &mut self,
        src: &str,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        self.add_broadcast(src, IpVersion::V6, num_packets, packets_per_sec)
            .await
    }

    async fn add_broadcast(
        &mut self,
        src: &str,
        ip: IpVersion,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        let broadcast_v4 = self.registry.addressing().broadcast_ipv4;
        self.add_stream(
            src,
            StreamPattern::Broadcast { broadcast_v4, ip },
            num_packets,
            packets_per_sec,
        )
        .await
    }

    /// UDP to a multicast group, IPv4 or IPv6.
    pub async fn add_multicast_stream(
        &mut self,
        src: &str,
        group: IpAddr,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        self.add_stream(src, StreamPattern::Multicast { group }, num_packets, packets_per_sec)
            .await
    }

    /// Unicast UDP from `src` to `dst` whose source MAC cycles through
    /// `count` addresses starting at `base`, `step` apart.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_mac_inc_stream(
        &mut self,
        src: &str,
        dst: &str,
        base: MacAddr,
        count: u32,
        step: u32,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        let dst = self.registry.resolve(dst)?.endpoint();
        self.add_stream(
            src,
            StreamPattern::MacIncrement {
                dst,
                base,
                count,
                step,
            },
            num_packets,
            packets_per_sec,
        )
        .await
    }

    /// IGMPv2 membership reports for `group`.
    pub async fn add_igmp_report_stream(
        &mut self,
        src: &str,
        group: Ipv4Addr,
        num_packets: u64,
        packets_per_sec: f64,
    ) -> Result<StreamHandle, TrafficError> {
        self.add_stream(src, StreamPattern::IgmpReport { group }, num_packets, packets_per_sec)
            .await
    }

    // -----------------------------------------------------------------------
    // Runs and results
    // -----------------------------------------------------------------------

    pub fn run_state(&self) -> RunState {
        self.controller.state()
    }

    /// Send every stream added since the last run and collect the counters.
    /// Captures land in `{capture_dir}/{test_id}-{step_id}-{interface}.pcap`.
    /// On failure no result is kept, so [`Traffic::get_stats`] reports
    /// [`TrafficError::NoRunResult`] until the next successful run.
    pub async fn run(&mut self, test_id: &str, step_id: &str) -> Result<&RunResult, TrafficError> {
        self.last_result = None;
        let result = self
            .controller
            .execute(
                &mut self.engine,
                &mut self.registry,
                &mut self.lifecycle,
                test_id,
                step_id,
            )
            .await?;
        Ok(self.last_result.insert(result))
    }

    /// Send two broadcast frames from every registered interface so the
    /// device under test learns where each address lives.
    pub async fn learning(&mut self, test_id: &str) -> Result<&RunResult, TrafficError> {
        let names: Vec<String> = self
            .registry
            .interfaces()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        info!(%test_id, interfaces = names.len(), "learning run");
        for name in &names {
            self.add_broadcast_stream(name, LEARNING_PACKETS, LEARNING_PPS)
                .await?;
        }
        self.run(test_id, LEARNING_STEP).await
    }

    pub fn last_result(&self) -> Option<&RunResult> {
        self.last_result.as_ref()
    }

    /// Packets `name` sent and received in the last run.
    pub fn get_stats(&self, name: &str) -> Result<InterfaceStats, TrafficError> {
        let iface = self.registry.resolve(name)?;
        let result = self.last_result.as_ref().ok_or(TrafficError::NoRunResult)?;
        Ok(stats::resolve(result, iface))
    }

    /// Aggregate port counters of `name` from the last run.
    pub fn port_stats(&self, name: &str) -> Result<PortStats, TrafficError> {
        let iface = self.registry.resolve(name)?;
        let result = self.last_result.as_ref().ok_or(TrafficError::NoRunResult)?;
        Ok(result.ports.get(&iface.port()).cloned().unwrap_or_else(|| PortStats {
            port: iface.port(),
            ..PortStats::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::engine::{PortId, StreamId};

    fn config(dir: &std::path::Path) -> TrafficConfig {
        let mut cfg = TrafficConfig::default();
        cfg.run.poll_interval_ms = 1;
        cfg.run.capture_dir = dir.to_path_buf();
        cfg
    }

    #[tokio::test]
    async fn test_register_enables_tracking_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Traffic::new(SimEngine::new(&["a", "b"]), &config(dir.path()))
            .await
            .unwrap();
        assert_eq!(t.interface_names(), vec!["a", "b"]);
        let port = t.register("b").await.unwrap().port();
        assert_eq!(port, PortId(1));
        t.register("b").await.unwrap();
        assert_eq!(t.interfaces().len(), 1);
        assert_eq!(t.interface_mac("b").unwrap().to_string(), "00:10:20:30:40:01");

        let ports = t.engine_mut().port_configs().await.unwrap();
        assert!(ports[1].track_stream_stats);
        assert!(!ports[0].track_stream_stats);
    }

    #[tokio::test]
    async fn test_stats_before_any_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Traffic::new(SimEngine::new(&["a"]), &config(dir.path()))
            .await
            .unwrap();
        t.register("a").await.unwrap();
        assert!(matches!(t.get_stats("a"), Err(TrafficError::NoRunResult)));
        assert!(matches!(t.get_stats("zz"), Err(TrafficError::NotRegistered { .. })));
        assert!(matches!(
            t.add_udp_stream("a", "zz", 1, 1.0).await,
            Err(TrafficError::NotRegistered { .. })
        ));
        assert_eq!(t.next_tag(), 0);
    }

    #[tokio::test]
    async fn test_close_removes_pending_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Traffic::new(SimEngine::new(&["a", "b"]), &config(dir.path()))
            .await
            .unwrap();
        t.register("a").await.unwrap();
        t.register("b").await.unwrap();
        t.add_udp_stream("a", "b", 3, 10.0).await.unwrap();
        assert_eq!(t.engine().stream_ids(PortId(0)), vec![StreamId(1)]);
        t.close().await.unwrap();
        assert!(t.engine().stream_ids(PortId(0)).is_empty());
    }

    #[tokio::test]
    async fn test_session_closes_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Traffic::session(SimEngine::new(&["a"]), &config(dir.path()), |t| {
            Box::pin(async move {
                t.register("a").await?;
                t.add_broadcast_stream("a", 1, 1.0).await?;
                t.register("nope").await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TrafficError::UnknownInterface { name } if name == "nope"));
    }
}
