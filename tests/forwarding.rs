//! End-to-end runs against the simulated engine and its learning bridge.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use bridgetest::capture;
use bridgetest::engine::sim::SimEngine;
use bridgetest::engine::{
    Engine, EngineError, PortConfig, PortId, PortStats, StreamConfig, StreamId, StreamStats,
};
use bridgetest::headers::frame;
use bridgetest::headers::MacAddr;
use bridgetest::traffic::{RunState, LEARNING_STEP};
use bridgetest::{InterfaceStats, Traffic, TrafficConfig, TrafficError};

const LANS: [&str; 4] = ["lan0", "lan1", "lan2", "lan3"];

fn config(dir: &Path) -> TrafficConfig {
    let mut cfg = TrafficConfig::default();
    cfg.run.poll_interval_ms = 1;
    cfg.run.capture_dir = dir.to_path_buf();
    cfg
}

async fn traffic(engine: SimEngine, dir: &Path) -> Traffic<SimEngine> {
    let mut t = Traffic::new(engine, &config(dir)).await.unwrap();
    for name in LANS {
        t.register(name).await.unwrap();
    }
    t
}

fn stats(tx: u64, rx: u64) -> InterfaceStats {
    InterfaceStats::new(tx, rx)
}

#[tokio::test]
async fn test_unicast_after_learning_reaches_only_destination() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;
    t.learning("unicast").await.unwrap();

    t.add_udp_stream("lan1", "lan3", 25, 100.0).await.unwrap();
    t.run("unicast", "measure").await.unwrap();

    assert_eq!(t.get_stats("lan1").unwrap(), stats(25, 0));
    assert_eq!(t.get_stats("lan3").unwrap(), stats(0, 25));
    assert_eq!(t.get_stats("lan0").unwrap(), stats(0, 0));
    assert_eq!(t.get_stats("lan2").unwrap(), stats(0, 0));
}

#[tokio::test]
async fn test_broadcast_reaches_every_other_port() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    t.add_broadcast_stream("lan2", 7, 10.0).await.unwrap();
    t.run("broadcast", "v4").await.unwrap();

    assert_eq!(t.get_stats("lan2").unwrap(), stats(7, 0));
    for other in ["lan0", "lan1", "lan3"] {
        assert_eq!(t.get_stats(other).unwrap(), stats(0, 7), "{}", other);
    }
}

#[tokio::test]
async fn test_ipv6_broadcast_and_multicast_flood() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    t.add_broadcast6_stream("lan0", 3, 10.0).await.unwrap();
    t.add_multicast_stream("lan1", IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)), 4, 10.0)
        .await
        .unwrap();
    t.add_multicast_stream("lan1", "ff0e::101".parse().unwrap(), 5, 10.0)
        .await
        .unwrap();
    t.run("flood", "mixed").await.unwrap();

    assert_eq!(t.get_stats("lan0").unwrap(), stats(3, 9));
    assert_eq!(t.get_stats("lan1").unwrap(), stats(9, 3));
    assert_eq!(t.get_stats("lan2").unwrap(), stats(0, 12));
    assert_eq!(t.get_stats("lan3").unwrap(), stats(0, 12));
}

#[tokio::test]
async fn test_tags_strictly_increase_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    let mut tags = Vec::new();
    for step in ["one", "two", "three"] {
        tags.push(t.add_udp_stream("lan0", "lan1", 1, 10.0).await.unwrap().tag);
        tags.push(t.add_broadcast_stream("lan2", 1, 10.0).await.unwrap().tag);
        t.run("tags", step).await.unwrap();
    }
    assert!(tags.windows(2).all(|w| w[0] < w[1]), "{:?}", tags);
}

#[tokio::test]
async fn test_run_resets_stream_ids_but_not_tags() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    let first = t.add_udp_stream("lan0", "lan1", 1, 10.0).await.unwrap();
    let second = t.add_udp_stream("lan0", "lan2", 1, 10.0).await.unwrap();
    assert_eq!((first.id, second.id), (StreamId(1), StreamId(2)));
    assert_eq!(t.resolve("lan0").unwrap().next_stream_id(), 3);

    let before = t.next_tag();
    t.run("reset", "one").await.unwrap();
    assert!(t.interfaces().iter().all(|i| i.next_stream_id() == 1));
    assert!(t.engine().stream_ids(PortId(0)).is_empty());
    assert_eq!(t.next_tag(), before);

    let again = t.add_udp_stream("lan0", "lan1", 1, 10.0).await.unwrap();
    assert_eq!(again.id, StreamId(1));
    assert!(again.tag >= before);
    assert!(t.next_tag() > before);
    assert_eq!(t.run_state(), RunState::Idle);
}

#[tokio::test]
async fn test_results_are_superseded_by_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    t.add_broadcast_stream("lan0", 5, 10.0).await.unwrap();
    t.run("supersede", "first").await.unwrap();
    assert_eq!(t.get_stats("lan1").unwrap(), stats(0, 5));

    t.add_broadcast_stream("lan3", 2, 10.0).await.unwrap();
    t.run("supersede", "second").await.unwrap();
    assert_eq!(t.get_stats("lan0").unwrap(), stats(0, 2));
    assert_eq!(t.get_stats("lan3").unwrap(), stats(2, 0));
    assert_eq!(t.last_result().unwrap().step_id, "second");
}

#[tokio::test]
async fn test_bridged_pair_with_isolated_ports() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SimEngine::new(&LANS)
        .with_bridges(&[vec!["lan0", "lan1"]])
        .unwrap();
    let mut t = traffic(engine, dir.path()).await;

    for dst in ["lan1", "lan2", "lan3"] {
        t.add_udp_stream("lan0", dst, 10, 10.0).await.unwrap();
    }
    t.run("bridge_membership", "unicast").await.unwrap();

    assert_eq!(t.get_stats("lan0").unwrap(), stats(30, 0));
    let lan1 = t.get_stats("lan1").unwrap();
    assert_eq!(lan1.tx_pkts, 0);
    // Nothing is learned yet, so lan1 also sees the flooded frames.
    assert!(lan1.rx_pkts >= 10);
    assert_eq!(t.get_stats("lan2").unwrap(), stats(0, 0));
    assert_eq!(t.get_stats("lan3").unwrap(), stats(0, 0));
    assert_eq!(t.port_stats("lan0").unwrap().tx_pkts, 30);
}

#[tokio::test]
async fn test_learning_runs_once_with_one_broadcast_per_interface() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    let result = t.learning("learn").await.unwrap();
    assert_eq!(result.step_id, LEARNING_STEP);
    assert_eq!(result.tags.len(), 4);

    assert_eq!(t.engine().transmit_starts(), 1);
    for name in LANS {
        assert_eq!(t.get_stats(name).unwrap(), stats(2, 6), "{}", name);
    }
    assert_eq!(t.interfaces().len(), 4);
    assert!(t.interfaces().iter().all(|i| i.next_stream_id() == 1));
    assert_eq!(t.engine().bridge().fdb().len(), 4);
}

#[tokio::test]
async fn test_capture_files_hold_received_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;
    t.learning("capture").await.unwrap();

    let handle = t.add_udp_stream("lan0", "lan1", 3, 10.0).await.unwrap();
    let result = t.run("capture", "unicast").await.unwrap();
    assert_eq!(result.captures.len(), 4);

    for name in LANS {
        assert!(dir.path().join(format!("capture-unicast-{}.pcap", name)).exists());
    }
    let bytes = std::fs::read(dir.path().join("capture-unicast-lan1.pcap")).unwrap();
    let frames = capture::decode(&bytes).unwrap();
    assert_eq!(frames.len(), 3);

    let f = &frames[0].data;
    assert_eq!(f.len(), 124);
    assert_eq!(frame::read_signature(f), Some(handle.tag));
    let (dst, src) = frame::mac_addrs(f).unwrap();
    assert_eq!(dst, t.interface_mac("lan1").unwrap());
    assert_eq!(src, t.interface_mac("lan0").unwrap());
    assert_eq!(&f[12..14], &[0x08, 0x00]);
    assert_eq!(&f[34..36], &[0x12, 0x34]);
    assert_eq!(&f[36..38], &[0x43, 0x21]);

    let idle = capture::decode(&std::fs::read(dir.path().join("capture-unicast-lan2.pcap")).unwrap()).unwrap();
    assert!(idle.is_empty());
}

#[tokio::test]
async fn test_igmp_report_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;

    let group = Ipv4Addr::new(239, 129, 0, 7);
    t.add_igmp_report_stream("lan3", group, 2, 1.0).await.unwrap();
    t.run("igmp", "report").await.unwrap();
    assert_eq!(t.get_stats("lan0").unwrap(), stats(0, 2));

    let bytes = std::fs::read(dir.path().join("igmp-report-lan0.pcap")).unwrap();
    let f = capture::decode(&bytes).unwrap().remove(0).data;
    assert_eq!(&f[0..6], &[0x01, 0x00, 0x5e, 0x01, 0x00, 0x07]);
    assert_eq!(f[23], 2);
    assert_eq!(frame::ipv4_dst(&f), Some(group));
    assert_eq!(f[34], 0x16);
    assert_eq!(&f[38..42], &group.octets());
}

#[tokio::test]
async fn test_mac_increment_cycles_source_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS).with_fdb_capacity(64), dir.path()).await;
    t.learning("mac_inc").await.unwrap();

    let base: MacAddr = "00:11:20:30:a9:66".parse().unwrap();
    t.add_mac_inc_stream("lan0", "lan1", base, 3, 7, 6, 100.0)
        .await
        .unwrap();
    t.run("mac_inc", "walk").await.unwrap();
    assert_eq!(t.get_stats("lan1").unwrap(), stats(0, 6));

    let bytes = std::fs::read(dir.path().join("mac_inc-walk-lan1.pcap")).unwrap();
    let sources: Vec<MacAddr> = capture::decode(&bytes)
        .unwrap()
        .iter()
        .filter_map(|r| frame::mac_addrs(&r.data).map(|(_, src)| src))
        .collect();
    let expected: Vec<MacAddr> = [0, 7, 14, 0, 7, 14].iter().map(|n| base.offset(*n)).collect();
    assert_eq!(sources, expected);

    let learned = t.engine().bridge().fdb();
    assert!(learned.contains(&(base.offset(14), PortId(0))));
}

#[tokio::test]
async fn test_stalled_engine_times_out_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.run.timeout_ms = Some(30);
    let mut t = Traffic::new(SimEngine::new(&LANS).stalled(), &cfg).await.unwrap();
    t.register("lan0").await.unwrap();
    t.register("lan1").await.unwrap();
    t.add_udp_stream("lan0", "lan1", 10, 10.0).await.unwrap();

    let err = t.run("stall", "never").await.unwrap_err();
    match err {
        TrafficError::RunTimeout { test_id, step_id, .. } => {
            assert_eq!((test_id.as_str(), step_id.as_str()), ("stall", "never"));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(t.engine().stream_ids(PortId(0)).is_empty());
    assert_eq!(t.resolve("lan0").unwrap().next_stream_id(), 1);
    assert_eq!(t.run_state(), RunState::Idle);
    assert!(matches!(t.get_stats("lan0"), Err(TrafficError::NoRunResult)));
}

#[tokio::test]
async fn test_failed_run_discards_previous_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.run.timeout_ms = Some(30);
    let mut t = Traffic::new(SimEngine::new(&LANS), &cfg).await.unwrap();
    t.register("lan0").await.unwrap();
    t.register("lan1").await.unwrap();

    t.add_broadcast_stream("lan0", 4, 10.0).await.unwrap();
    t.run("stale", "first").await.unwrap();
    assert_eq!(t.get_stats("lan1").unwrap(), stats(0, 4));

    t.engine_mut().set_stalled(true);
    t.add_broadcast_stream("lan0", 4, 10.0).await.unwrap();
    let err = t.run("stale", "second").await.unwrap_err();
    assert!(matches!(err, TrafficError::RunTimeout { .. }));

    assert!(t.last_result().is_none());
    assert!(matches!(t.get_stats("lan1"), Err(TrafficError::NoRunResult)));
}

/// Simulated engine whose stats queries fail while `failing` is set.
struct FailingStats {
    inner: SimEngine,
    failing: bool,
}

#[async_trait::async_trait]
impl Engine for FailingStats {
    async fn port_configs(&mut self) -> Result<Vec<PortConfig>, EngineError> {
        self.inner.port_configs().await
    }

    async fn set_stream_tracking(&mut self, port: PortId, enabled: bool) -> Result<(), EngineError> {
        self.inner.set_stream_tracking(port, enabled).await
    }

    async fn add_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError> {
        self.inner.add_streams(port, ids).await
    }

    async fn delete_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError> {
        self.inner.delete_streams(port, ids).await
    }

    async fn modify_streams(&mut self, port: PortId, streams: &[StreamConfig]) -> Result<(), EngineError> {
        self.inner.modify_streams(port, streams).await
    }

    async fn start_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.inner.start_capture(ports).await
    }

    async fn stop_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.inner.stop_capture(ports).await
    }

    async fn start_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.inner.start_transmit(ports).await
    }

    async fn stop_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.inner.stop_transmit(ports).await
    }

    async fn clear_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.inner.clear_stats(ports).await
    }

    async fn clear_stream_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.inner.clear_stream_stats(ports).await
    }

    async fn port_stats(&mut self, ports: &[PortId]) -> Result<Vec<PortStats>, EngineError> {
        if self.failing {
            return Err(EngineError::Remote {
                code: 500,
                message: "stats unavailable".to_string(),
            });
        }
        self.inner.port_stats(ports).await
    }

    async fn stream_stats(&mut self, ports: &[PortId]) -> Result<Vec<StreamStats>, EngineError> {
        self.inner.stream_stats(ports).await
    }

    async fn capture_buffer(&mut self, port: PortId) -> Result<Vec<u8>, EngineError> {
        self.inner.capture_buffer(port).await
    }
}

#[tokio::test]
async fn test_polling_failure_stops_transmit_and_capture() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FailingStats {
        inner: SimEngine::new(&LANS).stalled(),
        failing: true,
    };
    let mut t = Traffic::new(engine, &config(dir.path())).await.unwrap();
    t.register("lan0").await.unwrap();
    t.register("lan1").await.unwrap();
    t.add_udp_stream("lan0", "lan1", 10, 10.0).await.unwrap();

    let err = t.run("flaky", "poll").await.unwrap_err();
    assert!(matches!(
        err,
        TrafficError::Engine(EngineError::Remote { code: 500, .. })
    ));

    let sim = &mut t.engine_mut().inner;
    let after = sim.port_stats(&[PortId(0), PortId(1)]).await.unwrap();
    assert!(after.iter().all(|s| !s.transmit_active && !s.capture_active));
    assert!(sim.stream_ids(PortId(0)).is_empty());
    assert_eq!(t.run_state(), RunState::Idle);
}

#[tokio::test]
async fn test_slow_engine_is_polled_until_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS).with_transmit_polls(3), dir.path()).await;
    t.add_broadcast_stream("lan0", 1, 1.0).await.unwrap();
    t.run("slow", "poll").await.unwrap();
    assert_eq!(t.get_stats("lan1").unwrap(), stats(0, 1));
    assert!(!t.port_stats("lan0").unwrap().transmit_active);
}

#[tokio::test]
async fn test_unknown_names() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = traffic(SimEngine::new(&LANS), dir.path()).await;
    assert!(matches!(
        t.register("lan9").await,
        Err(TrafficError::UnknownInterface { .. })
    ));
    assert!(matches!(
        t.add_broadcast_stream("lan9", 1, 1.0).await,
        Err(TrafficError::NotRegistered { name }) if name == "lan9"
    ));
    assert_eq!(t.next_tag(), 0);
}
