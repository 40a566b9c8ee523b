//! In-process engine with a simulated learning bridge in front of its ports.
//!
//! Frames are rendered from the configured header stacks, switched by
//! [`SimBridge`], and counted on every port they reach. Per-stream counters
//! are keyed by the tag read back from each frame's signature, the same way
//! a hardware generator recovers it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Engine, EngineError, PortConfig, PortId, PortStats, StreamConfig, StreamId, StreamStats};
use crate::capture::{self, CaptureRecord};
use crate::headers::frame;
use crate::headers::MacAddr;

// ---------------------------------------------------------------------------
// SimBridge
// ---------------------------------------------------------------------------

/// Forwarding model of the device under test.
///
/// Ports are grouped into bridges; a frame never leaves the bridge it
/// entered, and a port in no bridge drops everything it receives.
#[derive(Debug, Default)]
pub struct SimBridge {
    groups: Vec<BTreeSet<PortId>>,
    fdb: HashMap<MacAddr, PortId>,
    fdb_capacity: Option<usize>,
}

impl SimBridge {
    pub fn new(groups: Vec<BTreeSet<PortId>>) -> Self {
        Self {
            groups,
            ..Self::default()
        }
    }

    /// Ports a frame arriving on `ingress` is switched to.
    pub fn forward(&mut self, ingress: PortId, dst: MacAddr, src: MacAddr) -> Vec<PortId> {
        let Some(group) = self.groups.iter().find(|g| g.contains(&ingress)) else {
            return Vec::new();
        };
        let flood: Vec<PortId> = group.iter().copied().filter(|p| *p != ingress).collect();

        let egress = if dst.is_multicast() {
            flood
        } else {
            match self.fdb.get(&dst) {
                Some(&port) if port == ingress => Vec::new(),
                Some(&port) if group.contains(&port) => vec![port],
                _ => flood,
            }
        };
        self.learn(src, ingress);
        egress
    }

    fn learn(&mut self, src: MacAddr, port: PortId) {
        if src.is_multicast() {
            return;
        }
        if let Some(entry) = self.fdb.get_mut(&src) {
            *entry = port;
            return;
        }
        if self.fdb_capacity.map_or(true, |cap| self.fdb.len() < cap) {
            self.fdb.insert(src, port);
        } else {
            debug!(mac = %src, "forwarding database full");
        }
    }

    /// Learned addresses, sorted.
    pub fn fdb(&self) -> Vec<(MacAddr, PortId)> {
        let mut entries: Vec<_> = self.fdb.iter().map(|(m, p)| (*m, *p)).collect();
        entries.sort();
        entries
    }
}

// ---------------------------------------------------------------------------
// SimEngine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SimPort {
    config: PortConfig,
    /// Added streams; `None` until the first modify.
    streams: BTreeMap<StreamId, Option<StreamConfig>>,
    stats: PortStats,
    stream_stats: BTreeMap<u32, StreamStats>,
    capturing: bool,
    capture: Vec<CaptureRecord>,
    transmitting: bool,
    polls_remaining: u32,
}

impl SimPort {
    fn new(id: PortId, name: &str) -> Self {
        Self {
            config: PortConfig {
                id,
                name: name.to_string(),
                description: "simulated port".to_string(),
                track_stream_stats: false,
            },
            streams: BTreeMap::new(),
            stats: PortStats {
                port: id,
                ..PortStats::default()
            },
            stream_stats: BTreeMap::new(),
            capturing: false,
            capture: Vec::new(),
            transmitting: false,
            polls_remaining: 0,
        }
    }

    fn stream_bucket(&mut self, tag: u32) -> &mut StreamStats {
        let port = self.config.id;
        self.stream_stats.entry(tag).or_insert(StreamStats {
            port,
            tag,
            ..StreamStats::default()
        })
    }

    fn finish_transmit(&mut self) {
        self.transmitting = false;
        self.stats.tx_pps = 0;
        self.stats.tx_bps = 0;
        self.stats.rx_pps = 0;
        self.stats.rx_bps = 0;
    }
}

struct Emitted {
    port: PortId,
    data: Vec<u8>,
    wire_len: u64,
    timestamp: Duration,
}

/// Simulated engine; see the module docs.
#[derive(Debug)]
pub struct SimEngine {
    ports: BTreeMap<PortId, SimPort>,
    bridge: SimBridge,
    transmit_polls: u32,
    stalled: bool,
    transmit_starts: u32,
}

impl SimEngine {
    /// Ports named `names`, numbered from 0, all members of one bridge.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let ports: BTreeMap<PortId, SimPort> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = PortId(i as u32);
                (id, SimPort::new(id, name.as_ref()))
            })
            .collect();
        let all = ports.keys().copied().collect();
        Self {
            ports,
            bridge: SimBridge::new(vec![all]),
            transmit_polls: 1,
            stalled: false,
            transmit_starts: 0,
        }
    }

    /// Replace bridge membership. Ports left out of every group are isolated.
    pub fn with_bridges<S: AsRef<str>>(mut self, groups: &[Vec<S>]) -> Result<Self, EngineError> {
        let mut resolved = Vec::with_capacity(groups.len());
        for group in groups {
            let mut members = BTreeSet::new();
            for name in group {
                let id = self
                    .port_id(name.as_ref())
                    .ok_or_else(|| EngineError::UnknownPortName(name.as_ref().to_string()))?;
                members.insert(id);
            }
            resolved.push(members);
        }
        self.bridge = SimBridge::new(resolved);
        Ok(self)
    }

    pub fn with_fdb_capacity(mut self, capacity: usize) -> Self {
        self.bridge.fdb_capacity = Some(capacity);
        self
    }

    /// Number of stats polls that still report transmit active after a start.
    pub fn with_transmit_polls(mut self, polls: u32) -> Self {
        self.transmit_polls = polls;
        self
    }

    /// Never report transmit as finished.
    pub fn stalled(mut self) -> Self {
        self.set_stalled(true);
        self
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn port_id(&self, name: &str) -> Option<PortId> {
        self.ports
            .values()
            .find(|p| p.config.name == name)
            .map(|p| p.config.id)
    }

    pub fn bridge(&self) -> &SimBridge {
        &self.bridge
    }

    /// Streams currently present on a port, configured or not.
    pub fn stream_ids(&self, port: PortId) -> Vec<StreamId> {
        self.ports
            .get(&port)
            .map(|p| p.streams.keys().copied().collect())
            .unwrap_or_default()
    }

    /// How many times transmit has been started.
    pub fn transmit_starts(&self) -> u32 {
        self.transmit_starts
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut SimPort, EngineError> {
        self.ports.get_mut(&id).ok_or(EngineError::UnknownPort(id))
    }

    fn check_ports(&self, ports: &[PortId]) -> Result<(), EngineError> {
        match ports.iter().find(|p| !self.ports.contains_key(p)) {
            Some(p) => Err(EngineError::UnknownPort(*p)),
            None => Ok(()),
        }
    }

    /// Render every frame the given ports will send, in transmit order.
    fn render_all(&self, ports: &[PortId], start: Duration) -> Result<Vec<Emitted>, EngineError> {
        let mut out = Vec::new();
        for id in ports {
            let port = &self.ports[id];
            for cfg in port.streams.values().flatten().filter(|s| s.enabled) {
                for seq in 0..cfg.num_packets {
                    let data = frame::render(&cfg.protocols, cfg.frame_len, seq).map_err(|e| {
                        EngineError::InvalidStream {
                            port: *id,
                            stream: cfg.id,
                            reason: e.to_string(),
                        }
                    })?;
                    out.push(Emitted {
                        port: *id,
                        data,
                        wire_len: u64::from(cfg.frame_len),
                        timestamp: start.saturating_add(frame_offset(seq, cfg.packets_per_sec)),
                    });
                }
            }
        }
        Ok(out)
    }

    fn deliver(&mut self, emitted: Emitted) {
        let tag = frame::read_signature(&emitted.data);

        if let Some(tx) = self.ports.get_mut(&emitted.port) {
            tx.stats.tx_pkts += 1;
            tx.stats.tx_bytes += emitted.wire_len;
            if let (Some(tag), true) = (tag, tx.config.track_stream_stats) {
                let bucket = tx.stream_bucket(tag);
                bucket.tx_pkts += 1;
                bucket.tx_bytes += emitted.wire_len;
            }
        }

        let Some((dst, src)) = frame::mac_addrs(&emitted.data) else {
            return;
        };
        for egress in self.bridge.forward(emitted.port, dst, src) {
            let Some(rx) = self.ports.get_mut(&egress) else {
                continue;
            };
            rx.stats.rx_pkts += 1;
            rx.stats.rx_bytes += emitted.wire_len;
            if let (Some(tag), true) = (tag, rx.config.track_stream_stats) {
                let bucket = rx.stream_bucket(tag);
                bucket.rx_pkts += 1;
                bucket.rx_bytes += emitted.wire_len;
            }
            if rx.capturing {
                rx.capture.push(CaptureRecord {
                    timestamp: emitted.timestamp,
                    data: emitted.data.clone(),
                });
            }
        }
    }
}

/// Send time of frame `seq` relative to the start. Saturates for rates so
/// low the offset does not fit a `Duration`.
fn frame_offset(seq: u64, packets_per_sec: f64) -> Duration {
    if packets_per_sec > 0.0 {
        Duration::try_from_secs_f64(seq as f64 / packets_per_sec).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

fn now_since_epoch() -> Duration {
    let now = chrono::Utc::now();
    Duration::new(now.timestamp().max(0) as u64, now.timestamp_subsec_nanos())
}

#[async_trait::async_trait]
impl Engine for SimEngine {
    async fn port_configs(&mut self) -> Result<Vec<PortConfig>, EngineError> {
        Ok(self.ports.values().map(|p| p.config.clone()).collect())
    }

    async fn set_stream_tracking(&mut self, port: PortId, enabled: bool) -> Result<(), EngineError> {
        self.port_mut(port)?.config.track_stream_stats = enabled;
        Ok(())
    }

    async fn add_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError> {
        let p = self.port_mut(port)?;
        for id in ids {
            if p.streams.insert(*id, None).is_some() {
                warn!(%port, stream = %id, "stream re-added; previous configuration dropped");
            }
        }
        Ok(())
    }

    async fn delete_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError> {
        let p = self.port_mut(port)?;
        if let Some(missing) = ids.iter().find(|id| !p.streams.contains_key(id)) {
            return Err(EngineError::UnknownStream {
                port,
                stream: *missing,
            });
        }
        for id in ids {
            p.streams.remove(id);
        }
        Ok(())
    }

    async fn modify_streams(&mut self, port: PortId, streams: &[StreamConfig]) -> Result<(), EngineError> {
        let p = self.port_mut(port)?;
        for cfg in streams {
            let Some(slot) = p.streams.get_mut(&cfg.id) else {
                return Err(EngineError::UnknownStream {
                    port,
                    stream: cfg.id,
                });
            };
            frame::render(&cfg.protocols, cfg.frame_len, 0).map_err(|e| EngineError::InvalidStream {
                port,
                stream: cfg.id,
                reason: e.to_string(),
            })?;
            *slot = Some(cfg.clone());
        }
        Ok(())
    }

    async fn start_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.check_ports(ports)?;
        for id in ports {
            let p = self.port_mut(*id)?;
            p.capture.clear();
            p.capturing = true;
        }
        Ok(())
    }

    async fn stop_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.check_ports(ports)?;
        for id in ports {
            self.port_mut(*id)?.capturing = false;
        }
        Ok(())
    }

    async fn start_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.check_ports(ports)?;
        self.transmit_starts += 1;
        let frames = self.render_all(ports, now_since_epoch())?;
        info!(ports = ports.len(), frames = frames.len(), "simulated transmit started");

        for id in ports {
            let polls = self.transmit_polls;
            let p = self.port_mut(*id)?;
            let (pps, bits): (f64, f64) = p
                .streams
                .values()
                .flatten()
                .filter(|s| s.enabled)
                .fold((0.0, 0.0), |(pps, bits), s| {
                    (pps + s.packets_per_sec, bits + s.packets_per_sec * f64::from(s.frame_len) * 8.0)
                });
            p.stats.tx_pps = pps as u64;
            p.stats.tx_bps = bits as u64;
            p.transmitting = true;
            p.polls_remaining = polls;
        }
        for f in frames {
            self.deliver(f);
        }
        Ok(())
    }

    async fn stop_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.check_ports(ports)?;
        for id in ports {
            self.port_mut(*id)?.finish_transmit();
        }
        Ok(())
    }

    async fn clear_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.check_ports(ports)?;
        for id in ports {
            self.port_mut(*id)?.stats = PortStats {
                port: *id,
                ..PortStats::default()
            };
        }
        Ok(())
    }

    async fn clear_stream_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.check_ports(ports)?;
        for id in ports {
            self.port_mut(*id)?.stream_stats.clear();
        }
        Ok(())
    }

    async fn port_stats(&mut self, ports: &[PortId]) -> Result<Vec<PortStats>, EngineError> {
        self.check_ports(ports)?;
        let stalled = self.stalled;
        let mut out = Vec::with_capacity(ports.len());
        for id in ports {
            let p = self.port_mut(*id)?;
            if p.transmitting && !stalled {
                if p.polls_remaining == 0 {
                    p.finish_transmit();
                } else {
                    p.polls_remaining -= 1;
                }
            }
            let mut stats = p.stats.clone();
            stats.transmit_active = p.transmitting;
            stats.capture_active = p.capturing;
            out.push(stats);
        }
        Ok(out)
    }

    async fn stream_stats(&mut self, ports: &[PortId]) -> Result<Vec<StreamStats>, EngineError> {
        self.check_ports(ports)?;
        Ok(ports
            .iter()
            .flat_map(|id| self.ports[id].stream_stats.values().copied())
            .collect())
    }

    async fn capture_buffer(&mut self, port: PortId) -> Result<Vec<u8>, EngineError> {
        let p = self.port_mut(port)?;
        Ok(capture::encode(&p.capture))
    }
}
