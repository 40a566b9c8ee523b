use serde::{Deserialize, Serialize};
use tracing::warn;

use super::registry::Interface;
use super::run::RunResult;

/// Packets an interface sent and received in the last run, counted only
/// from streams issued for that run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
}

impl InterfaceStats {
    pub fn new(tx_pkts: u64, rx_pkts: u64) -> Self {
        Self { rx_pkts, tx_pkts }
    }
}

/// Sum the interface's per-tag buckets whose tag belongs to `result`'s run.
///
/// An interface with no matching bucket gets zeros: it neither sent nor
/// received any tagged traffic.
pub fn resolve(result: &RunResult, iface: &Interface) -> InterfaceStats {
    let Some(buckets) = result.streams.get(&iface.port()) else {
        warn!(interface = iface.name(), "no stream counters for port, reporting zero");
        return InterfaceStats::default();
    };

    let mut total = InterfaceStats::default();
    let mut matched = 0usize;
    for (tag, bucket) in buckets {
        if result.tags.contains_key(tag) {
            total.rx_pkts += bucket.rx_pkts;
            total.tx_pkts += bucket.tx_pkts;
            matched += 1;
        }
    }
    if matched == 0 {
        warn!(interface = iface.name(), "no bucket from this run, reporting zero");
    }
    total
}
