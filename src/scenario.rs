//! Scenario files: a TOML description of interfaces and the streams to send
//! in each step.
//!
//! ```toml
//! test_id = "bridge_unicast"
//! interfaces = ["lan0", "lan1", "lan2", "lan3"]
//! learning = true
//! bridges = [["lan0", "lan1"]]
//!
//! [[step]]
//! id = "unicast"
//!
//! [[step.stream]]
//! kind = "unicast"
//! src = "lan0"
//! dst = "lan1"
//! packets = 10
//! rate = 10.0
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::Engine;
use crate::headers::{IpVersion, MacAddr};
use crate::traffic::{InterfaceStats, StreamHandle, Traffic, TrafficError, LEARNING_STEP};

fn default_step() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub test_id: String,
    pub interfaces: Vec<String>,
    /// Run a learning step before the first step.
    #[serde(default)]
    pub learning: bool,
    /// Bridge membership for the simulated engine. Ignored by real engines.
    #[serde(default)]
    pub bridges: Vec<Vec<String>>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, rename = "stream")]
    pub streams: Vec<StreamSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamSpec {
    Unicast {
        src: String,
        dst: String,
        #[serde(default)]
        ip: IpVersion,
        packets: u64,
        rate: f64,
    },
    Broadcast {
        src: String,
        #[serde(default)]
        ip: IpVersion,
        packets: u64,
        rate: f64,
    },
    Multicast {
        src: String,
        group: IpAddr,
        packets: u64,
        rate: f64,
    },
    MacIncrement {
        src: String,
        dst: String,
        base: MacAddr,
        count: u32,
        #[serde(default = "default_step")]
        step: u32,
        packets: u64,
        rate: f64,
    },
    IgmpReport {
        src: String,
        group: Ipv4Addr,
        packets: u64,
        rate: f64,
    },
}

impl StreamSpec {
    /// Interfaces this stream references.
    fn interfaces(&self) -> Vec<&str> {
        match self {
            StreamSpec::Unicast { src, dst, .. } | StreamSpec::MacIncrement { src, dst, .. } => {
                vec![src.as_str(), dst.as_str()]
            }
            StreamSpec::Broadcast { src, .. }
            | StreamSpec::Multicast { src, .. }
            | StreamSpec::IgmpReport { src, .. } => vec![src.as_str()],
        }
    }

    pub async fn apply<E: Engine>(&self, traffic: &mut Traffic<E>) -> Result<StreamHandle, TrafficError> {
        match self {
            StreamSpec::Unicast {
                src,
                dst,
                ip: IpVersion::V4,
                packets,
                rate,
            } => traffic.add_udp_stream(src, dst, *packets, *rate).await,
            StreamSpec::Unicast {
                src,
                dst,
                ip: IpVersion::V6,
                packets,
                rate,
            } => traffic.add_udp6_stream(src, dst, *packets, *rate).await,
            StreamSpec::Broadcast {
                src,
                ip: IpVersion::V4,
                packets,
                rate,
            } => traffic.add_broadcast_stream(src, *packets, *rate).await,
            StreamSpec::Broadcast {
                src,
                ip: IpVersion::V6,
                packets,
                rate,
            } => traffic.add_broadcast6_stream(src, *packets, *rate).await,
            StreamSpec::Multicast {
                src,
                group,
                packets,
                rate,
            } => traffic.add_multicast_stream(src, *group, *packets, *rate).await,
            StreamSpec::MacIncrement {
                src,
                dst,
                base,
                count,
                step,
                packets,
                rate,
            } => {
                traffic
                    .add_mac_inc_stream(src, dst, *base, *count, *step, *packets, *rate)
                    .await
            }
            StreamSpec::IgmpReport {
                src,
                group,
                packets,
                rate,
            } => traffic.add_igmp_report_stream(src, *group, *packets, *rate).await,
        }
    }
}

/// Per-interface counters of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub interfaces: BTreeMap<String, InterfaceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub test_id: String,
    pub steps: Vec<StepReport>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid scenario: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            bail!("scenario {} lists no interfaces", self.test_id);
        }
        let known: HashSet<&str> = self.interfaces.iter().map(String::as_str).collect();
        for group in &self.bridges {
            if let Some(name) = group.iter().find(|n| !known.contains(n.as_str())) {
                bail!("bridge member {} is not a scenario interface", name);
            }
        }
        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if step.id == LEARNING_STEP {
                bail!("step id {} is reserved for the learning run", LEARNING_STEP);
            }
            if !step_ids.insert(step.id.as_str()) {
                bail!("duplicate step id {}", step.id);
            }
            for stream in &step.streams {
                if let Some(name) = stream.interfaces().into_iter().find(|n| !known.contains(n)) {
                    bail!("step {} uses interface {} which is not listed", step.id, name);
                }
            }
        }
        Ok(())
    }

    /// Register the interfaces, optionally learn, then run every step.
    pub async fn execute<E: Engine>(&self, traffic: &mut Traffic<E>) -> Result<ScenarioReport, TrafficError> {
        for name in &self.interfaces {
            traffic.register(name).await?;
        }
        if self.learning {
            traffic.learning(&self.test_id).await?;
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            for stream in &step.streams {
                stream.apply(traffic).await?;
            }
            traffic.run(&self.test_id, &step.id).await?;

            let mut interfaces = BTreeMap::new();
            for name in &self.interfaces {
                interfaces.insert(name.clone(), traffic.get_stats(name)?);
            }
            info!(test_id = %self.test_id, step_id = %step.id, "step finished");
            steps.push(StepReport {
                step_id: step.id.clone(),
                interfaces,
            });
        }
        Ok(ScenarioReport {
            test_id: self.test_id.clone(),
            steps,
        })
    }
}
