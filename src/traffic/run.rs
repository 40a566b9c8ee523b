//! One run: clear counters, capture and transmit, wait for the generator to
//! go idle, collect results, then reset the streams for the next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::lifecycle::Lifecycle;
use super::registry::Registry;
use super::TrafficError;
use crate::config::RunConfig;
use crate::engine::{Engine, EngineError, PortId, PortStats, StreamStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    CapturingAndTransmitting,
    Polling,
    Stopped,
    ResultsReady,
}

/// Everything collected by one run. Replaced wholesale by the next run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub test_id: String,
    pub step_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Aggregate counters per port.
    pub ports: BTreeMap<PortId, PortStats>,
    /// Per-tag counters per port.
    pub streams: BTreeMap<PortId, BTreeMap<u32, StreamStats>>,
    /// Tags issued for this run and the interface that sent each.
    pub tags: BTreeMap<u32, String>,
    pub captures: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunController {
    state: RunState,
    poll_interval: Duration,
    timeout: Option<Duration>,
    capture_dir: PathBuf,
}

impl RunController {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            state: RunState::Idle,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            capture_dir: config.capture_dir.clone(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    fn enter(&mut self, state: RunState) {
        debug!(from = ?self.state, to = ?state, "run state");
        self.state = state;
    }

    /// Execute one run. Streams are reset on every exit path.
    pub async fn execute<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        registry: &mut Registry,
        lifecycle: &mut Lifecycle,
        test_id: &str,
        step_id: &str,
    ) -> Result<RunResult, TrafficError> {
        let outcome = self.drive(engine, registry, lifecycle, test_id, step_id).await;
        let reset = lifecycle
            .reset_for_next_run(engine, registry.interfaces_mut())
            .await;
        self.enter(RunState::Idle);

        match (outcome, reset) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(reset_err)) => {
                warn!(error = %reset_err, "stream reset after failed run also failed");
                Err(e)
            }
        }
    }

    async fn drive<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        registry: &Registry,
        lifecycle: &Lifecycle,
        test_id: &str,
        step_id: &str,
    ) -> Result<RunResult, TrafficError> {
        let tx_ports = registry.tx_ports().to_vec();
        let rx_ports = registry.rx_ports().to_vec();
        let all_ports = union(&tx_ports, &rx_ports);
        let started_at = Utc::now();
        info!(
            %test_id,
            %step_id,
            tx_ports = tx_ports.len(),
            rx_ports = rx_ports.len(),
            streams = lifecycle.run_tags().len(),
            "run starting"
        );

        engine.clear_stats(&all_ports).await?;
        engine.clear_stream_stats(&all_ports).await?;
        engine.start_capture(&rx_ports).await?;
        if let Err(e) = engine.start_transmit(&tx_ports).await {
            halt(engine, &tx_ports, &rx_ports).await;
            return Err(e.into());
        }
        self.enter(RunState::CapturingAndTransmitting);

        self.enter(RunState::Polling);
        let polling = poll_until_idle(engine, &tx_ports, self.poll_interval);
        let polled = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, polling).await {
                Ok(polled) => polled.map_err(TrafficError::from),
                Err(_) => {
                    warn!(%test_id, %step_id, timeout = ?limit, "transmit did not finish in time");
                    Err(TrafficError::RunTimeout {
                        test_id: test_id.to_string(),
                        step_id: step_id.to_string(),
                        timeout: limit,
                    })
                }
            },
            None => polling.await.map_err(TrafficError::from),
        };
        if let Err(e) = polled {
            halt(engine, &tx_ports, &rx_ports).await;
            self.enter(RunState::Stopped);
            return Err(e);
        }

        if let Err(e) = engine.stop_transmit(&tx_ports).await {
            halt(engine, &tx_ports, &rx_ports).await;
            return Err(e.into());
        }
        engine.stop_capture(&rx_ports).await?;
        self.enter(RunState::Stopped);

        let ports = engine
            .port_stats(&all_ports)
            .await?
            .into_iter()
            .map(|s| (s.port, s))
            .collect();
        let mut streams: BTreeMap<PortId, BTreeMap<u32, StreamStats>> = BTreeMap::new();
        for s in engine.stream_stats(&all_ports).await? {
            streams.entry(s.port).or_default().insert(s.tag, s);
        }

        let mut captures = Vec::with_capacity(registry.interfaces().len());
        for iface in registry.interfaces() {
            let data = engine.capture_buffer(iface.port()).await?;
            let path = self
                .capture_dir
                .join(format!("{}-{}-{}.pcap", test_id, step_id, iface.name()));
            write_capture(&path, &data).await?;
            debug!(interface = iface.name(), path = %path.display(), bytes = data.len(), "capture saved");
            captures.push(path);
        }

        self.enter(RunState::ResultsReady);
        let result = RunResult {
            test_id: test_id.to_string(),
            step_id: step_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            ports,
            streams,
            tags: lifecycle.run_tags().clone(),
            captures,
        };
        info!(
            %test_id,
            %step_id,
            elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
            "run complete"
        );
        Ok(result)
    }
}

/// Best-effort stop of transmit and capture once a run has failed.
async fn halt<E: Engine + ?Sized>(engine: &mut E, tx_ports: &[PortId], rx_ports: &[PortId]) {
    if let Err(e) = engine.stop_transmit(tx_ports).await {
        warn!(error = %e, "failed to stop transmit after failed run");
    }
    if let Err(e) = engine.stop_capture(rx_ports).await {
        warn!(error = %e, "failed to stop capture after failed run");
    }
}

/// Poll aggregate stats until no transmit port is active.
async fn poll_until_idle<E: Engine + ?Sized>(
    engine: &mut E,
    tx_ports: &[PortId],
    interval: Duration,
) -> Result<(), EngineError> {
    let mut polls: u32 = 0;
    loop {
        let stats = engine.port_stats(tx_ports).await?;
        polls += 1;
        let active = stats.iter().filter(|s| s.transmit_active).count();
        if active == 0 {
            debug!(polls, "all transmit ports idle");
            return Ok(());
        }
        debug!(polls, active, "transmit still active");
        tokio::time::sleep(interval).await;
    }
}

async fn write_capture(path: &Path, data: &[u8]) -> Result<(), TrafficError> {
    let capture_err = |source| TrafficError::Capture {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(capture_err)?;
    }
    tokio::fs::write(path, data).await.map_err(capture_err)
}

fn union(a: &[PortId], b: &[PortId]) -> Vec<PortId> {
    let mut out = a.to_vec();
    for p in b {
        if !out.contains(p) {
            out.push(*p);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_keeps_order_without_duplicates() {
        let a = [PortId(2), PortId(0)];
        let b = [PortId(0), PortId(5)];
        assert_eq!(union(&a, &b), vec![PortId(2), PortId(0), PortId(5)]);
    }

    #[test]
    fn test_new_controller_is_idle() {
        let cfg = RunConfig {
            poll_interval_ms: 5,
            timeout_ms: Some(100),
            capture_dir: PathBuf::from("/tmp/caps"),
        };
        let rc = RunController::new(&cfg);
        assert_eq!(rc.state(), RunState::Idle);
        assert_eq!(rc.capture_dir(), Path::new("/tmp/caps"));
        assert_eq!(rc.timeout, Some(Duration::from_millis(100)));
    }
}
