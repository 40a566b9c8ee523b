use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::debug;

use super::TrafficError;
use crate::config::AddressingConfig;
use crate::engine::{PortConfig, PortId, StreamId};
use crate::headers::{Endpoint, MacAddr};

/// A registered test port and the streams it has issued since the last run.
#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    port: PortId,
    endpoint: Endpoint,
    pub(super) next_stream_id: u32,
    pub(super) stream_ids: Vec<StreamId>,
}

impl Interface {
    fn new(name: &str, port: PortId, endpoint: Endpoint) -> Self {
        Self {
            name: name.to_string(),
            port,
            endpoint,
            next_stream_id: 1,
            stream_ids: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn mac(&self) -> MacAddr {
        self.endpoint.mac
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        self.endpoint.ipv4
    }

    pub fn ipv6(&self) -> Ipv6Addr {
        self.endpoint.ipv6
    }

    /// Id the next stream on this interface will get.
    pub fn next_stream_id(&self) -> u32 {
        self.next_stream_id
    }

    /// Engine-side streams created since the last reset.
    pub fn stream_ids(&self) -> &[StreamId] {
        &self.stream_ids
    }
}

/// Maps interface names to engine ports, in registration order.
#[derive(Debug)]
pub struct Registry {
    ports: Vec<PortConfig>,
    addressing: AddressingConfig,
    interfaces: Vec<Interface>,
    tx_ports: Vec<PortId>,
    rx_ports: Vec<PortId>,
}

impl Registry {
    pub fn new(ports: Vec<PortConfig>, addressing: AddressingConfig) -> Self {
        Self {
            ports,
            addressing,
            interfaces: Vec::new(),
            tx_ports: Vec::new(),
            rx_ports: Vec::new(),
        }
    }

    /// Names of every port the engine enumerated.
    pub fn port_names(&self) -> Vec<&str> {
        self.ports.iter().map(|p| p.name.as_str()).collect()
    }

    /// Bind `name` to its engine port. Returns the port and whether the
    /// interface is new; a second registration changes nothing.
    pub fn register(&mut self, name: &str) -> Result<(PortId, bool), TrafficError> {
        if let Some(existing) = self.interfaces.iter().find(|i| i.name == name) {
            return Ok((existing.port, false));
        }
        let port = self
            .ports
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| TrafficError::UnknownInterface {
                name: name.to_string(),
            })?;

        let endpoint = self.addressing.endpoint_for(port);
        debug!(%name, %port, mac = %endpoint.mac, ipv4 = %endpoint.ipv4, "interface addresses derived");
        self.interfaces.push(Interface::new(name, port, endpoint));
        if !self.tx_ports.contains(&port) {
            self.tx_ports.push(port);
        }
        if !self.rx_ports.contains(&port) {
            self.rx_ports.push(port);
        }
        Ok((port, true))
    }

    pub fn resolve(&self, name: &str) -> Result<&Interface, TrafficError> {
        self.interfaces
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| not_registered(name))
    }

    pub fn resolve_mut(&mut self, name: &str) -> Result<&mut Interface, TrafficError> {
        self.interfaces
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| not_registered(name))
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interfaces_mut(&mut self) -> &mut [Interface] {
        &mut self.interfaces
    }

    pub fn tx_ports(&self) -> &[PortId] {
        &self.tx_ports
    }

    pub fn rx_ports(&self) -> &[PortId] {
        &self.rx_ports
    }

    pub fn addressing(&self) -> &AddressingConfig {
        &self.addressing
    }
}

fn not_registered(name: &str) -> TrafficError {
    TrafficError::NotRegistered {
        name: name.to_string(),
    }
}
