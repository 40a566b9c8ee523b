//! Protocol header stacks for generated streams.
//!
//! A stream is described to the engine as an ordered list of [`Protocol`]
//! layers. [`build_stack`] turns a sending [`Endpoint`] and a
//! [`StreamPattern`] into that list; [`frame`] renders it to bytes.

pub mod frame;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire length of every generated frame, FCS included.
pub const FRAME_LEN: u16 = 128;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const UDP_SRC_PORT: u16 = 0x1234;
pub const UDP_DST_PORT: u16 = 0x4321;

/// IGMPv2 membership report.
pub const IGMPV2_MEMBERSHIP_REPORT: u8 = 0x16;

/// Destination used for IPv6 "broadcast" streams (all-nodes).
pub const IPV6_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

const IPV4_MCAST_MAC_BASE: u64 = 0x0100_5e00_0000;
const IPV6_MCAST_MAC_BASE: u64 = 0x3333_0000_0000;
const MAC_MASK: u64 = 0xffff_ffff_ffff;

// ---------------------------------------------------------------------------
// MacAddr
// ---------------------------------------------------------------------------

/// A 48-bit MAC address held in the low bits of a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(u64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr(MAC_MASK);

    pub const fn new(value: u64) -> Self {
        MacAddr(value & MAC_MASK)
    }

    pub fn from_octets(octets: [u8; 6]) -> Self {
        let mut value = 0u64;
        for b in octets {
            value = (value << 8) | u64::from(b);
        }
        MacAddr(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn octets(self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    /// `self + n`, wrapping inside the 48-bit space.
    pub const fn offset(self, n: u64) -> Self {
        MacAddr(self.0.wrapping_add(n) & MAC_MASK)
    }

    /// Group bit of the first octet (covers broadcast too).
    pub const fn is_multicast(self) -> bool {
        (self.0 >> 40) & 0x01 == 0x01
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == MAC_MASK
    }

    /// `01:00:5e` followed by the low 23 bits of the group.
    pub fn ipv4_multicast(group: Ipv4Addr) -> Self {
        MacAddr(IPV4_MCAST_MAC_BASE | (u64::from(u32::from(group)) & 0x007f_ffff))
    }

    /// `33:33` followed by the low 32 bits of the group.
    pub fn ipv6_multicast(group: Ipv6Addr) -> Self {
        MacAddr(IPV6_MCAST_MAC_BASE | (u128::from(group) as u64 & 0xffff_ffff))
    }

    pub fn for_group(group: IpAddr) -> Self {
        match group {
            IpAddr::V4(g) => Self::ipv4_multicast(g),
            IpAddr::V6(g) => Self::ipv6_multicast(g),
        }
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        Ok(MacAddr::from_octets(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

// ---------------------------------------------------------------------------
// Protocol layers
// ---------------------------------------------------------------------------

/// How the engine varies the source MAC from frame to frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MacMode {
    Fixed,
    /// Frame `n` uses `src + (n % count) * step`.
    Increment { count: u32, step: u32 },
}

/// One layer of a stream's header stack, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Protocol {
    Mac {
        dst: MacAddr,
        src: MacAddr,
        src_mode: MacMode,
    },
    Eth2 {
        ether_type: u16,
    },
    Ip4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
    },
    /// Addresses split into high and low 64-bit halves.
    Ip6 {
        src_hi: u64,
        src_lo: u64,
        dst_hi: u64,
        dst_lo: u64,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Igmp {
        igmp_type: u8,
        group: Ipv4Addr,
    },
    Payload,
    Signature {
        tag: u32,
    },
}

/// Split an IPv6 address into `(high64, low64)`.
pub fn ipv6_halves(addr: Ipv6Addr) -> (u64, u64) {
    let v = u128::from(addr);
    ((v >> 64) as u64, v as u64)
}

pub fn ipv6_join(hi: u64, lo: u64) -> Ipv6Addr {
    Ipv6Addr::from((u128::from(hi) << 64) | u128::from(lo))
}

/// Incremental builder for a header stack.
#[derive(Debug, Default)]
pub struct StackBuilder {
    layers: Vec<Protocol>,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ethernet(mut self, src: MacAddr, dst: MacAddr, src_mode: MacMode) -> Self {
        self.layers.push(Protocol::Mac { dst, src, src_mode });
        self
    }

    pub fn ether_type(mut self, ether_type: u16) -> Self {
        self.layers.push(Protocol::Eth2 { ether_type });
        self
    }

    pub fn ipv4(self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        let mut b = self.ether_type(ETHERTYPE_IPV4);
        b.layers.push(Protocol::Ip4 { src, dst });
        b
    }

    pub fn ipv6(self, src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        let (src_hi, src_lo) = ipv6_halves(src);
        let (dst_hi, dst_lo) = ipv6_halves(dst);
        let mut b = self.ether_type(ETHERTYPE_IPV6);
        b.layers.push(Protocol::Ip6 {
            src_hi,
            src_lo,
            dst_hi,
            dst_lo,
        });
        b
    }

    pub fn ip(self, src: &Endpoint, dst: IpAddr) -> Self {
        match dst {
            IpAddr::V4(d) => self.ipv4(src.ipv4, d),
            IpAddr::V6(d) => self.ipv6(src.ipv6, d),
        }
    }

    pub fn udp(mut self) -> Self {
        self.layers.push(Protocol::Udp {
            src_port: UDP_SRC_PORT,
            dst_port: UDP_DST_PORT,
        });
        self
    }

    pub fn igmp_report(mut self, group: Ipv4Addr) -> Self {
        self.layers.push(Protocol::Igmp {
            igmp_type: IGMPV2_MEMBERSHIP_REPORT,
            group,
        });
        self
    }

    /// Payload filler followed by the signature carrying `tag`.
    pub fn payload(mut self, tag: u32) -> Self {
        self.layers.push(Protocol::Payload);
        self.layers.push(Protocol::Signature { tag });
        self
    }

    pub fn finish(self) -> Vec<Protocol> {
        self.layers
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Addresses of one test port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

/// The traffic shapes a stream can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPattern {
    Unicast {
        dst: Endpoint,
        ip: IpVersion,
    },
    Broadcast {
        /// IPv4 destination for broadcast frames.
        broadcast_v4: Ipv4Addr,
        ip: IpVersion,
    },
    Multicast {
        group: IpAddr,
    },
    /// Unicast UDP whose source MAC walks `count` addresses from `base`.
    MacIncrement {
        dst: Endpoint,
        base: MacAddr,
        count: u32,
        step: u32,
    },
    IgmpReport {
        group: Ipv4Addr,
    },
}

/// Assemble the header stack sent from `src` for `pattern`, signed with `tag`.
pub fn build_stack(src: &Endpoint, pattern: &StreamPattern, tag: u32) -> Vec<Protocol> {
    let b = StackBuilder::new();
    let b = match *pattern {
        StreamPattern::Unicast { dst, ip } => {
            let dst_ip = match ip {
                IpVersion::V4 => IpAddr::V4(dst.ipv4),
                IpVersion::V6 => IpAddr::V6(dst.ipv6),
            };
            b.ethernet(src.mac, dst.mac, MacMode::Fixed)
                .ip(src, dst_ip)
                .udp()
        }
        StreamPattern::Broadcast { broadcast_v4, ip } => {
            let dst_ip = match ip {
                IpVersion::V4 => IpAddr::V4(broadcast_v4),
                IpVersion::V6 => IpAddr::V6(IPV6_ALL_NODES),
            };
            b.ethernet(src.mac, MacAddr::BROADCAST, MacMode::Fixed)
                .ip(src, dst_ip)
                .udp()
        }
        StreamPattern::Multicast { group } => b
            .ethernet(src.mac, MacAddr::for_group(group), MacMode::Fixed)
            .ip(src, group)
            .udp(),
        StreamPattern::MacIncrement {
            dst,
            base,
            count,
            step,
        } => b
            .ethernet(base, dst.mac, MacMode::Increment { count, step })
            .ipv4(src.ipv4, dst.ipv4)
            .udp(),
        StreamPattern::IgmpReport { group } => b
            .ethernet(src.mac, MacAddr::ipv4_multicast(group), MacMode::Fixed)
            .ipv4(src.ipv4, group)
            .igmp_report(group),
    };
    b.payload(tag).finish()
}
