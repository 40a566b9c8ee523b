//! Render header stacks to frame bytes, and read them back.

use std::net::Ipv4Addr;

use thiserror::Error;

use super::{ipv6_join, MacAddr, MacMode, Protocol};

/// Trailer magic following the correlation tag.
pub const SIGNATURE_MAGIC: u32 = 0x1d10_c0da;
pub const SIGNATURE_LEN: usize = 8;
pub const FCS_LEN: usize = 4;

const IPPROTO_IGMP: u8 = 2;
const IPPROTO_UDP: u8 = 17;
const IPV6_NO_NEXT_HEADER: u8 = 59;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {frame_len} cannot hold {needed} bytes of headers")]
    TooShort { frame_len: u16, needed: usize },
}

#[derive(Clone, Copy)]
enum IpLayer {
    V4 { offset: usize },
    V6 { offset: usize },
}

/// Render frame number `seq` of a stream. The result excludes the FCS, so it
/// is `frame_len - 4` bytes long.
pub fn render(layers: &[Protocol], frame_len: u16, seq: u64) -> Result<Vec<u8>, FrameError> {
    let total = usize::from(frame_len).saturating_sub(FCS_LEN);
    let needed = header_len(layers) + SIGNATURE_LEN;
    if needed > total {
        return Err(FrameError::TooShort { frame_len, needed });
    }

    let mut buf = vec![0u8; total];
    let mut off = 0;
    let mut ip: Option<IpLayer> = None;
    let mut udp_at: Option<usize> = None;
    let mut igmp_at: Option<usize> = None;

    for (i, layer) in layers.iter().enumerate() {
        let next = layers.get(i + 1);
        match *layer {
            Protocol::Mac { dst, src, src_mode } => {
                let src = match src_mode {
                    MacMode::Increment { count, step } if count > 0 => {
                        src.offset((seq % u64::from(count)) * u64::from(step))
                    }
                    _ => src,
                };
                buf[off..off + 6].copy_from_slice(&dst.octets());
                buf[off + 6..off + 12].copy_from_slice(&src.octets());
                off += 12;
            }
            Protocol::Eth2 { ether_type } => {
                buf[off..off + 2].copy_from_slice(&ether_type.to_be_bytes());
                off += 2;
            }
            Protocol::Ip4 { src, dst } => {
                let h = &mut buf[off..off + 20];
                h[0] = 0x45;
                h[2..4].copy_from_slice(&((total - off) as u16).to_be_bytes());
                h[8] = 127;
                h[9] = transport_proto(next).unwrap_or(0xff);
                h[12..16].copy_from_slice(&src.octets());
                h[16..20].copy_from_slice(&dst.octets());
                ip = Some(IpLayer::V4 { offset: off });
                off += 20;
            }
            Protocol::Ip6 {
                src_hi,
                src_lo,
                dst_hi,
                dst_lo,
            } => {
                let h = &mut buf[off..off + 40];
                h[0] = 0x60;
                h[4..6].copy_from_slice(&((total - off - 40) as u16).to_be_bytes());
                h[6] = transport_proto(next).unwrap_or(IPV6_NO_NEXT_HEADER);
                h[7] = 64;
                h[8..24].copy_from_slice(&ipv6_join(src_hi, src_lo).octets());
                h[24..40].copy_from_slice(&ipv6_join(dst_hi, dst_lo).octets());
                ip = Some(IpLayer::V6 { offset: off });
                off += 40;
            }
            Protocol::Udp { src_port, dst_port } => {
                let h = &mut buf[off..off + 8];
                h[0..2].copy_from_slice(&src_port.to_be_bytes());
                h[2..4].copy_from_slice(&dst_port.to_be_bytes());
                h[4..6].copy_from_slice(&((total - off) as u16).to_be_bytes());
                udp_at = Some(off);
                off += 8;
            }
            Protocol::Igmp { igmp_type, group } => {
                let h = &mut buf[off..off + 8];
                h[0] = igmp_type;
                h[4..8].copy_from_slice(&group.octets());
                igmp_at = Some(off);
                off += 8;
            }
            // Filler is already zero.
            Protocol::Payload => {}
            Protocol::Signature { tag } => {
                let at = total - SIGNATURE_LEN;
                buf[at..at + 4].copy_from_slice(&tag.to_be_bytes());
                buf[at + 4..].copy_from_slice(&SIGNATURE_MAGIC.to_be_bytes());
            }
        }
    }

    if let Some(at) = igmp_at {
        let sum = csum16(&buf[at..]);
        buf[at + 2..at + 4].copy_from_slice(&sum.to_be_bytes());
    }
    if let (Some(at), Some(layer)) = (udp_at, ip) {
        let sum = udp_checksum(&buf, layer, at);
        buf[at + 6..at + 8].copy_from_slice(&sum.to_be_bytes());
    }
    if let Some(IpLayer::V4 { offset }) = ip {
        let sum = csum16(&buf[offset..offset + 20]);
        buf[offset + 10..offset + 12].copy_from_slice(&sum.to_be_bytes());
    }

    Ok(buf)
}

fn header_len(layers: &[Protocol]) -> usize {
    layers
        .iter()
        .map(|p| match p {
            Protocol::Mac { .. } => 12,
            Protocol::Eth2 { .. } => 2,
            Protocol::Ip4 { .. } => 20,
            Protocol::Ip6 { .. } => 40,
            Protocol::Udp { .. } | Protocol::Igmp { .. } => 8,
            Protocol::Payload | Protocol::Signature { .. } => 0,
        })
        .sum()
}

fn transport_proto(next: Option<&Protocol>) -> Option<u8> {
    match next {
        Some(Protocol::Udp { .. }) => Some(IPPROTO_UDP),
        Some(Protocol::Igmp { .. }) => Some(IPPROTO_IGMP),
        _ => None,
    }
}

fn udp_checksum(buf: &[u8], ip: IpLayer, udp_at: usize) -> u16 {
    let segment = &buf[udp_at..];
    let mut pseudo = Vec::with_capacity(40 + segment.len());
    match ip {
        IpLayer::V4 { offset } => {
            pseudo.extend_from_slice(&buf[offset + 12..offset + 20]);
            pseudo.push(0);
            pseudo.push(IPPROTO_UDP);
            pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        }
        IpLayer::V6 { offset } => {
            pseudo.extend_from_slice(&buf[offset + 8..offset + 40]);
            pseudo.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            pseudo.extend_from_slice(&[0, 0, 0, IPPROTO_UDP]);
        }
    }
    pseudo.extend_from_slice(segment);
    match csum16(&pseudo) {
        0 => 0xffff,
        sum => sum,
    }
}

/// 16-bit one's complement checksum (RFC 1071).
pub fn csum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([c[0], c[1]])));
    }
    if let Some(&rem) = chunks.remainder().first() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([rem, 0])));
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Correlation tag carried in a frame's signature trailer, if any.
pub fn read_signature(frame: &[u8]) -> Option<u32> {
    if frame.len() < SIGNATURE_LEN {
        return None;
    }
    let at = frame.len() - SIGNATURE_LEN;
    let magic = u32::from_be_bytes(frame[at + 4..at + 8].try_into().ok()?);
    if magic != SIGNATURE_MAGIC {
        return None;
    }
    Some(u32::from_be_bytes(frame[at..at + 4].try_into().ok()?))
}

/// `(dst, src)` MAC addresses of an Ethernet frame.
pub fn mac_addrs(frame: &[u8]) -> Option<(MacAddr, MacAddr)> {
    if frame.len() < 14 {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    Some((MacAddr::from_octets(dst), MacAddr::from_octets(src)))
}

/// Destination IPv4 address when the frame carries IPv4 directly after the
/// EtherType.
pub fn ipv4_dst(frame: &[u8]) -> Option<Ipv4Addr> {
    if frame.len() < 34 || frame[12..14] != super::ETHERTYPE_IPV4.to_be_bytes() {
        return None;
    }
    Some(Ipv4Addr::new(frame[30], frame[31], frame[32], frame[33]))
}
