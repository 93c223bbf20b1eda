//! Packet parsing and direction classification
//!
//! Builds the canonical endpoint key from the raw IP layer and decides
//! which side of a flow initiated the exchange. Only L3/L4 headers and
//! the ICMP type byte are inspected.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// IP protocol numbers handled by the classifier
pub const ICMP: u8 = 1;
pub const TCP: u8 = 6;
pub const UDP: u8 = 17;
pub const ICMPV6: u8 = 58;

/// Size of the endpoint key in bytes
pub const KEY_SIZE: usize = 37;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Highest port considered privileged (exclusive)
const PRIVILEGED_PORT_BOUND: u16 = 1024;

/// Packet decode failure. The display string doubles as the key in the
/// capture's error map, so variants stay coarse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty IP layer")]
    EmptyIpLayer,

    #[error("unknown IP version: {0}")]
    UnknownIpVersion(u8),

    #[error("truncated IP header")]
    TruncatedHeader,

    #[error("truncated transport header")]
    TruncatedTransport,
}

/// Direction of a packet relative to the interface, as hinted by the
/// kernel. Not all capture sources can provide it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Inbound,
    Outbound,
    Unknown,
}

/// Outcome of direction inference for a single packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The as-seen tuple already has the client as source
    Remains,
    /// Source and destination must be swapped to reach canonical form
    Reverts,
}

/// Fixed-layout flow key: src address (16 bytes, IPv4 in bytes 12-15),
/// dst address (16 bytes), dport (2 bytes BE), sport (2 bytes BE),
/// protocol (1 byte). IPv4-ness is tracked out of band.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey([u8; KEY_SIZE]);

impl EndpointKey {
    pub fn from_bytes(raw: [u8; KEY_SIZE]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Key for the same flow observed in the opposite direction
    pub fn reverse(&self) -> Self {
        let mut rev = [0u8; KEY_SIZE];
        rev[0..16].copy_from_slice(&self.0[16..32]);
        rev[16..32].copy_from_slice(&self.0[0..16]);
        // dport and sport swap along with the addresses
        rev[32..34].copy_from_slice(&self.0[34..36]);
        rev[34..36].copy_from_slice(&self.0[32..34]);
        rev[36] = self.0[36];
        Self(rev)
    }

    pub fn src_addr(&self, is_ipv4: bool) -> IpAddr {
        addr_from_slice(&self.0[0..16], is_ipv4)
    }

    pub fn dst_addr(&self, is_ipv4: bool) -> IpAddr {
        addr_from_slice(&self.0[16..32], is_ipv4)
    }

    pub fn dport(&self) -> u16 {
        u16::from_be_bytes([self.0[32], self.0[33]])
    }

    pub fn sport(&self) -> u16 {
        u16::from_be_bytes([self.0[34], self.0[35]])
    }

    pub fn proto(&self) -> u8 {
        self.0[36]
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // assume IPv4 when the upper address bytes are zero
        let v4 = self.0[0..12] == [0u8; 12] && self.0[16..28] == [0u8; 12];
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_addr(v4),
            self.sport(),
            self.dst_addr(v4),
            self.dport(),
            self.0[36]
        )
    }
}

fn addr_from_slice(raw: &[u8], is_ipv4: bool) -> IpAddr {
    if is_ipv4 {
        IpAddr::V4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
    } else {
        let mut v6 = [0u8; 16];
        v6.copy_from_slice(raw);
        IpAddr::V6(Ipv6Addr::from(v6))
    }
}

/// A packet reduced to the fields the flow log needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedPacket {
    /// Endpoint key in as-seen orientation
    pub key: EndpointKey,
    pub is_ipv4: bool,
    /// ICMP type byte for ICMP/ICMPv6, zero otherwise
    pub aux_info: u8,
    pub pkt_type: PacketType,
    /// Total packet length as declared by the capture source
    pub total_len: u32,
}

impl ParsedPacket {
    /// Parse the raw IP layer of a packet. `total_len` is the on-wire
    /// length which may exceed the snapshotted data.
    pub fn parse(ip_layer: &[u8], pkt_type: PacketType, total_len: u32) -> Result<Self, DecodeError> {
        if ip_layer.is_empty() {
            return Err(DecodeError::EmptyIpLayer);
        }

        let version = ip_layer[0] >> 4;
        let mut key = [0u8; KEY_SIZE];

        let (proto, header_len, is_ipv4) = match version {
            4 => {
                if ip_layer.len() < IPV4_HEADER_LEN {
                    return Err(DecodeError::TruncatedHeader);
                }
                key[12..16].copy_from_slice(&ip_layer[12..16]);
                key[28..32].copy_from_slice(&ip_layer[16..20]);
                (ip_layer[9], IPV4_HEADER_LEN, true)
            }
            6 => {
                if ip_layer.len() < IPV6_HEADER_LEN {
                    return Err(DecodeError::TruncatedHeader);
                }
                key[0..16].copy_from_slice(&ip_layer[8..24]);
                key[16..32].copy_from_slice(&ip_layer[24..40]);
                (ip_layer[6], IPV6_HEADER_LEN, false)
            }
            v => return Err(DecodeError::UnknownIpVersion(v)),
        };
        key[36] = proto;

        let mut aux_info = 0u8;
        match proto {
            TCP | UDP => {
                if ip_layer.len() < header_len + 4 {
                    return Err(DecodeError::TruncatedTransport);
                }
                // sport and dport are the first four bytes past the IP header
                key[34..36].copy_from_slice(&ip_layer[header_len..header_len + 2]);
                key[32..34].copy_from_slice(&ip_layer[header_len + 2..header_len + 4]);
            }
            ICMP | ICMPV6 => {
                if ip_layer.len() < header_len + 1 {
                    return Err(DecodeError::TruncatedTransport);
                }
                aux_info = ip_layer[header_len];
            }
            _ => {}
        }

        Ok(Self {
            key: EndpointKey(key),
            is_ipv4,
            aux_info,
            pkt_type,
            total_len,
        })
    }
}

/// A port counts as a common server port for exactly these combinations:
/// 53/80/443 over TCP and 53/443 over UDP.
pub fn is_common_port(port: u16, proto: u8) -> bool {
    match proto {
        TCP => matches!(port, 53 | 80 | 443),
        UDP => matches!(port, 53 | 443),
        _ => false,
    }
}

/// Well-known service port for the zeroed-ephemeral-port rule
fn is_well_known_port(port: u16, proto: u8) -> bool {
    port <= PRIVILEGED_PORT_BOUND || is_common_port(port, proto)
}

/// Infer the packet direction from protocol, ports and ICMP type.
///
/// Returns the direction together with a confidence flag: heuristics that
/// identify the server side definitively yield high confidence, the
/// port-ordering fallbacks do not.
pub fn classify_direction(pkt: &ParsedPacket) -> (Direction, bool) {
    let proto = pkt.key.proto();
    let sport = pkt.key.sport();
    let dport = pkt.key.dport();

    // ICMP echo request/reply and router advertisement carry the
    // direction in the type byte
    if proto == ICMP {
        match pkt.aux_info {
            0x08 => return (Direction::Remains, true),
            0x00 => return (Direction::Reverts, true),
            _ => {}
        }
    }
    if proto == ICMPV6 {
        match pkt.aux_info {
            0x80 | 0x86 => return (Direction::Remains, true),
            0x81 => return (Direction::Reverts, true),
            _ => {}
        }
    }

    // exactly one side on a common server port identifies the server
    let sport_common = is_common_port(sport, proto);
    let dport_common = is_common_port(dport, proto);
    if dport_common && !sport_common {
        return (Direction::Remains, true);
    }
    if sport_common && !dport_common {
        return (Direction::Reverts, true);
    }

    // DHCP client/server exchange runs on the fixed 68/67 pair
    if proto == UDP {
        if sport == 68 && dport == 67 {
            return (Direction::Remains, true);
        }
        if sport == 67 && dport == 68 {
            return (Direction::Reverts, true);
        }
    }

    // a zeroed ephemeral port against a well-known service port marks
    // the zero side as the client
    if sport == 0 && dport != 0 && is_well_known_port(dport, proto) {
        return (Direction::Remains, true);
    }
    if dport == 0 && sport != 0 && is_well_known_port(sport, proto) {
        return (Direction::Reverts, true);
    }

    // exactly one privileged port marks the server side
    let sport_priv = sport < PRIVILEGED_PORT_BOUND;
    let dport_priv = dport < PRIVILEGED_PORT_BOUND;
    if dport_priv && !sport_priv {
        return (Direction::Remains, true);
    }
    if sport_priv && !dport_priv {
        return (Direction::Reverts, true);
    }

    // fall back to port ordering: the lower port is assumed to be the
    // server. Equal ports cannot be resolved on the first packet.
    if sport > dport {
        (Direction::Remains, false)
    } else if sport < dport {
        (Direction::Reverts, false)
    } else {
        (Direction::Remains, false)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::net::IpAddr;

    pub fn build_key(
        sip: &str,
        dip: &str,
        sport: u16,
        dport: u16,
        proto: u8,
    ) -> (EndpointKey, bool) {
        let src: IpAddr = sip.parse().unwrap();
        let dst: IpAddr = dip.parse().unwrap();

        let mut raw = [0u8; KEY_SIZE];
        let is_ipv4 = match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                raw[12..16].copy_from_slice(&s.octets());
                raw[28..32].copy_from_slice(&d.octets());
                true
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                raw[0..16].copy_from_slice(&s.octets());
                raw[16..32].copy_from_slice(&d.octets());
                false
            }
            _ => panic!("mixed address families"),
        };
        raw[32..34].copy_from_slice(&dport.to_be_bytes());
        raw[34..36].copy_from_slice(&sport.to_be_bytes());
        raw[36] = proto;
        (EndpointKey::from_bytes(raw), is_ipv4)
    }

    /// Build a minimal raw IP layer carrying the given 5-tuple
    pub fn build_ip_layer(
        sip: &str,
        dip: &str,
        sport: u16,
        dport: u16,
        proto: u8,
        aux_info: u8,
    ) -> Vec<u8> {
        let src: IpAddr = sip.parse().unwrap();
        let dst: IpAddr = dip.parse().unwrap();

        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let mut data = vec![0u8; IPV4_HEADER_LEN + 8];
                data[0] = 4 << 4;
                data[9] = proto;
                data[12..16].copy_from_slice(&s.octets());
                data[16..20].copy_from_slice(&d.octets());
                if proto == TCP || proto == UDP {
                    data[20..22].copy_from_slice(&sport.to_be_bytes());
                    data[22..24].copy_from_slice(&dport.to_be_bytes());
                } else {
                    data[20] = aux_info;
                }
                data
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let mut data = vec![0u8; IPV6_HEADER_LEN + 8];
                data[0] = 6 << 4;
                data[6] = proto;
                data[8..24].copy_from_slice(&s.octets());
                data[24..40].copy_from_slice(&d.octets());
                if proto == TCP || proto == UDP {
                    data[40..42].copy_from_slice(&sport.to_be_bytes());
                    data[42..44].copy_from_slice(&dport.to_be_bytes());
                } else {
                    data[40] = aux_info;
                }
                data
            }
            _ => panic!("mixed address families"),
        }
    }
}
