//! L3/L4 header classification for captured frames.
//!
//! Only headers are read, so frames truncated by a short snap length still
//! classify correctly: the attributed length comes from the IP header's own
//! length field. Only an IPv4 total length of zero (segmentation offload)
//! falls back to the captured byte count.
//!
//! Non-first fragments carry no transport header and classify as `Other`.

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, SingleVlanHeaderSlice};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const LINUX_SLL_HEADER_LEN: usize = 16;
const IPV6_HEADER_LEN: u64 = 40;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

const IP_PROTO_HOP_BY_HOP: u8 = 0;
const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const IP_PROTO_IPV6_ROUTE: u8 = 43;
const IP_PROTO_IPV6_FRAG: u8 = 44;
const IP_PROTO_ICMPV6: u8 = 58;
const IP_PROTO_IPV6_DEST_OPTS: u8 = 60;

/// L4 protocol classes tracked per bucket.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
    Other,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Tcp, Protocol::Udp, Protocol::Icmp, Protocol::Other];

    pub fn index(self) -> usize {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
            Protocol::Icmp => 2,
            Protocol::Other => 3,
        }
    }

    fn from_ip_number(number: u8) -> Self {
        match number {
            IP_PROTO_TCP => Protocol::Tcp,
            IP_PROTO_UDP => Protocol::Udp,
            IP_PROTO_ICMP | IP_PROTO_ICMPV6 => Protocol::Icmp,
            _ => Protocol::Other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Other => "Other",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    #[serde(rename = "IPv4")]
    V4,
    #[serde(rename = "IPv6")]
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    pub fn index(self) -> usize {
        match self {
            IpVersion::V4 => 0,
            IpVersion::V6 => 1,
        }
    }
}

/// The result of classifying one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSummary {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IPv4 total length, or IPv6 payload length plus the fixed 40-byte header.
    pub length: u64,
    pub protocol: Protocol,
    pub ip_version: IpVersion,
}

/// Link-layer framing of a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    LinuxSll,
    RawIp,
}

impl LinkLayer {
    /// Maps a pcap DLT/LINKTYPE code.
    pub fn from_linktype(code: i32) -> Option<Self> {
        match code {
            1 => Some(LinkLayer::Ethernet),
            113 => Some(LinkLayer::LinuxSll),
            12 | 14 | 101 | 228 | 229 => Some(LinkLayer::RawIp),
            _ => None,
        }
    }
}

/// Classifies a frame. Returns `None` for anything that is not IPv4/IPv6 or is malformed.
pub fn parse_frame(frame: &[u8], link: LinkLayer) -> Option<PacketSummary> {
    match link {
        LinkLayer::Ethernet => {
            let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
            let mut ether_type = eth.ether_type().0;
            let mut offset = ETHERNET_HEADER_LEN;
            if ether_type == ETHERTYPE_VLAN {
                let vlan = SingleVlanHeaderSlice::from_slice(frame.get(offset..)?).ok()?;
                ether_type = vlan.ether_type().0;
                offset += VLAN_TAG_LEN;
            }
            parse_ether_payload(ether_type, frame.get(offset..)?)
        }
        LinkLayer::LinuxSll => {
            let proto = frame.get(14..LINUX_SLL_HEADER_LEN)?;
            let ether_type = u16::from_be_bytes([proto[0], proto[1]]);
            parse_ether_payload(ether_type, frame.get(LINUX_SLL_HEADER_LEN..)?)
        }
        LinkLayer::RawIp => parse_ip(frame),
    }
}

fn parse_ether_payload(ether_type: u16, payload: &[u8]) -> Option<PacketSummary> {
    match ether_type {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => parse_ip(payload),
        _ => None,
    }
}

/// Classifies a bare IP packet, dispatching on the version nibble.
pub fn parse_ip(data: &[u8]) -> Option<PacketSummary> {
    match data.first()? >> 4 {
        4 => {
            let header = Ipv4HeaderSlice::from_slice(data).ok()?;
            let length = match header.total_len() {
                0 => data.len() as u64,
                len => u64::from(len),
            };
            let protocol = if header.fragments_offset().value() != 0 {
                Protocol::Other
            } else {
                Protocol::from_ip_number(header.protocol().0)
            };
            Some(PacketSummary {
                src: IpAddr::V4(header.source_addr()),
                dst: IpAddr::V4(header.destination_addr()),
                length,
                protocol,
                ip_version: IpVersion::V4,
            })
        }
        6 => {
            let header = Ipv6HeaderSlice::from_slice(data).ok()?;
            let rest = data.get(IPV6_HEADER_LEN as usize..).unwrap_or(&[]);
            Some(PacketSummary {
                src: IpAddr::V6(header.source_addr()),
                dst: IpAddr::V6(header.destination_addr()),
                length: u64::from(header.payload_length()) + IPV6_HEADER_LEN,
                protocol: ipv6_upper_protocol(header.next_header().0, rest),
                ip_version: IpVersion::V6,
            })
        }
        _ => None,
    }
}

/// Skips hop-by-hop, routing, fragment and destination-options headers. Stops
/// at whatever the captured bytes still cover; a truncated chain or a
/// non-first fragment is `Other`.
fn ipv6_upper_protocol(mut next: u8, mut rest: &[u8]) -> Protocol {
    loop {
        let ext_len = match next {
            IP_PROTO_HOP_BY_HOP | IP_PROTO_IPV6_ROUTE | IP_PROTO_IPV6_DEST_OPTS => {
                match rest.get(1) {
                    Some(len) => (usize::from(*len) + 1) * 8,
                    None => return Protocol::Other,
                }
            }
            IP_PROTO_IPV6_FRAG => match rest.get(2..4) {
                Some(&[hi, lo]) if u16::from_be_bytes([hi, lo]) >> 3 == 0 => 8,
                _ => return Protocol::Other,
            },
            other => return Protocol::from_ip_number(other),
        };
        match (rest.first(), rest.get(ext_len..)) {
            (Some(following), Some(remaining)) => {
                next = *following;
                rest = remaining;
            }
            _ => return Protocol::Other,
        }
    }
}
