use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::agent::ports::SharedPortInterest;
use crate::conntrack::event::Flow;

/// Grouping key for accounting entries.
///
/// Field order is significant: it is the column order of the CSV output.
/// Ports that are not interesting collapse to the wildcard (`None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub port: Option<u16>,
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},",
            protocol_name(self.protocol),
            self.source,
            self.destination
        )?;
        match self.port {
            Some(port) => write!(f, "{port}"),
            None => f.write_str("-1"),
        }
    }
}

/// Canonical protocol name for a protocol number; falls back to the decimal
/// number for protocols without a name.
pub fn protocol_name(protocol: u8) -> Cow<'static, str> {
    let name = match protocol {
        1 => "icmp",
        2 => "igmp",
        6 => "tcp",
        17 => "udp",
        33 => "dccp",
        47 => "gre",
        58 => "ipv6-icmp",
        94 => "ipip",
        115 => "l2tp",
        132 => "sctp",
        136 => "udplite",
        other => return Cow::Owned(other.to_string()),
    };
    Cow::Borrowed(name)
}

/// Derives aggregation keys from flows.
///
/// Masks are fixed for the process lifetime; the port table is read fresh
/// on every call so reloads apply to flows first seen after them.
#[derive(Clone)]
pub struct KeyPolicy {
    source_mask: Ipv4Addr,
    destination_mask: Ipv4Addr,
    ports: SharedPortInterest,
}

impl fmt::Debug for KeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPolicy")
            .field("source_mask", &self.source_mask)
            .field("destination_mask", &self.destination_mask)
            .field("ports", &self.ports.load().len())
            .finish()
    }
}

impl KeyPolicy {
    pub fn new(source_mask: Ipv4Addr, destination_mask: Ipv4Addr, ports: SharedPortInterest) -> Self {
        Self {
            source_mask,
            destination_mask,
            ports,
        }
    }

    pub fn key_for(&self, flow: &Flow) -> AggregationKey {
        let port = self
            .ports
            .load()
            .is_interesting(&protocol_name(flow.protocol), flow.dst_port)
            .then_some(flow.dst_port);

        AggregationKey {
            protocol: flow.protocol,
            source: mask(flow.src, self.source_mask),
            destination: mask(flow.dst, self.destination_mask),
            port,
        }
    }
}

fn mask(addr: IpAddr, mask: Ipv4Addr) -> Ipv4Addr {
    let v4 = match addr {
        IpAddr::V4(v4) => v4,
        // IPv6 flows never pass the filter.
        IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    v4 & mask
}
