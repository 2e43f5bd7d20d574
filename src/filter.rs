use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::conntrack::event::{Flow, PROTO_ICMP};

/// Decides which flows take part in accounting.
///
/// The same filter is applied to live events and to dump entries, so a flow
/// is either seen on both paths or on neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowFilter {
    /// Only flows whose original source lies in this network.
    pub source: Option<Ipv4Net>,
    /// Only flows whose original destination lies in this network.
    pub destination: Option<Ipv4Net>,
    /// Drop flows with this address at either end.
    pub exclude_ip: Option<Ipv4Addr>,
    pub include_icmp: bool,
}

impl FlowFilter {
    pub fn is_interesting(&self, flow: &Flow) -> bool {
        let (IpAddr::V4(src), IpAddr::V4(dst)) = (flow.src, flow.dst) else {
            return false;
        };

        if flow.protocol == PROTO_ICMP && !self.include_icmp {
            return false;
        }

        if let Some(excluded) = self.exclude_ip {
            if src == excluded || dst == excluded {
                return false;
            }
        }

        if let Some(net) = &self.source {
            if !net.contains(&src) {
                return false;
            }
        }

        if let Some(net) = &self.destination {
            if !net.contains(&dst) {
                return false;
            }
        }

        true
    }
}
