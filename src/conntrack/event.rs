use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Instant, SystemTime};

/// Kernel-assigned conntrack entry identifier. Unique for the lifetime of
/// the entry; only ever used as a map key.
pub type FlowId = u32;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_DCCP: u8 = 33;
pub const PROTO_ICMPV6: u8 = 58;
pub const PROTO_SCTP: u8 = 132;

/// Returns true for protocols whose connections have a lifecycle the
/// tracker can time (TCP, DCCP, SCTP).
pub const fn is_connection_oriented(protocol: u8) -> bool {
    matches!(protocol, PROTO_TCP | PROTO_DCCP | PROTO_SCTP)
}

/// EventType identifies the kind of conntrack notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    New = 0,
    Update = 1,
    Destroy = 2,
}

/// Maximum EventType value, used for array sizing.
pub const MAX_EVENT_TYPE: usize = 2;

impl EventType {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::New),
            1 => Some(Self::Update),
            2 => Some(Self::Destroy),
            _ => None,
        }
    }

    /// Convert from the bracketed tag printed by `conntrack -E`
    /// (`NEW`, `UPDATE`, `DESTROY`).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "NEW" => Some(Self::New),
            "UPDATE" => Some(Self::Update),
            "DESTROY" => Some(Self::Destroy),
            _ => None,
        }
    }

    /// Return all event types in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::New, Self::Update, Self::Destroy]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP connection tracking state. Values match the kernel's
/// `enum tcp_conntrack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TcpState {
    None = 0,
    SynSent = 1,
    SynRecv = 2,
    Established = 3,
    FinWait = 4,
    CloseWait = 5,
    LastAck = 6,
    TimeWait = 7,
    Close = 8,
    SynSent2 = 9,
}

impl TcpState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::SynSent2 => "SYN_SENT2",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::SynSent),
            2 => Some(Self::SynRecv),
            3 => Some(Self::Established),
            4 => Some(Self::FinWait),
            5 => Some(Self::CloseWait),
            6 => Some(Self::LastAck),
            7 => Some(Self::TimeWait),
            8 => Some(Self::Close),
            9 => Some(Self::SynSent2),
            _ => None,
        }
    }

    /// Convert from the state word printed by conntrack-tools.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NONE" => Some(Self::None),
            "SYN_SENT" => Some(Self::SynSent),
            "SYN_RECV" => Some(Self::SynRecv),
            "ESTABLISHED" => Some(Self::Established),
            "FIN_WAIT" => Some(Self::FinWait),
            "CLOSE_WAIT" => Some(Self::CloseWait),
            "LAST_ACK" => Some(Self::LastAck),
            "TIME_WAIT" => Some(Self::TimeWait),
            "CLOSE" => Some(Self::Close),
            "SYN_SENT2" => Some(Self::SynSent2),
            _ => None,
        }
    }

    /// States after which no further payload is expected; the connection
    /// is considered finished for duration accounting.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CloseWait | Self::LastAck | Self::Close)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative packet and byte counters for one direction of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

impl Counters {
    pub const fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }

    /// A report carries new data only when both packet and byte counts are
    /// set. Anything else means "nothing new" and must not overwrite.
    pub const fn is_reported(&self) -> bool {
        self.packets != 0 && self.bytes != 0
    }
}

/// Immutable view of a conntrack entry as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub id: FlowId,
    pub protocol: u8,
    /// Source of the original direction.
    pub src: IpAddr,
    /// Destination of the original direction.
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Counters of the original (src to dst) direction.
    pub orig: Counters,
    /// Counters of the reply (dst to src) direction.
    pub reply: Counters,
    /// Only set for TCP entries.
    pub tcp_state: Option<TcpState>,
}

impl Flow {
    /// Convenience constructor for an IPv4 flow with zeroed counters.
    pub fn v4(
        id: FlowId,
        protocol: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        Self {
            id,
            protocol,
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            src_port,
            dst_port,
            orig: Counters::default(),
            reply: Counters::default(),
            tcp_state: None,
        }
    }

    pub fn with_counters(mut self, orig: Counters, reply: Counters) -> Self {
        self.orig = orig;
        self.reply = reply;
        self
    }

    pub fn with_tcp_state(mut self, state: TcpState) -> Self {
        self.tcp_state = Some(state);
        self
    }

    pub fn is_ipv6(&self) -> bool {
        self.src.is_ipv6() || self.dst.is_ipv6()
    }

    /// True when the entry reached a terminal TCP state.
    pub fn is_tcp_terminal(&self) -> bool {
        self.protocol == PROTO_TCP && self.tcp_state.is_some_and(TcpState::is_terminal)
    }
}

/// A lifecycle notification for a single flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    pub event_type: EventType,
    pub flow: Flow,
}

impl FlowEvent {
    pub fn new(event_type: EventType, flow: Flow) -> Self {
        Self { event_type, flow }
    }
}

/// Full conntrack table fetched for one interval boundary.
#[derive(Debug, Clone)]
pub struct DumpSnapshot {
    /// Wall-clock time of the interval boundary the dump belongs to.
    pub timestamp: SystemTime,
    /// When the successful listing was started. Entries missing from
    /// `flows` and not heard of since then are gone from the kernel.
    pub fetched_at: Instant,
    pub flows: Vec<Flow>,
}
