//! Line parsing for conntrack-tools output.
//!
//! Understands the `-o extended,id` format printed by both `conntrack -E`
//! (event stream, one bracketed `[NEW]`/`[UPDATE]`/`[DESTROY]` tag per line)
//! and `conntrack -L` (table listing, no tag). The first tuple on a line is
//! the original direction, the second the reply direction; `packets=` and
//! `bytes=` bind to the tuple they follow.

use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

use super::event::{
    Counters, EventType, Flow, FlowEvent, TcpState, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP,
};

/// Errors that can occur while parsing a conntrack line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("missing event tag")]
    MissingEventTag,

    #[error("unknown event tag: {tag}")]
    UnknownEventTag { tag: String },

    #[error("unknown address family: {family}")]
    UnknownFamily { family: String },

    #[error("missing field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Parse one line of `conntrack -E -o extended,id` output.
///
/// A leading `[<seconds>.<micros>]` token (from `-o timestamp`) is skipped.
pub fn parse_event_line(line: &str) -> Result<FlowEvent, ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut tokens = line.split_whitespace().peekable();
    let mut event_type = None;

    while let Some(&tok) = tokens.peek() {
        let Some(inner) = bracketed(tok) else {
            break;
        };
        tokens.next();

        if inner.parse::<f64>().is_ok() {
            continue;
        }

        event_type = Some(EventType::from_tag(inner).ok_or_else(|| {
            ParseError::UnknownEventTag {
                tag: inner.to_string(),
            }
        })?);
        break;
    }

    let event_type = event_type.ok_or(ParseError::MissingEventTag)?;
    let flow = parse_flow_tokens(tokens)?;

    Ok(FlowEvent::new(event_type, flow))
}

/// Parse one line of `conntrack -L -o extended,id` output.
pub fn parse_flow_line(line: &str) -> Result<Flow, ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    parse_flow_tokens(line.split_whitespace())
}

fn parse_flow_tokens<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<Flow, ParseError> {
    let family = tokens.next().ok_or(ParseError::MissingField { field: "family" })?;
    if family != "ipv4" && family != "ipv6" {
        return Err(ParseError::UnknownFamily {
            family: family.to_string(),
        });
    }

    // Numeric family, protocol name, protocol number.
    tokens.next().ok_or(ParseError::MissingField { field: "family" })?;
    tokens
        .next()
        .ok_or(ParseError::MissingField { field: "protocol" })?;
    let protocol: u8 = parse_value(
        "protocol",
        tokens
            .next()
            .ok_or(ParseError::MissingField { field: "protocol" })?,
    )?;

    // ICMP tuples carry their own `id=`; the entry id follows them.
    let icmp = protocol == PROTO_ICMP || protocol == PROTO_ICMPV6;
    let mut tuple_id_seen = [false; 3];

    let mut tuple = 0usize;
    let mut src: Option<IpAddr> = None;
    let mut dst: Option<IpAddr> = None;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut orig = Counters::default();
    let mut reply = Counters::default();
    let mut tcp_state = None;
    let mut id = None;

    for tok in tokens {
        if let Some((key, value)) = tok.split_once('=') {
            match key {
                "src" => {
                    tuple += 1;
                    if tuple == 1 {
                        src = Some(parse_value("src", value)?);
                    }
                }
                "dst" if tuple == 1 && dst.is_none() => {
                    dst = Some(parse_value("dst", value)?);
                }
                "sport" if tuple == 1 => src_port = parse_value("sport", value)?,
                "dport" if tuple == 1 => dst_port = parse_value("dport", value)?,
                "packets" => {
                    let packets = parse_value("packets", value)?;
                    match tuple {
                        1 => orig.packets = packets,
                        2 => reply.packets = packets,
                        _ => {}
                    }
                }
                "bytes" => {
                    let bytes = parse_value("bytes", value)?;
                    match tuple {
                        1 => orig.bytes = bytes,
                        2 => reply.bytes = bytes,
                        _ => {}
                    }
                }
                "id" => {
                    if icmp && (tuple == 1 || tuple == 2) && !tuple_id_seen[tuple] {
                        tuple_id_seen[tuple] = true;
                    } else {
                        id = Some(parse_value("id", value)?);
                    }
                }
                _ => {}
            }
        } else if bracketed(tok).is_some() {
            // Flags such as [ASSURED] or [UNREPLIED].
        } else if protocol == PROTO_TCP && tcp_state.is_none() {
            tcp_state = TcpState::from_name(tok);
        }
    }

    Ok(Flow {
        id: id.ok_or(ParseError::MissingField { field: "id" })?,
        protocol,
        src: src.ok_or(ParseError::MissingField { field: "src" })?,
        dst: dst.ok_or(ParseError::MissingField { field: "dst" })?,
        src_port,
        dst_port,
        orig,
        reply,
        tcp_state,
    })
}

fn bracketed(tok: &str) -> Option<&str> {
    tok.strip_prefix('[')?.strip_suffix(']')
}

fn parse_value<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
