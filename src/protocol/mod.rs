use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Link-layer type of the capture, determines how to parse raw packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    RawIp,
}

/// A parsed packet with extracted header info and payload.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// IPv4 TTL or IPv6 hop limit.
    pub ttl: u8,
    pub transport: Transport,
    pub payload: Vec<u8>,
    pub tcp_flags: Option<TcpFlags>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Transport {
    /// Only TCP and UDP traffic is reassembled into sessions.
    pub fn is_session_transport(self) -> bool {
        matches!(self, Transport::Tcp | Transport::Udp)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Icmp => "icmp",
            Transport::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

/// One side of a conversation.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Endpoint {
            addr: normalize_ip(addr),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr {
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
        }
    }
}

impl ParsedPacket {
    pub fn source(&self) -> Option<Endpoint> {
        Some(Endpoint::new(self.src_ip?, self.src_port?))
    }

    pub fn destination(&self) -> Option<Endpoint> {
        Some(Endpoint::new(self.dst_ip?, self.dst_port?))
    }

    /// Session identifier, if the packet carries both endpoints.
    pub fn session_key(&self) -> Option<SessionKey> {
        Some(SessionKey::new(
            self.transport,
            self.source()?,
            self.destination()?,
        ))
    }
}

/// Bidirectional session identifier, normalized so (A->B) == (B->A).
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SessionKey {
    pub transport: Transport,
    pub low: Endpoint,
    pub high: Endpoint,
}

impl SessionKey {
    pub fn new(transport: Transport, a: Endpoint, b: Endpoint) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        SessionKey {
            transport,
            low,
            high,
        }
    }

    /// The endpoint on the other side of `from`.
    pub fn peer_of(&self, from: &Endpoint) -> Endpoint {
        if *from == self.low { self.high } else { self.low }
    }
}

/// Convert IPv6-mapped-IPv4 addresses to their IPv4 equivalent.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        other => other,
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} <-> {}", self.transport, self.low, self.high)
    }
}

/// Parse raw packet bytes into a ParsedPacket.
///
/// Returns `None` when the frame has no IP layer.
pub fn parse_packet(data: &[u8], link_type: LinkType) -> Option<ParsedPacket> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::LinuxSll => {
            // Linux cooked capture v1: 16-byte header, then IP packet
            if data.len() < 16 {
                return None;
            }
            SlicedPacket::from_ip(&data[16..]).ok()?
        }
    };

    let (src_ip, dst_ip, ttl) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
            ipv4.header().ttl(),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
            ipv6.header().hop_limit(),
        ),
        _ => return None,
    };

    let (src_port, dst_port, transport, tcp_flags, payload) = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => (
            Some(tcp.source_port()),
            Some(tcp.destination_port()),
            Transport::Tcp,
            Some(TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
            }),
            tcp.payload().to_vec(),
        ),
        Some(TransportSlice::Udp(udp)) => (
            Some(udp.source_port()),
            Some(udp.destination_port()),
            Transport::Udp,
            None,
            udp.payload().to_vec(),
        ),
        Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => {
            (None, None, Transport::Icmp, None, Vec::new())
        }
        _ => (None, None, Transport::Other, None, Vec::new()),
    };

    Some(ParsedPacket {
        src_ip: Some(src_ip),
        dst_ip: Some(dst_ip),
        src_port,
        dst_port,
        ttl,
        transport,
        payload,
        tcp_flags,
    })
}
