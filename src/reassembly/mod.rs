use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use serde::Serialize;

use crate::protocol::{Endpoint, ParsedPacket, SessionKey, Transport, normalize_ip};

const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// One admitted packet as stored in a session.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedPacket {
    /// Admission order; only meaningful within a session.
    pub seq: u64,
    #[serde(serialize_with = "crate::session::as_unix_millis")]
    pub timestamp: SystemTime,
    pub ttl: u8,
    /// Sent towards the monitored host (client -> server).
    pub incoming: bool,
    #[serde(serialize_with = "crate::session::as_lossy_text")]
    pub content: Vec<u8>,
}

/// A session still under reassembly.
#[derive(Debug)]
pub struct PendingSession {
    pub key: SessionKey,
    /// Sender of the first packet.
    pub initiator: Endpoint,
    pub packets: Vec<CapturedPacket>,
    fins: HashSet<Endpoint>,
    acks: HashSet<Endpoint>,
}

impl PendingSession {
    fn new(key: SessionKey, initiator: Endpoint) -> Self {
        PendingSession {
            key,
            initiator,
            packets: Vec::new(),
            fins: HashSet::new(),
            acks: HashSet::new(),
        }
    }

    pub fn transport(&self) -> Transport {
        self.key.transport
    }

    pub fn responder(&self) -> Endpoint {
        self.key.peer_of(&self.initiator)
    }

    pub fn last_seen(&self) -> Option<SystemTime> {
        self.packets.last().map(|p| p.timestamp)
    }

    /// Track FIN/ACK exchange. Returns true once the connection is closed,
    /// i.e. on RST or after both sides acknowledged the other's FIN.
    fn observe_tcp(&mut self, from: Endpoint, fin: bool, ack: bool, rst: bool) -> bool {
        let to = self.key.peer_of(&from);
        if fin {
            self.fins.insert(from);
        }
        // The ACK answers the peer's FIN only if the peer already sent one.
        if ack && self.fins.contains(&to) {
            self.acks.insert(from);
        }
        rst || (self.acks.contains(&from) && self.acks.contains(&to))
    }
}

/// Groups admitted packets into sessions and decides when they are complete.
pub struct SessionTable {
    sessions: HashMap<SessionKey, PendingSession>,
    local_addr: IpAddr,
    next_seq: u64,
    max_sessions: usize,
    /// New sessions refused since the table last had room.
    refused: u64,
}

impl SessionTable {
    pub fn new(local_addr: IpAddr) -> Self {
        SessionTable {
            sessions: HashMap::new(),
            local_addr: normalize_ip(local_addr),
            next_seq: 0,
            max_sessions: DEFAULT_MAX_SESSIONS,
            refused: 0,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// New sessions refused since the table last had room.
    pub fn refused_sessions(&self) -> u64 {
        self.refused
    }

    /// Append an admitted TCP/UDP packet to its session.
    ///
    /// Returns the session, already evicted, when this packet closed it.
    pub fn process(&mut self, packet: &ParsedPacket, timestamp: SystemTime) -> Option<PendingSession> {
        let key = packet.session_key()?;
        let from = packet.source()?;
        let to = packet.destination()?;

        if !self.sessions.contains_key(&key) {
            if self.sessions.len() >= self.max_sessions {
                // Warn once per overflow episode, the rest goes to debug.
                if self.refused == 0 {
                    warn!("Session table full ({} sessions), dropping new sessions", self.max_sessions);
                }
                self.refused += 1;
                debug!("Session table full, dropping {}", key);
                return None;
            }
            if self.refused > 0 {
                info!("Session table has room again, {} sessions were dropped", self.refused);
                self.refused = 0;
            }
            debug!("New session {}", key);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let session = self
            .sessions
            .entry(key)
            .or_insert_with(|| PendingSession::new(key, from));
        session.packets.push(CapturedPacket {
            seq,
            timestamp,
            ttl: packet.ttl,
            incoming: to.addr == self.local_addr,
            content: packet.payload.clone(),
        });

        // UDP has no close handshake, it only ends by timeout.
        let closed = match (key.transport, packet.tcp_flags) {
            (Transport::Tcp, Some(flags)) => {
                session.observe_tcp(from, flags.fin, flags.ack, flags.rst)
            }
            _ => false,
        };

        if closed {
            debug!("Session {} closed after {} packets", key, session.packets.len());
            self.sessions.remove(&key)
        } else {
            None
        }
    }

    /// Evict every `transport` session whose last packet is older than
    /// `now - timeout`.
    pub fn sweep(&mut self, transport: Transport, timeout: Duration, now: SystemTime) -> Vec<PendingSession> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(key, session)| {
                key.transport == transport
                    && session
                        .last_seen()
                        .and_then(|last| now.duration_since(last).ok())
                        .is_some_and(|idle| idle > timeout)
            })
            .map(|(key, _)| *key)
            .collect();

        expired
            .iter()
            .filter_map(|key| self.sessions.remove(key))
            .collect()
    }

    /// Evict everything, oldest activity first.
    pub fn drain(&mut self) -> Vec<PendingSession> {
        let mut all: Vec<PendingSession> = self.sessions.drain().map(|(_, s)| s).collect();
        all.sort_by_key(|s| s.packets.first().map(|p| p.seq));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TcpFlags;
    use std::net::Ipv4Addr;

    const CLIENT: [u8; 4] = [10, 0, 0, 2];
    const SERVER: [u8; 4] = [10, 0, 0, 1];

    fn local() -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(SERVER))
    }

    fn tcp(from: ([u8; 4], u16), to: ([u8; 4], u16), flags: &str, payload: &[u8]) -> ParsedPacket {
        let mut f = TcpFlags::default();
        for c in flags.chars() {
            match c {
                'S' => f.syn = true,
                'A' => f.ack = true,
                'F' => f.fin = true,
                'R' => f.rst = true,
                'P' => f.psh = true,
                _ => {}
            }
        }
        ParsedPacket {
            src_ip: Some(IpAddr::V4(Ipv4Addr::from(from.0))),
            dst_ip: Some(IpAddr::V4(Ipv4Addr::from(to.0))),
            src_port: Some(from.1),
            dst_port: Some(to.1),
            ttl: 64,
            transport: Transport::Tcp,
            payload: payload.to_vec(),
            tcp_flags: Some(f),
        }
    }

    fn udp(from: ([u8; 4], u16), to: ([u8; 4], u16), payload: &[u8]) -> ParsedPacket {
        ParsedPacket {
            src_ip: Some(IpAddr::V4(Ipv4Addr::from(from.0))),
            dst_ip: Some(IpAddr::V4(Ipv4Addr::from(to.0))),
            src_port: Some(from.1),
            dst_port: Some(to.1),
            ttl: 64,
            transport: Transport::Udp,
            payload: payload.to_vec(),
            tcp_flags: None,
        }
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    const C: ([u8; 4], u16) = (CLIENT, 40000);
    const S: ([u8; 4], u16) = (SERVER, 80);

    #[test]
    fn fin_ack_exchange_closes_after_second_ack() {
        let mut table = SessionTable::new(local());
        assert!(table.process(&tcp(C, S, "S", b""), at(1)).is_none());
        assert!(table.process(&tcp(S, C, "SA", b""), at(1)).is_none());
        assert!(table.process(&tcp(C, S, "PA", b"GET /"), at(2)).is_none());
        assert!(table.process(&tcp(C, S, "F", b""), at(3)).is_none());
        assert!(table.process(&tcp(S, C, "A", b""), at(3)).is_none());
        assert!(table.process(&tcp(S, C, "F", b""), at(4)).is_none());
        let done = table.process(&tcp(C, S, "A", b""), at(4)).expect("closed on last ACK");
        assert_eq!(done.packets.len(), 7);
        assert!(table.is_empty());
    }

    #[test]
    fn combined_fin_ack_segments_close() {
        let mut table = SessionTable::new(local());
        assert!(table.process(&tcp(C, S, "PA", b"x"), at(1)).is_none());
        assert!(table.process(&tcp(C, S, "FA", b""), at(2)).is_none());
        assert!(table.process(&tcp(S, C, "FA", b""), at(2)).is_none());
        assert!(table.process(&tcp(C, S, "A", b""), at(2)).is_some());
    }

    #[test]
    fn ack_before_any_fin_does_not_count() {
        let mut table = SessionTable::new(local());
        table.process(&tcp(C, S, "A", b""), at(1));
        table.process(&tcp(S, C, "A", b""), at(1));
        assert!(table.process(&tcp(C, S, "F", b""), at(2)).is_none());
        // server has not acknowledged yet, client ACK of nothing
        assert!(table.process(&tcp(C, S, "A", b""), at(2)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rst_closes_immediately() {
        let mut table = SessionTable::new(local());
        table.process(&tcp(C, S, "S", b""), at(1));
        let done = table.process(&tcp(S, C, "R", b""), at(1)).expect("RST closes");
        assert_eq!(done.packets.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn rst_after_one_sided_fin_closes() {
        let mut table = SessionTable::new(local());
        table.process(&tcp(C, S, "FA", b""), at(1));
        assert!(table.process(&tcp(S, C, "RA", b""), at(1)).is_some());
    }

    #[test]
    fn direction_and_order_recorded() {
        let mut table = SessionTable::new(local());
        table.process(&tcp(C, S, "PA", b"req"), at(1));
        table.process(&tcp(S, C, "PA", b"resp"), at(2));
        let done = table.process(&tcp(C, S, "R", b""), at(3)).unwrap();
        let incoming: Vec<bool> = done.packets.iter().map(|p| p.incoming).collect();
        assert_eq!(incoming, vec![true, false, true]);
        assert!(done.packets.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(done.initiator.port, 40000);
        assert_eq!(done.responder().port, 80);
        assert_eq!(done.packets[1].content, b"resp");
    }

    #[test]
    fn udp_never_closes_on_packets() {
        let mut table = SessionTable::new(local());
        for i in 0..5 {
            assert!(table.process(&udp(C, S, b"ping"), at(i)).is_none());
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_closes_only_stale_sessions_of_transport() {
        let mut table = SessionTable::new(local());
        table.process(&udp((CLIENT, 1000), S, b"old"), at(10));
        table.process(&udp((CLIENT, 2000), S, b"new"), at(95));
        table.process(&tcp((CLIENT, 3000), S, "PA", b"tcp"), at(10));

        let closed = table.sweep(Transport::Udp, Duration::from_secs(60), at(100));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].initiator.port, 1000);
        assert_eq!(table.len(), 2);

        let closed = table.sweep(Transport::Tcp, Duration::from_secs(60), at(100));
        assert_eq!(closed.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_uses_last_packet_time() {
        let mut table = SessionTable::new(local());
        table.process(&udp(C, S, b"a"), at(0));
        table.process(&udp(S, C, b"b"), at(90));
        assert!(table.sweep(Transport::Udp, Duration::from_secs(60), at(100)).is_empty());
        assert_eq!(table.sweep(Transport::Udp, Duration::from_secs(60), at(151)).len(), 1);
    }

    #[test]
    fn capacity_limit_refuses_new_sessions_only() {
        let mut table = SessionTable::new(local()).with_max_sessions(1);
        table.process(&udp(C, S, b"a"), at(0));
        table.process(&udp((CLIENT, 1), S, b"b"), at(0));
        assert_eq!(table.len(), 1);
        table.process(&udp(S, C, b"c"), at(1));
        let all = table.drain();
        assert_eq!(all[0].packets.len(), 2);
    }

    #[test]
    fn refused_count_spans_one_overflow() {
        let mut table = SessionTable::new(local()).with_max_sessions(1);
        table.process(&udp(C, S, b"a"), at(0));
        for port in 1..=50 {
            assert!(table.process(&udp((CLIENT, port), S, b"b"), at(0)).is_none());
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.refused_sessions(), 50);

        // Once room frees up the next session is admitted and the count resets.
        assert_eq!(table.sweep(Transport::Udp, Duration::from_secs(1), at(10)).len(), 1);
        table.process(&udp((CLIENT, 7), S, b"c"), at(10));
        assert_eq!(table.len(), 1);
        assert_eq!(table.refused_sessions(), 0);

        table.process(&udp((CLIENT, 8), S, b"d"), at(10));
        assert_eq!(table.refused_sessions(), 1);
    }

    #[test]
    fn drain_returns_everything_in_first_seen_order() {
        let mut table = SessionTable::new(local());
        table.process(&udp((CLIENT, 5), S, b"1"), at(0));
        table.process(&tcp((CLIENT, 6), S, "PA", b"2"), at(0));
        table.process(&udp((CLIENT, 7), S, b"3"), at(0));
        let ports: Vec<u16> = table.drain().iter().map(|s| s.initiator.port).collect();
        assert_eq!(ports, vec![5, 6, 7]);
        assert!(table.is_empty());
    }

    #[test]
    fn packets_without_ports_are_ignored() {
        let mut table = SessionTable::new(local());
        let mut p = udp(C, S, b"x");
        p.src_port = None;
        assert!(table.process(&p, at(0)).is_none());
        assert!(table.is_empty());
    }
}
