pub mod pipeline;

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize, Serializer};

use crate::pattern::{Pattern, PatternId, PatternMatch, PatternMatcher};
use crate::protocol::{Endpoint, Transport};
use crate::reassembly::{CapturedPacket, PendingSession};
use crate::tls::{KeyStore, TlsDecryptor, TlsError};

pub use pipeline::Pipeline;

/// Identifier of a configured service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u32);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "service {}", self.0)
    }
}

/// Decides which traffic belongs to a monitored service.
pub trait ServiceLookup: Send + Sync {
    fn lookup_service(
        &self,
        transport: Transport,
        addr_a: IpAddr,
        port_a: u16,
        addr_b: IpAddr,
        port_b: u16,
    ) -> Option<ServiceId>;
}

/// Persists finished sessions and notifies whoever is watching.
pub trait SessionSink: Send + Sync {
    /// Returns false when the session was not stored.
    fn persist_and_notify(&self, session: Session) -> bool;
}

/// A captured packet with the pattern matches found in it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPacket {
    #[serde(flatten)]
    pub packet: CapturedPacket,
    pub matches: BTreeSet<PatternMatch>,
    #[serde(
        serialize_with = "as_lossy_text_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub plaintext: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub plaintext_matches: BTreeSet<PatternMatch>,
}

/// A completed, analyzed session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub protocol: Transport,
    pub service: ServiceId,
    #[serde(serialize_with = "as_unix_millis")]
    pub started: SystemTime,
    #[serde(serialize_with = "as_unix_millis")]
    pub ended: SystemTime,
    pub client: Endpoint,
    pub server: Endpoint,
    pub packets: Vec<SessionPacket>,
    pub found_patterns: BTreeSet<PatternId>,
    pub favorite: bool,
    pub tls_decrypted: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizerOptions {
    pub ignore_empty_packets: bool,
    pub decrypt_tls: bool,
}

/// Turns a closed `PendingSession` into a stored `Session`.
pub struct SessionFinalizer {
    services: Arc<dyn ServiceLookup>,
    keys: Option<Arc<dyn KeyStore>>,
    sink: Arc<dyn SessionSink>,
    matcher: PatternMatcher,
    patterns: Arc<Vec<Pattern>>,
    options: FinalizerOptions,
}

impl SessionFinalizer {
    pub fn new(
        services: Arc<dyn ServiceLookup>,
        sink: Arc<dyn SessionSink>,
        patterns: Arc<Vec<Pattern>>,
        options: FinalizerOptions,
    ) -> Self {
        SessionFinalizer {
            services,
            keys: None,
            sink,
            matcher: PatternMatcher::default(),
            patterns,
            options,
        }
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn services(&self) -> &dyn ServiceLookup {
        self.services.as_ref()
    }

    /// Analyze and hand off one session. Returns whether it was stored.
    pub fn finalize(&self, pending: PendingSession) -> bool {
        let transport = pending.transport();
        let client = pending.initiator;
        let server = pending.responder();

        let Some(service) = self.services.lookup_service(
            transport,
            client.addr,
            client.port,
            server.addr,
            server.port,
        ) else {
            warn!(
                "Dropping {} session {} -> {}: no service on either port",
                transport, client, server
            );
            return false;
        };

        let mut packets = pending.packets;
        // Session bounds cover every captured packet, empty ones included.
        let (Some(started), Some(ended)) = (
            packets.first().map(|p| p.timestamp),
            packets.last().map(|p| p.timestamp),
        ) else {
            return false;
        };
        if self.options.ignore_empty_packets {
            packets.retain(|p| !p.content.is_empty());
        }
        if packets.is_empty() {
            debug!("Session {} -> {} has only empty packets, not stored", client, server);
            return false;
        }

        let (mut plaintexts, tls_decrypted) = self.decrypt(transport, &packets);

        let mut found_patterns = BTreeSet::new();
        let packets: Vec<SessionPacket> = packets
            .into_iter()
            .enumerate()
            .map(|(i, packet)| {
                let matches = self.matcher.find_matches(&packet.content, &self.patterns);
                let plaintext = plaintexts.remove(&i);
                let plaintext_matches = plaintext
                    .as_deref()
                    .map(|p| self.matcher.find_matches(p, &self.patterns))
                    .unwrap_or_default();
                found_patterns.extend(matches.iter().map(|m| m.pattern_id));
                found_patterns.extend(plaintext_matches.iter().map(|m| m.pattern_id));
                SessionPacket {
                    packet,
                    matches,
                    plaintext,
                    plaintext_matches,
                }
            })
            .collect();

        let session = Session {
            protocol: transport,
            service,
            started,
            ended,
            client,
            server,
            packets,
            found_patterns,
            favorite: false,
            tls_decrypted,
        };
        self.sink.persist_and_notify(session)
    }

    /// Plaintext per packet index, concatenated when one packet completed
    /// several records.
    fn decrypt(
        &self,
        transport: Transport,
        packets: &[CapturedPacket],
    ) -> (HashMap<usize, Vec<u8>>, bool) {
        let mut plaintexts: HashMap<usize, Vec<u8>> = HashMap::new();
        let keys = match &self.keys {
            Some(keys) if self.options.decrypt_tls && transport == Transport::Tcp => keys,
            _ => return (plaintexts, false),
        };

        match TlsDecryptor::new(keys.as_ref()).decrypt_session(packets) {
            Ok(records) => {
                for record in records {
                    plaintexts
                        .entry(record.packet_index)
                        .or_default()
                        .extend_from_slice(&record.plaintext);
                }
                (plaintexts, true)
            }
            Err(e @ (TlsError::NotStaticRsa { .. } | TlsError::Parse(_))) => {
                debug!("TLS decryption skipped: {}", e);
                (plaintexts, false)
            }
            Err(e) => {
                info!("TLS decryption failed: {}", e);
                (plaintexts, false)
            }
        }
    }
}

pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn as_unix_millis<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(unix_millis(*t))
}

pub(crate) fn as_lossy_text<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

fn as_lossy_text_opt<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(b) => as_lossy_text(b, s),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::SearchKind;
    use crate::protocol::{ParsedPacket, TcpFlags};
    use crate::reassembly::SessionTable;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    struct PortService(u16);

    impl ServiceLookup for PortService {
        fn lookup_service(&self, _t: Transport, _a: IpAddr, pa: u16, _b: IpAddr, pb: u16) -> Option<ServiceId> {
            (pa == self.0 || pb == self.0).then_some(ServiceId(1))
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Session>>);

    impl SessionSink for Collect {
        fn persist_and_notify(&self, session: Session) -> bool {
            self.0.lock().unwrap().push(session);
            true
        }
    }

    fn pending(payloads: &[&[u8]], server_port: u16) -> PendingSession {
        let local = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut table = SessionTable::new(local);
        let mut last = None;
        for (i, payload) in payloads.iter().enumerate() {
            let outbound = i % 2 == 1;
            let (src, dst, sport, dport) = if outbound {
                (local, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), server_port, 40000)
            } else {
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), local, 40000, server_port)
            };
            let pkt = ParsedPacket {
                src_ip: Some(src),
                dst_ip: Some(dst),
                src_port: Some(sport),
                dst_port: Some(dport),
                ttl: 64,
                transport: Transport::Tcp,
                payload: payload.to_vec(),
                tcp_flags: Some(TcpFlags {
                    ack: true,
                    ..TcpFlags::default()
                }),
            };
            let ts = UNIX_EPOCH + Duration::from_secs(100 + i as u64);
            last = table.process(&pkt, ts);
        }
        last.or_else(|| table.drain().pop()).unwrap()
    }

    fn finalizer(sink: Arc<Collect>, ignore_empty: bool) -> SessionFinalizer {
        let patterns = vec![Pattern {
            id: PatternId(7),
            name: "flag".into(),
            value: "FLAG{".into(),
            kind: SearchKind::Substring,
        }];
        SessionFinalizer::new(
            Arc::new(PortService(8080)),
            sink,
            Arc::new(patterns),
            FinalizerOptions {
                ignore_empty_packets: ignore_empty,
                decrypt_tls: true,
            },
        )
    }

    #[test]
    fn builds_session_with_matches() {
        let sink = Arc::new(Collect::default());
        let stored = finalizer(sink.clone(), false).finalize(pending(&[b"give", b"FLAG{abc}", b""], 8080));
        assert!(stored);

        let sessions = sink.0.lock().unwrap();
        let s = &sessions[0];
        assert_eq!(s.service, ServiceId(1));
        assert_eq!(s.client.port, 40000);
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.packets.len(), 3);
        assert_eq!(s.found_patterns.iter().copied().collect::<Vec<_>>(), vec![PatternId(7)]);
        assert_eq!(s.packets[1].matches.len(), 1);
        assert_eq!(unix_millis(s.started), 100_000);
        assert_eq!(unix_millis(s.ended), 102_000);
        assert!(!s.favorite);
        assert!(!s.tls_decrypted);
    }

    #[test]
    fn unknown_service_is_not_stored() {
        let sink = Arc::new(Collect::default());
        assert!(!finalizer(sink.clone(), false).finalize(pending(&[b"x"], 9999)));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_packets_dropped_when_configured() {
        let sink = Arc::new(Collect::default());
        let f = finalizer(sink.clone(), true);
        assert!(f.finalize(pending(&[b"a", b"", b"b"], 8080)));
        assert!(!f.finalize(pending(&[b"", b""], 8080)));
        let sessions = sink.0.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].packets.len(), 2);
    }

    #[test]
    fn bounds_include_dropped_empty_packets() {
        let sink = Arc::new(Collect::default());
        let f = finalizer(sink.clone(), true);
        assert!(f.finalize(pending(&[b"", b"a", b"b", b""], 8080)));
        let sessions = sink.0.lock().unwrap();
        assert_eq!(sessions[0].packets.len(), 2);
        assert_eq!(unix_millis(sessions[0].started), 100_000);
        assert_eq!(unix_millis(sessions[0].ended), 103_000);
    }

    #[test]
    fn session_serializes_to_json() {
        let sink = Arc::new(Collect::default());
        finalizer(sink.clone(), false).finalize(pending(&[b"hi FLAG{x}"], 8080));
        let json = serde_json::to_value(&sink.0.lock().unwrap()[0]).unwrap();
        assert_eq!(json["protocol"], "tcp");
        assert_eq!(json["service"], 1);
        assert_eq!(json["started"], 100_000);
        assert_eq!(json["packets"][0]["content"], "hi FLAG{x}");
        assert_eq!(json["packets"][0]["incoming"], true);
        assert_eq!(json["packets"][0]["matches"][0]["start"], 3);
        assert!(json["packets"][0].get("plaintext").is_none());
        assert_eq!(json["found_patterns"][0], 7);
    }
}
