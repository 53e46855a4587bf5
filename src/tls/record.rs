use tls_parser::{TlsRecordType, TlsVersion, parse_tls_raw_record};

use super::TlsError;

pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;
pub const HANDSHAKE_CERTIFICATE: u8 = 11;
pub const HANDSHAKE_CLIENT_KEY_EXCHANGE: u8 = 16;

const RECORD_HEADER_LEN: usize = 5;
const MAX_BUFFER_BYTES: usize = 262_144; // 256 KB per direction buffer

/// One TLS record with its body decoded according to the content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRecord {
    pub content_type: TlsRecordType,
    pub version: TlsVersion,
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    ChangeCipherSpec,
    Alert { level: u8, description: u8 },
    Handshake(Vec<HandshakeMessage>),
    /// Application data is always protected; this is the raw fragment.
    ApplicationData(Vec<u8>),
    Heartbeat { kind: u8, payload: Vec<u8> },
    /// Handshake/alert/heartbeat fragment sent after ChangeCipherSpec.
    Encrypted(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello {
        version: u16,
        random: [u8; 32],
        cipher_suites: Vec<u16>,
        extensions: Vec<u16>,
    },
    ServerHello {
        version: u16,
        random: [u8; 32],
        cipher_suite: u16,
        extensions: Vec<u16>,
    },
    /// DER certificates, leaf first.
    Certificate { chain: Vec<Vec<u8>> },
    /// Key-exchange specific body, decoded once the suite is known.
    ClientKeyExchange { body: Vec<u8> },
    Opaque { msg_type: u8, body: Vec<u8> },
}

impl HandshakeMessage {
    pub fn msg_type(&self) -> u8 {
        match self {
            HandshakeMessage::ClientHello { .. } => HANDSHAKE_CLIENT_HELLO,
            HandshakeMessage::ServerHello { .. } => HANDSHAKE_SERVER_HELLO,
            HandshakeMessage::Certificate { .. } => HANDSHAKE_CERTIFICATE,
            HandshakeMessage::ClientKeyExchange { .. } => HANDSHAKE_CLIENT_KEY_EXCHANGE,
            HandshakeMessage::Opaque { msg_type, .. } => *msg_type,
        }
    }
}

/// Reassembles one direction of a TLS byte stream into records.
///
/// Bytes that do not yet form a complete record are kept until the next
/// `feed`. Once a ChangeCipherSpec went by, every later non-application
/// record is returned as `RecordBody::Encrypted`.
#[derive(Debug, Default)]
pub struct RecordStream {
    buffer: Vec<u8>,
    cipher_active: bool,
}

impl RecordStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every record it completes.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<TlsRecord>, TlsError> {
        if self.buffer.len() + data.len() > MAX_BUFFER_BYTES {
            return Err(TlsError::Parse("record buffer limit exceeded"));
        }
        self.buffer.extend_from_slice(data);

        let mut records = Vec::new();
        let mut offset = 0;

        while self.buffer.len() - offset >= RECORD_HEADER_LEN {
            let remaining = &self.buffer[offset..];

            if !(0x14..=0x18).contains(&remaining[0]) {
                return Err(TlsError::Parse("invalid record content type"));
            }
            let body_len = u16::from_be_bytes([remaining[3], remaining[4]]) as usize;
            if remaining.len() < RECORD_HEADER_LEN + body_len {
                break;
            }

            let (_, raw) = parse_tls_raw_record(remaining)
                .map_err(|_| TlsError::Parse("invalid record header"))?;
            let record_type = raw.hdr.record_type;
            let body = decode_body(record_type, raw.data, self.cipher_active)?;
            if record_type == TlsRecordType::ChangeCipherSpec {
                self.cipher_active = true;
            }
            records.push(TlsRecord {
                content_type: record_type,
                version: raw.hdr.version,
                body,
            });

            offset += RECORD_HEADER_LEN + body_len;
        }

        self.buffer.drain(..offset);
        Ok(records)
    }

    /// Bytes held back waiting for the rest of a record.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn cipher_active(&self) -> bool {
        self.cipher_active
    }
}

fn decode_body(
    record_type: TlsRecordType,
    data: &[u8],
    cipher_active: bool,
) -> Result<RecordBody, TlsError> {
    if record_type == TlsRecordType::ApplicationData {
        return Ok(RecordBody::ApplicationData(data.to_vec()));
    }
    if record_type == TlsRecordType::ChangeCipherSpec {
        return match data {
            [1] => Ok(RecordBody::ChangeCipherSpec),
            _ => Err(TlsError::Parse("malformed ChangeCipherSpec")),
        };
    }
    if cipher_active {
        return Ok(RecordBody::Encrypted(data.to_vec()));
    }

    match record_type {
        TlsRecordType::Alert => match data {
            [level, description] => Ok(RecordBody::Alert {
                level: *level,
                description: *description,
            }),
            _ => Err(TlsError::Parse("malformed alert")),
        },
        TlsRecordType::Heartbeat => {
            let mut r = Reader::new(data);
            let kind = r.u8()?;
            let len = r.u16()? as usize;
            let payload = r.take(len)?.to_vec();
            Ok(RecordBody::Heartbeat { kind, payload })
        }
        _ => parse_handshake_messages(data).map(RecordBody::Handshake),
    }
}

/// Split a plaintext handshake record into messages. A message may not
/// extend past the end of its record.
pub fn parse_handshake_messages(data: &[u8]) -> Result<Vec<HandshakeMessage>, TlsError> {
    let mut r = Reader::new(data);
    let mut messages = Vec::new();
    while !r.is_empty() {
        let msg_type = r.u8()?;
        let len = r.u24()?;
        let body = r
            .take(len)
            .map_err(|_| TlsError::Parse("handshake message overruns record"))?;
        messages.push(parse_handshake_body(msg_type, body)?);
    }
    Ok(messages)
}

fn parse_handshake_body(msg_type: u8, body: &[u8]) -> Result<HandshakeMessage, TlsError> {
    let mut r = Reader::new(body);
    match msg_type {
        HANDSHAKE_CLIENT_HELLO => {
            let version = r.u16()?;
            let random = r.random()?;
            r.vec8()?; // session id
            let suites = r.vec16()?;
            if suites.len() % 2 != 0 {
                return Err(TlsError::Parse("odd cipher suite list"));
            }
            let cipher_suites = suites
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            r.vec8()?; // compression methods
            let extensions = r.extensions()?;
            Ok(HandshakeMessage::ClientHello {
                version,
                random,
                cipher_suites,
                extensions,
            })
        }
        HANDSHAKE_SERVER_HELLO => {
            let version = r.u16()?;
            let random = r.random()?;
            r.vec8()?;
            let cipher_suite = r.u16()?;
            r.u8()?;
            let extensions = r.extensions()?;
            Ok(HandshakeMessage::ServerHello {
                version,
                random,
                cipher_suite,
                extensions,
            })
        }
        HANDSHAKE_CERTIFICATE => {
            let list_len = r.u24()?;
            let mut list = Reader::new(r.take(list_len)?);
            let mut chain = Vec::new();
            while !list.is_empty() {
                let len = list.u24()?;
                chain.push(list.take(len)?.to_vec());
            }
            Ok(HandshakeMessage::Certificate { chain })
        }
        HANDSHAKE_CLIENT_KEY_EXCHANGE => Ok(HandshakeMessage::ClientKeyExchange {
            body: body.to_vec(),
        }),
        _ => Ok(HandshakeMessage::Opaque {
            msg_type,
            body: body.to_vec(),
        }),
    }
}

/// Big-endian cursor over a handshake body.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TlsError> {
        if self.data.len() < n {
            return Err(TlsError::Parse("truncated handshake field"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, TlsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TlsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, TlsError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn vec8(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn vec16(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn random(&mut self) -> Result<[u8; 32], TlsError> {
        let mut random = [0u8; 32];
        random.copy_from_slice(self.take(32)?);
        Ok(random)
    }

    /// Extension type ids of an optional hello extension block.
    fn extensions(&mut self) -> Result<Vec<u16>, TlsError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let mut block = Reader::new(self.vec16()?);
        let mut ids = Vec::new();
        while !block.is_empty() {
            ids.push(block.u16()?);
            block.vec16()?;
        }
        Ok(ids)
    }
}
