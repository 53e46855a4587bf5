pub mod decrypt;
pub mod handshake;
pub mod keys;
pub mod record;

use log::debug;
use rsa::Pkcs1v15Encrypt;
use tls_parser::TlsRecordType;
use zeroize::Zeroize;

use crate::reassembly::CapturedPacket;
use decrypt::{RecordCipher, derive_key_block, derive_master_secret};
use handshake::HandshakeParams;
pub use keys::{KeyStore, RsaKeyStore};
use record::{RecordBody, RecordStream, TlsRecord};

const PRE_MASTER_LEN: usize = 48;

/// Why a session could not be decrypted. Every variant is confined to the
/// session it was raised for.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("malformed TLS data: {0}")]
    Parse(&'static str),
    #[error("missing {0}")]
    MissingHandshake(&'static str),
    #[error("more than one {0}")]
    DuplicateHandshake(&'static str),
    #[error("cipher suite {name} ({id:#06x}) is not static RSA")]
    NotStaticRsa { id: u16, name: &'static str },
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("unsupported extension {0}")]
    UnsupportedExtension(&'static str),
    #[error("no private key matches the server certificate")]
    KeyNotFound,
    #[error("RSA decryption of the pre-master secret failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("pre-master secret has {0} bytes, expected 48")]
    PreMasterLength(usize),
    #[error("record MAC verification failed")]
    BadMac,
    #[error("invalid CBC padding")]
    BadPadding,
    #[error("invalid key material")]
    InvalidKey,
    #[error("record sequence number overflow")]
    SequenceOverflow,
}

/// Plaintext of one application-data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRecord {
    /// Index of the packet in which the record completed.
    pub packet_index: usize,
    /// True for client-to-server records.
    pub incoming: bool,
    pub plaintext: Vec<u8>,
}

struct SessionRecord {
    packet_index: usize,
    incoming: bool,
    record: TlsRecord,
}

/// Recovers the plaintext of static-RSA TLS 1.2 sessions from captured
/// handshake bytes and the server's private key.
pub struct TlsDecryptor<'a> {
    keys: &'a dyn KeyStore,
}

impl<'a> TlsDecryptor<'a> {
    pub fn new(keys: &'a dyn KeyStore) -> Self {
        TlsDecryptor { keys }
    }

    /// Decrypt every application-data record of a completed session.
    pub fn decrypt_session(
        &self,
        packets: &[CapturedPacket],
    ) -> Result<Vec<DecryptedRecord>, TlsError> {
        let records = split_records(packets)?;

        let params = HandshakeParams::collect(records.iter().map(|r| &r.record))?;
        let suite = params.negotiated_suite()?;
        debug!("Negotiated {} ({:#06x})", suite.name(), suite.id);

        let modulus = params.server_modulus()?;
        let key = self
            .keys
            .lookup_rsa_key(&modulus)
            .ok_or(TlsError::KeyNotFound)?;

        let mut pre_master = key.decrypt(Pkcs1v15Encrypt, params.encrypted_pre_master()?)?;
        if pre_master.len() != PRE_MASTER_LEN {
            let len = pre_master.len();
            pre_master.zeroize();
            return Err(TlsError::PreMasterLength(len));
        }
        let mut master = derive_master_secret(
            &pre_master,
            &params.client_random,
            &params.server_random,
            suite.prf.hmac(),
        );
        pre_master.zeroize();
        let block = derive_key_block(
            &master,
            &params.client_random,
            &params.server_random,
            &suite,
        );
        master.zeroize();

        let mut client = RecordCipher::new(&suite, &block, true)?;
        let mut server = RecordCipher::new(&suite, &block, false)?;

        let mut decrypted = Vec::new();
        for entry in &records {
            let fragment = match &entry.record.body {
                RecordBody::ApplicationData(f) | RecordBody::Encrypted(f) => f,
                _ => continue,
            };
            let cipher = if entry.incoming { &mut client } else { &mut server };
            let plaintext = cipher.decrypt(
                entry.record.content_type.0,
                entry.record.version.0,
                fragment,
            )?;
            // Finished and encrypted alerts only advance the cipher state.
            if entry.record.content_type == TlsRecordType::ApplicationData {
                decrypted.push(DecryptedRecord {
                    packet_index: entry.packet_index,
                    incoming: entry.incoming,
                    plaintext,
                });
            }
        }

        debug!(
            "Decrypted {} application records ({} client, {} server)",
            decrypted.len(),
            client.seq_num(),
            server.seq_num()
        );
        Ok(decrypted)
    }
}

/// Run each direction's payloads through its own record stream, keeping
/// capture order across directions.
fn split_records(packets: &[CapturedPacket]) -> Result<Vec<SessionRecord>, TlsError> {
    let mut from_client = RecordStream::new();
    let mut from_server = RecordStream::new();
    let mut records = Vec::new();

    for (packet_index, packet) in packets.iter().enumerate() {
        if packet.content.is_empty() {
            continue;
        }
        let stream = if packet.incoming {
            &mut from_client
        } else {
            &mut from_server
        };
        for record in stream.feed(&packet.content)? {
            records.push(SessionRecord {
                packet_index,
                incoming: packet.incoming,
                record,
            });
        }
    }

    Ok(records)
}
