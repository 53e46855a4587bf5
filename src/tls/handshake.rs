use ring::hmac;
use tls_parser::{TlsCipherSuite, TlsVersion};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use super::TlsError;
use super::record::{HandshakeMessage, RecordBody, TlsRecord};

const EXT_ENCRYPT_THEN_MAC: u16 = 0x0016;
const EXT_EXTENDED_MASTER_SECRET: u16 = 0x0017;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    pub fn hmac(self) -> hmac::Algorithm {
        match self {
            HashAlgorithm::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            HashAlgorithm::Sha256 => hmac::HMAC_SHA256,
            HashAlgorithm::Sha384 => hmac::HMAC_SHA384,
        }
    }
}

/// Parameters of a static-RSA TLS 1.2 cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub cipher: BulkCipher,
    /// Record MAC; `None` for AEAD suites.
    pub mac: Option<HashAlgorithm>,
    pub prf: HashAlgorithm,
}

impl CipherSuite {
    pub fn key_len(&self) -> usize {
        match self.cipher {
            BulkCipher::Aes128Cbc | BulkCipher::Aes128Gcm => 16,
            BulkCipher::Aes256Cbc | BulkCipher::Aes256Gcm => 32,
        }
    }

    pub fn mac_len(&self) -> usize {
        self.mac.map_or(0, HashAlgorithm::output_len)
    }

    /// Key-block IV length: a full block for CBC, the implicit salt for GCM.
    pub fn iv_len(&self) -> usize {
        if self.is_aead() { 4 } else { 16 }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self.cipher, BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm)
    }

    pub fn key_block_len(&self) -> usize {
        2 * self.mac_len() + 2 * self.key_len() + 2 * self.iv_len()
    }

    pub fn name(&self) -> &'static str {
        suite_name(self.id)
    }
}

/// Map a cipher suite id to its parameters, if it is a supported static-RSA suite.
pub fn static_rsa_suite(id: u16) -> Option<CipherSuite> {
    use BulkCipher::*;
    use HashAlgorithm::*;

    let (cipher, mac, prf) = match id {
        0x002F => (Aes128Cbc, Some(Sha1), Sha256), // TLS_RSA_WITH_AES_128_CBC_SHA
        0x0035 => (Aes256Cbc, Some(Sha1), Sha256), // TLS_RSA_WITH_AES_256_CBC_SHA
        0x003C => (Aes128Cbc, Some(Sha256), Sha256), // TLS_RSA_WITH_AES_128_CBC_SHA256
        0x003D => (Aes256Cbc, Some(Sha256), Sha256), // TLS_RSA_WITH_AES_256_CBC_SHA256
        0x009C => (Aes128Gcm, None, Sha256),       // TLS_RSA_WITH_AES_128_GCM_SHA256
        0x009D => (Aes256Gcm, None, Sha384),       // TLS_RSA_WITH_AES_256_GCM_SHA384
        _ => return None,
    };
    Some(CipherSuite {
        id,
        cipher,
        mac,
        prf,
    })
}

pub fn suite_name(id: u16) -> &'static str {
    TlsCipherSuite::from_id(id).map_or("unknown", |s| s.name)
}

/// Handshake parameters needed to recover the session keys.
#[derive(Debug)]
pub(crate) struct HandshakeParams {
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub version: u16,
    pub cipher_suite: u16,
    pub server_extensions: Vec<u16>,
    pub certificate: Option<Vec<u8>>,
    pub client_key_exchange: Option<Vec<u8>>,
}

impl HandshakeParams {
    /// Collect hello randoms, negotiated parameters, the leaf certificate and
    /// the ClientKeyExchange body from a session's plaintext handshake.
    pub fn collect<'a>(records: impl IntoIterator<Item = &'a TlsRecord>) -> Result<Self, TlsError> {
        let mut client_hello = None;
        let mut server_hello = None;
        let mut certificate = None;
        let mut client_key_exchange = None;

        let messages = records.into_iter().flat_map(|r| match &r.body {
            RecordBody::Handshake(msgs) => msgs.as_slice(),
            _ => &[][..],
        });

        for msg in messages {
            match msg {
                HandshakeMessage::ClientHello { random, .. } => {
                    if client_hello.replace(*random).is_some() {
                        return Err(TlsError::DuplicateHandshake("ClientHello"));
                    }
                }
                HandshakeMessage::ServerHello {
                    version,
                    random,
                    cipher_suite,
                    extensions,
                } => {
                    let hello = (*random, *version, *cipher_suite, extensions.clone());
                    if server_hello.replace(hello).is_some() {
                        return Err(TlsError::DuplicateHandshake("ServerHello"));
                    }
                }
                HandshakeMessage::Certificate { chain } => {
                    if certificate.is_none() {
                        certificate = chain.first().cloned();
                    }
                }
                HandshakeMessage::ClientKeyExchange { body } => {
                    if client_key_exchange.is_none() {
                        client_key_exchange = Some(body.clone());
                    }
                }
                HandshakeMessage::Opaque { .. } => {}
            }
        }

        let client_random = client_hello.ok_or(TlsError::MissingHandshake("ClientHello"))?;
        let (server_random, version, cipher_suite, server_extensions) =
            server_hello.ok_or(TlsError::MissingHandshake("ServerHello"))?;

        Ok(HandshakeParams {
            client_random,
            server_random,
            version,
            cipher_suite,
            server_extensions,
            certificate,
            client_key_exchange,
        })
    }

    /// Check the negotiated parameters against what passive decryption supports.
    pub fn negotiated_suite(&self) -> Result<CipherSuite, TlsError> {
        let suite = static_rsa_suite(self.cipher_suite).ok_or(TlsError::NotStaticRsa {
            id: self.cipher_suite,
            name: suite_name(self.cipher_suite),
        })?;
        if self.version != TlsVersion::Tls12.0 {
            return Err(TlsError::UnsupportedVersion(self.version));
        }
        if self.server_extensions.contains(&EXT_EXTENDED_MASTER_SECRET) {
            return Err(TlsError::UnsupportedExtension("extended_master_secret"));
        }
        if self.server_extensions.contains(&EXT_ENCRYPT_THEN_MAC) {
            return Err(TlsError::UnsupportedExtension("encrypt_then_mac"));
        }
        Ok(suite)
    }

    /// The RSA-encrypted pre-master secret, without its length prefix.
    pub fn encrypted_pre_master(&self) -> Result<&[u8], TlsError> {
        let body = self
            .client_key_exchange
            .as_deref()
            .ok_or(TlsError::MissingHandshake("ClientKeyExchange"))?;
        match body {
            [hi, lo, rest @ ..] if u16::from_be_bytes([*hi, *lo]) as usize == rest.len() => Ok(rest),
            _ => Err(TlsError::Parse("malformed ClientKeyExchange")),
        }
    }

    /// Modulus of the server's RSA public key, without leading zero bytes.
    pub fn server_modulus(&self) -> Result<Vec<u8>, TlsError> {
        let der = self
            .certificate
            .as_deref()
            .ok_or(TlsError::MissingHandshake("Certificate"))?;
        rsa_modulus(der)
    }
}

pub(crate) fn rsa_modulus(der: &[u8]) -> Result<Vec<u8>, TlsError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|_| TlsError::Parse("invalid server certificate"))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(key)) => Ok(strip_leading_zeros(key.modulus).to_vec()),
        _ => Err(TlsError::Parse("server certificate has no RSA key")),
    }
}

pub(crate) fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
