use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use ring::aead::{self, LessSafeKey, UnboundKey};
use ring::hmac;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::TlsError;
use super::handshake::{BulkCipher, CipherSuite};

const AES_BLOCK: usize = 16;
const GCM_EXPLICIT_NONCE: usize = 8;
const GCM_TAG: usize = 16;

/// Derived encryption keys for one direction of an AES-GCM connection.
///
/// **Security note:** The IV is zeroized on drop, but `ring::aead::LessSafeKey`
/// does not expose the underlying key bytes or implement `Zeroize`, so the
/// actual encryption key material will persist in memory until the page is
/// reused by the allocator. This is a known limitation of the `ring` crate.
pub struct DirectionKeys {
    key: LessSafeKey,
    iv: [u8; 12],
    seq: u64,
}

impl DirectionKeys {
    pub fn new(
        key_bytes: &[u8],
        iv_bytes: &[u8; 12],
        algo: &'static aead::Algorithm,
    ) -> Result<Self, TlsError> {
        let unbound = UnboundKey::new(algo, key_bytes).map_err(|_| TlsError::InvalidKey)?;
        Ok(DirectionKeys {
            key: LessSafeKey::new(unbound),
            iv: *iv_bytes,
            seq: 0,
        })
    }

    /// Get current sequence number (for TLS 1.2 AAD construction).
    pub fn seq_num(&self) -> u64 {
        self.seq
    }

    /// Decrypt a TLS 1.2 GCM record with explicit nonce.
    /// The full nonce is: implicit_iv[0..4] || explicit_nonce[0..8].
    pub fn decrypt_tls12_record(
        &mut self,
        ciphertext: &mut [u8],
        additional_data: &[u8],
        explicit_nonce: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        if self.seq == u64::MAX {
            return Err(TlsError::SequenceOverflow);
        }
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.iv[..4]);
        let copy_len = explicit_nonce.len().min(8);
        nonce[4..4 + copy_len].copy_from_slice(&explicit_nonce[..copy_len]);

        let nonce =
            aead::Nonce::try_assume_unique_for_key(&nonce).map_err(|_| TlsError::InvalidKey)?;
        let aad = aead::Aad::from(additional_data);

        let plaintext = self
            .key
            .open_in_place(nonce, aad, ciphertext)
            .map_err(|_| TlsError::BadMac)?;

        // Only advance sequence number on successful decryption
        self.seq += 1;

        Ok(plaintext.to_vec())
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

enum CbcState {
    Aes128(cbc::Decryptor<Aes128>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl CbcState {
    fn new(cipher: BulkCipher, key: &[u8], iv: &[u8]) -> Result<Self, TlsError> {
        let state = match cipher {
            BulkCipher::Aes128Cbc => CbcState::Aes128(
                cbc::Decryptor::new_from_slices(key, iv).map_err(|_| TlsError::InvalidKey)?,
            ),
            BulkCipher::Aes256Cbc => CbcState::Aes256(
                cbc::Decryptor::new_from_slices(key, iv).map_err(|_| TlsError::InvalidKey)?,
            ),
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => return Err(TlsError::InvalidKey),
        };
        Ok(state)
    }

    /// Decrypt whole blocks in place; the chaining value carries over to the
    /// next call.
    fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(AES_BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                CbcState::Aes128(d) => d.decrypt_block_mut(block),
                CbcState::Aes256(d) => d.decrypt_block_mut(block),
            }
        }
    }
}

/// AES-CBC with HMAC record protection for one direction.
pub struct CbcKeys {
    state: CbcState,
    mac_key: hmac::Key,
    mac_len: usize,
    seq: u64,
}

impl CbcKeys {
    pub fn seq_num(&self) -> u64 {
        self.seq
    }

    /// Decrypt one CBC record: drop the explicit IV block, check and strip
    /// the padding, verify and strip the MAC.
    fn decrypt_record(
        &mut self,
        content_type: u8,
        version: u16,
        fragment: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        if self.seq == u64::MAX {
            return Err(TlsError::SequenceOverflow);
        }
        if fragment.len() % AES_BLOCK != 0 || fragment.len() < 2 * AES_BLOCK {
            return Err(TlsError::Parse("CBC fragment not block aligned"));
        }

        let mut buf = fragment.to_vec();
        self.state.decrypt_blocks(&mut buf);
        let mut plain = buf.split_off(AES_BLOCK);
        buf.zeroize();

        let pad = plain[plain.len() - 1] as usize;
        if pad + 1 + self.mac_len > plain.len() {
            plain.zeroize();
            return Err(TlsError::BadPadding);
        }
        let pad_start = plain.len() - pad - 1;
        if plain[pad_start..].iter().any(|&b| b as usize != pad) {
            plain.zeroize();
            return Err(TlsError::BadPadding);
        }
        plain.truncate(pad_start);

        let content_len = plain.len() - self.mac_len;
        let mut mac_input = Vec::with_capacity(13 + content_len);
        mac_input.extend_from_slice(&self.seq.to_be_bytes());
        mac_input.push(content_type);
        mac_input.extend_from_slice(&version.to_be_bytes());
        mac_input.extend_from_slice(&(content_len as u16).to_be_bytes());
        mac_input.extend_from_slice(&plain[..content_len]);
        let verified = hmac::verify(&self.mac_key, &mac_input, &plain[content_len..]);
        mac_input.zeroize();
        if verified.is_err() {
            plain.zeroize();
            return Err(TlsError::BadMac);
        }

        self.seq += 1;
        plain.truncate(content_len);
        Ok(plain)
    }
}

/// Stateful record decryptor for one direction of a session.
pub enum RecordCipher {
    Cbc(CbcKeys),
    Gcm(DirectionKeys),
}

impl RecordCipher {
    /// Build the decryptor for the client-to-server (`from_client`) or
    /// server-to-client direction from the session key block.
    pub fn new(suite: &CipherSuite, block: &KeyBlock, from_client: bool) -> Result<Self, TlsError> {
        let (mac, key, iv) = if from_client {
            (&block.client_mac, &block.client_key, &block.client_iv)
        } else {
            (&block.server_mac, &block.server_key, &block.server_iv)
        };

        match suite.cipher {
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => {
                let algo = if suite.cipher == BulkCipher::Aes128Gcm {
                    &aead::AES_128_GCM
                } else {
                    &aead::AES_256_GCM
                };
                let mut implicit = [0u8; 12];
                implicit[..4].copy_from_slice(&iv[..4]);
                let keys = DirectionKeys::new(key, &implicit, algo);
                implicit.zeroize();
                Ok(RecordCipher::Gcm(keys?))
            }
            BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => {
                let hash = suite.mac.ok_or(TlsError::InvalidKey)?;
                Ok(RecordCipher::Cbc(CbcKeys {
                    state: CbcState::new(suite.cipher, key, iv)?,
                    mac_key: hmac::Key::new(hash.hmac(), mac),
                    mac_len: suite.mac_len(),
                    seq: 0,
                }))
            }
        }
    }

    /// Decrypt one protected record fragment and return its plaintext.
    pub fn decrypt(
        &mut self,
        content_type: u8,
        version: u16,
        fragment: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        match self {
            RecordCipher::Cbc(keys) => keys.decrypt_record(content_type, version, fragment),
            RecordCipher::Gcm(keys) => {
                if fragment.len() < GCM_EXPLICIT_NONCE + GCM_TAG {
                    return Err(TlsError::Parse("GCM fragment too short"));
                }
                let (explicit_nonce, sealed) = fragment.split_at(GCM_EXPLICIT_NONCE);
                let mut ciphertext = sealed.to_vec();
                let aad = record_aad(
                    keys.seq_num(),
                    content_type,
                    version,
                    ciphertext.len() - GCM_TAG,
                );
                keys.decrypt_tls12_record(&mut ciphertext, &aad, explicit_nonce)
            }
        }
    }

    pub fn seq_num(&self) -> u64 {
        match self {
            RecordCipher::Cbc(keys) => keys.seq_num(),
            RecordCipher::Gcm(keys) => keys.seq_num(),
        }
    }
}

/// seq(8) + type(1) + version(2) + length(2)
fn record_aad(seq: u64, content_type: u8, version: u16, len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = content_type;
    aad[9..11].copy_from_slice(&version.to_be_bytes());
    aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}

/// Per-direction MAC keys, write keys and IVs, in RFC 5246 key-block order.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyBlock {
    pub client_mac: Vec<u8>,
    pub server_mac: Vec<u8>,
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_iv: Vec<u8>,
    pub server_iv: Vec<u8>,
}

/// master_secret = PRF(pre_master_secret, "master secret", client_random + server_random)[0..48]
pub fn derive_master_secret(
    pre_master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    prf: hmac::Algorithm,
) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    tls12_prf(pre_master, b"master secret", &seed, 48, prf)
}

/// Derive the key block for `suite` from the master secret.
pub fn derive_key_block(
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    suite: &CipherSuite,
) -> KeyBlock {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);

    // key_block = PRF(master_secret, "key expansion", server_random + client_random)
    let mut material = tls12_prf(
        master_secret,
        b"key expansion",
        &seed,
        suite.key_block_len(),
        suite.prf.hmac(),
    );

    let mut rest = material.as_slice();
    let mut take = |n: usize| {
        let (head, tail) = rest.split_at(n);
        rest = tail;
        head.to_vec()
    };
    let (mac_len, key_len, iv_len) = (suite.mac_len(), suite.key_len(), suite.iv_len());
    let block = KeyBlock {
        client_mac: take(mac_len),
        server_mac: take(mac_len),
        client_key: take(key_len),
        server_key: take(key_len),
        client_iv: take(iv_len),
        server_iv: take(iv_len),
    };
    material.zeroize();
    block
}

/// TLS 1.2 PRF (RFC 5246 Section 5).
/// `algo` selects the HMAC: SHA-256 for most suites, SHA-384 for AES-256-GCM.
pub(crate) fn tls12_prf(
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out_len: usize,
    algo: hmac::Algorithm,
) -> Vec<u8> {
    let key = hmac::Key::new(algo, secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    // A(0) = label_seed, A(i) = HMAC(secret, A(i-1))
    let mut a = hmac::sign(&key, &label_seed).as_ref().to_vec();
    let mut result = Vec::with_capacity(out_len);

    while result.len() < out_len {
        let mut input = Vec::with_capacity(a.len() + label_seed.len());
        input.extend_from_slice(&a);
        input.extend_from_slice(&label_seed);
        result.extend_from_slice(hmac::sign(&key, &input).as_ref());
        let new_a = hmac::sign(&key, &a).as_ref().to_vec();
        a.zeroize();
        a = new_a;
        input.zeroize();
    }

    label_seed.zeroize();
    a.zeroize();
    result.truncate(out_len);
    result
}
