use anyhow::{Context, Result};
use log::{debug, info, warn};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use std::collections::HashMap;
use std::path::Path;

use super::handshake::strip_leading_zeros;

/// Source of server RSA private keys, looked up by public modulus.
pub trait KeyStore: Send + Sync {
    /// `modulus` is big-endian without leading zero bytes.
    fn lookup_rsa_key(&self, modulus: &[u8]) -> Option<&RsaPrivateKey>;
}

/// RSA private keys loaded from PEM files, indexed by modulus.
#[derive(Default)]
pub struct RsaKeyStore {
    keys: HashMap<Vec<u8>, RsaPrivateKey>,
}

impl RsaKeyStore {
    /// Maximum key file size (1 MB); anything larger is not a PEM key.
    const MAX_KEY_FILE_SIZE: u64 = 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn insert(&mut self, key: RsaPrivateKey) {
        let modulus = key.n().to_bytes_be();
        self.keys
            .insert(strip_leading_zeros(&modulus).to_vec(), key);
    }

    /// Load every `*.pem` / `*.key` file in `dir`. Files that do not hold an
    /// RSA private key are skipped with a warning.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut store = RsaKeyStore::new();
        let entries = std::fs::read_dir(dir)
            .context(format!("Failed to read keys directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry
                .context(format!("Failed to list keys directory: {}", dir.display()))?
                .path();
            let is_key_file = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "pem" || e == "key");
            if !is_key_file {
                debug!("Skipping {}", path.display());
                continue;
            }
            match Self::read_key(&path) {
                Ok(key) => store.insert(key),
                Err(e) => warn!("Skipping key file {}: {:#}", path.display(), e),
            }
        }

        info!("Loaded {} RSA key(s) from {}", store.len(), dir.display());
        Ok(store)
    }

    /// Parse a PKCS#8 or PKCS#1 PEM private key.
    pub fn read_key(path: &Path) -> Result<RsaPrivateKey> {
        let meta = std::fs::metadata(path)
            .context(format!("Failed to stat key file: {}", path.display()))?;
        if meta.len() > Self::MAX_KEY_FILE_SIZE {
            anyhow::bail!(
                "Key file too large ({} bytes, max {}): {}",
                meta.len(),
                Self::MAX_KEY_FILE_SIZE,
                path.display()
            );
        }
        let pem = std::fs::read_to_string(path)
            .context(format!("Failed to read key file: {}", path.display()))?;
        parse_pem(&pem)
    }
}

pub fn parse_pem(pem: &str) -> Result<RsaPrivateKey> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs1_pem(pem).context("Not a PKCS#8 or PKCS#1 RSA private key")
}

impl KeyStore for RsaKeyStore {
    fn lookup_rsa_key(&self, modulus: &[u8]) -> Option<&RsaPrivateKey> {
        self.keys.get(modulus)
    }
}
