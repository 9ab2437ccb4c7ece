use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use acorn_core::{AcornError, AcornResult, Root, RootContext};

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"acorn/aes-256-gcm";

/// Cumulative counters for one encryption root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptionStats {
    pub encrypt_ops: u64,
    pub decrypt_ops: u64,
    pub errors: u64,
}

/// AES-256-GCM root. Sits in the 200-299 band so it runs after compression
/// on stash and before it on crack. A fresh random nonce is prefixed to
/// every ciphertext.
pub struct EncryptionRoot {
    sequence: u32,
    cipher: Aes256Gcm,
    key_label: &'static str,
    encrypt_ops: AtomicU64,
    decrypt_ops: AtomicU64,
    errors: AtomicU64,
}

impl EncryptionRoot {
    /// Root from an explicit 256-bit key.
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self::build(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)), "key")
    }

    /// Root with the key derived from a password and salt via HKDF-SHA256.
    pub fn from_password(password: &str, salt: &[u8]) -> AcornResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| AcornError::Serialization(format!("key derivation: {e}")))?;
        Ok(Self::build(
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            "password",
        ))
    }

    fn build(cipher: Aes256Gcm, key_label: &'static str) -> Self {
        EncryptionRoot {
            sequence: 200,
            cipher,
            key_label,
            encrypt_ops: AtomicU64::new(0),
            decrypt_ops: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn stats(&self) -> EncryptionStats {
        EncryptionStats {
            encrypt_ops: self.encrypt_ops.load(Ordering::Relaxed),
            decrypt_ops: self.decrypt_ops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn fail(&self, what: &str) -> AcornError {
        self.errors.fetch_add(1, Ordering::Relaxed);
        AcornError::Serialization(format!("aes-256-gcm: {what}"))
    }
}

impl Root for EncryptionRoot {
    fn name(&self) -> &str {
        "aes-256-gcm"
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn signature(&self) -> String {
        format!("aes-256-gcm({})#{}", self.key_label, self.sequence)
    }

    fn on_stash(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, bytes)
            .map_err(|_| self.fail("encryption failed"))?;
        self.encrypt_ops.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn on_crack(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        if bytes.len() < NONCE_LEN {
            return Err(self.fail("ciphertext shorter than nonce"));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| self.fail("decryption failed"))?;
        self.decrypt_ops.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acorn_core::RootOp;

    #[test]
    fn round_trip_with_explicit_key() {
        let root = EncryptionRoot::from_key(&[7u8; 32]);
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let sealed = root.on_stash(b"plaintext", &mut ctx).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"plaintext");

        let mut ctx = RootContext::new("k", RootOp::Crack);
        let opened = root.on_crack(&sealed, &mut ctx).unwrap();
        assert_eq!(opened, b"plaintext");

        let stats = root.stats();
        assert_eq!(stats.encrypt_ops, 1);
        assert_eq!(stats.decrypt_ops, 1);
    }

    #[test]
    fn password_derivation_is_deterministic() {
        let a = EncryptionRoot::from_password("hunter2", b"salt").unwrap();
        let b = EncryptionRoot::from_password("hunter2", b"salt").unwrap();
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let sealed = a.on_stash(b"shared secret", &mut ctx).unwrap();
        let mut ctx = RootContext::new("k", RootOp::Crack);
        assert_eq!(b.on_crack(&sealed, &mut ctx).unwrap(), b"shared secret");
    }

    #[test]
    fn wrong_key_fails_and_counts() {
        let sealer = EncryptionRoot::from_key(&[1u8; 32]);
        let opener = EncryptionRoot::from_key(&[2u8; 32]);
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let sealed = sealer.on_stash(b"data", &mut ctx).unwrap();
        let mut ctx = RootContext::new("k", RootOp::Crack);
        assert!(opener.on_crack(&sealed, &mut ctx).is_err());
        assert_eq!(opener.stats().errors, 1);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let root = EncryptionRoot::from_key(&[9u8; 32]);
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let mut sealed = root.on_stash(b"data", &mut ctx).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        let mut ctx = RootContext::new("k", RootOp::Crack);
        assert!(root.on_crack(&sealed, &mut ctx).is_err());
    }
}
