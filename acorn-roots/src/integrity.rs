use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use acorn_core::{AcornError, AcornResult, Root, RootContext};

const DIGEST_LEN: usize = 32;

/// SHA-256 integrity root. Sits in the 300-399 band, outside compression and
/// encryption on stash, so the digest covers exactly the bytes that reach
/// the trunk. A digest mismatch on crack reports `CorruptRecord` and leaves
/// the raw bytes untouched.
pub struct ChecksumRoot {
    sequence: u32,
    verified: AtomicU64,
    failures: AtomicU64,
}

impl ChecksumRoot {
    pub fn new() -> Self {
        ChecksumRoot {
            sequence: 300,
            verified: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn verified(&self) -> u64 {
        self.verified.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for ChecksumRoot {
    fn default() -> Self {
        ChecksumRoot::new()
    }
}

impl Root for ChecksumRoot {
    fn name(&self) -> &str {
        "sha256"
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn signature(&self) -> String {
        format!("sha256(digest={DIGEST_LEN})#{}", self.sequence)
    }

    fn on_stash(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        let digest = Sha256::digest(bytes);
        let mut out = Vec::with_capacity(DIGEST_LEN + bytes.len());
        out.extend_from_slice(&digest);
        out.extend_from_slice(bytes);
        Ok(out)
    }

    fn on_crack(&self, bytes: &[u8], ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        if bytes.len() < DIGEST_LEN {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(AcornError::CorruptRecord(format!(
                "record for `{}` shorter than its digest",
                ctx.id
            )));
        }
        let (stored, payload) = bytes.split_at(DIGEST_LEN);
        let actual = Sha256::digest(payload);
        if stored != actual.as_slice() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(AcornError::CorruptRecord(format!(
                "digest mismatch for `{}`",
                ctx.id
            )));
        }
        self.verified.fetch_add(1, Ordering::Relaxed);
        Ok(payload.to_vec())
    }
}
