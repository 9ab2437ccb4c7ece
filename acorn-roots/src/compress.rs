use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use acorn_core::{AcornError, AcornResult, Root, RootContext};

/// A compression codec the root can wrap.
pub trait CompressionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn level(&self) -> u32;
    fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>>;
    fn decompress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>>;
}

pub struct GzipProvider {
    level: u32,
}

impl GzipProvider {
    pub fn new(level: u32) -> Self {
        GzipProvider { level: level.min(9) }
    }
}

impl Default for GzipProvider {
    fn default() -> Self {
        GzipProvider::new(Compression::default().level())
    }
}

impl CompressionProvider for GzipProvider {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(bytes)?;
        encoder.finish()
    }

    fn decompress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out)?;
        Ok(out)
    }
}

pub struct DeflateProvider {
    level: u32,
}

impl DeflateProvider {
    pub fn new(level: u32) -> Self {
        DeflateProvider { level: level.min(9) }
    }
}

impl Default for DeflateProvider {
    fn default() -> Self {
        DeflateProvider::new(Compression::default().level())
    }
}

impl CompressionProvider for DeflateProvider {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(bytes)?;
        encoder.finish()
    }

    fn decompress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        DeflateDecoder::new(bytes).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Cumulative counters for one compression root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
}

impl CompressionStats {
    /// Overall ratio (`out / in`); zero until something was compressed.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            return 0.0;
        }
        self.bytes_out as f64 / self.bytes_in as f64
    }
}

/// Compression root wrapping a pluggable provider. Sits in the 100-199 band:
/// after policy, before encryption, so ciphertext is never fed to the
/// compressor.
pub struct CompressionRoot {
    sequence: u32,
    provider: Box<dyn CompressionProvider>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
}

impl CompressionRoot {
    pub fn new(provider: impl CompressionProvider + 'static) -> Self {
        CompressionRoot {
            sequence: 100,
            provider: Box::new(provider),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn gzip() -> Self {
        Self::new(GzipProvider::default())
    }

    pub fn deflate() -> Self {
        Self::new(DeflateProvider::default())
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn fail(&self, err: impl std::fmt::Display) -> AcornError {
        self.errors.fetch_add(1, Ordering::Relaxed);
        AcornError::Serialization(format!("{}: {err}", self.provider.name()))
    }
}

impl Root for CompressionRoot {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn signature(&self) -> String {
        format!("{}(level={})#{}", self.provider.name(), self.provider.level(), self.sequence)
    }

    fn on_stash(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        let out = self.provider.compress(bytes).map_err(|e| self.fail(e))?;
        self.bytes_in.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    fn on_crack(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        self.provider.decompress(bytes).map_err(|e| self.fail(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acorn_core::RootOp;

    #[test]
    fn gzip_round_trip_restores_input() {
        let root = CompressionRoot::gzip();
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let input = b"the same phrase repeated, the same phrase repeated, the same phrase repeated";
        let compressed = root.on_stash(input, &mut ctx).unwrap();
        assert!(compressed.len() < input.len());

        let mut ctx = RootContext::new("k", RootOp::Crack);
        let restored = root.on_crack(&compressed, &mut ctx).unwrap();
        assert_eq!(restored, input);

        let stats = root.stats();
        assert_eq!(stats.bytes_in, input.len() as u64);
        assert!(stats.ratio() < 1.0);
    }

    #[test]
    fn deflate_round_trip_restores_input() {
        let root = CompressionRoot::deflate();
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let input = vec![42u8; 4096];
        let compressed = root.on_stash(&input, &mut ctx).unwrap();
        assert!(compressed.len() < input.len());

        let mut ctx = RootContext::new("k", RootOp::Crack);
        assert_eq!(root.on_crack(&compressed, &mut ctx).unwrap(), input);
    }

    #[test]
    fn garbage_input_fails_crack_and_counts() {
        let root = CompressionRoot::gzip();
        let mut ctx = RootContext::new("k", RootOp::Crack);
        assert!(root.on_crack(b"not gzip at all", &mut ctx).is_err());
        assert_eq!(root.stats().errors, 1);
    }

    #[test]
    fn signature_names_algorithm_and_level() {
        let root = CompressionRoot::new(GzipProvider::new(9));
        assert_eq!(root.signature(), "gzip(level=9)#100");
    }
}
