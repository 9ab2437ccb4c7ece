//! Byte-transforming roots for trunk pipelines: pluggable compression,
//! AES-256-GCM encryption, and SHA-256 integrity. The non-transforming
//! policy root lives in `acorn-core`.

mod compress;
mod encrypt;
mod integrity;

pub use compress::{
    CompressionProvider, CompressionRoot, CompressionStats, DeflateProvider, GzipProvider,
};
pub use encrypt::{EncryptionRoot, EncryptionStats};
pub use integrity::ChecksumRoot;
