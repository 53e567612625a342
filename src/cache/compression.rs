//! Compression Support
//!
//! Values at or above the configured threshold are compressed before they
//! are stored. DEFLATE (zlib framing) is the default and honours levels 1-9;
//! LZ4, Zstd and Snappy are available for deployments that prefer speed.
//! A failing compressor never loses data: the value is stored uncompressed.

use crate::error::{Error, Result};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

// Re-export CompressionAlgorithm for convenience
pub use crate::cache::entry::CompressionAlgorithm;

/// Lowest accepted compression level
pub const MIN_COMPRESSION_LEVEL: u32 = 1;

/// Highest accepted compression level
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Algorithm used for new entries
    pub algorithm: CompressionAlgorithm,
    /// Values shorter than this are stored uncompressed
    pub threshold_bytes: u64,
    /// Compression level, 1 (fast) to 9 (small)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Deflate,
            threshold_bytes: 1024,
            level: 6,
        }
    }
}

impl CompressionConfig {
    /// Validate level range
    pub fn validate(&self) -> Result<()> {
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&self.level) {
            return Err(Error::Configuration(format!(
                "compression_level must be between {} and {}, got {}",
                MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.level
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

fn compression_error(algorithm: CompressionAlgorithm, reason: impl ToString) -> Error {
    Error::Compression {
        algorithm: algorithm.to_string(),
        reason: reason.to_string(),
    }
}

fn decompression_error(algorithm: CompressionAlgorithm, reason: impl ToString) -> Error {
    Error::Decompression {
        algorithm: algorithm.to_string(),
        reason: reason.to_string(),
    }
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

// =============================================================================
// DEFLATE Compressor
// =============================================================================

/// zlib-framed DEFLATE, level 1-9
pub struct DeflateCompressor {
    level: u32,
}

impl DeflateCompressor {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.clamp(MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL),
        }
    }
}

impl Compressor for DeflateCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Deflate
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| compression_error(self.algorithm(), e))?;
        encoder
            .finish()
            .map_err(|e| compression_error(self.algorithm(), e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| decompression_error(self.algorithm(), e))?;
        Ok(out)
    }
}

// =============================================================================
// LZ4 / Zstd / Snappy Compressors
// =============================================================================

/// LZ4 compressor (fast compression)
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: u32) -> Self {
        Self { level: level as i32 }
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| compression_error(self.algorithm(), e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| decompression_error(self.algorithm(), e))
    }
}

/// Zstd compressor (balanced compression)
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn with_level(level: u32) -> Self {
        Self { level: level as i32 }
    }
}

impl Compressor for ZstdCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| compression_error(self.algorithm(), e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| decompression_error(self.algorithm(), e))
    }
}

/// Snappy compressor (very fast, lower ratio, ignores level)
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Snappy
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| compression_error(self.algorithm(), e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| decompression_error(self.algorithm(), e))
    }
}

/// Build the compressor for an algorithm at a level
pub fn compressor_for(algorithm: CompressionAlgorithm, level: u32) -> Box<dyn Compressor> {
    match algorithm {
        CompressionAlgorithm::None => Box::new(NoopCompressor),
        CompressionAlgorithm::Deflate => Box::new(DeflateCompressor::with_level(level)),
        CompressionAlgorithm::Lz4 => Box::new(Lz4Compressor::with_level(level)),
        CompressionAlgorithm::Zstd => Box::new(ZstdCompressor::with_level(level)),
        CompressionAlgorithm::Snappy => Box::new(SnappyCompressor),
    }
}

// =============================================================================
// Compression Statistics
// =============================================================================

/// Point-in-time compression figures
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompressionStats {
    /// Values stored compressed
    pub compressed_values: u64,
    /// Values stored as-is (below threshold or incompressible)
    pub uncompressed_values: u64,
    /// Compression attempts that failed and fell back
    pub failures: u64,
    /// Sum of original sizes of compressed values
    pub original_bytes: u64,
    /// Sum of stored sizes of compressed values
    pub compressed_bytes: u64,
    /// original_bytes - compressed_bytes
    pub bytes_saved: u64,
}

impl CompressionStats {
    /// Stored / original across compressed values (1.0 when nothing compressed)
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f64 / self.original_bytes as f64
        }
    }
}

#[derive(Debug, Default)]
struct CompressionCounters {
    compressed_values: AtomicU64,
    uncompressed_values: AtomicU64,
    failures: AtomicU64,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

/// Result of compressing one value
#[derive(Debug, Clone)]
pub struct CompressOutcome {
    /// Bytes to store
    pub bytes: Bytes,
    /// Algorithm the bytes are compressed with
    pub algorithm: CompressionAlgorithm,
    /// Set when the compressor failed and the value fell back to as-is
    pub failure: Option<String>,
}

impl CompressOutcome {
    fn stored_as_is(data: &[u8], failure: Option<String>) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(data),
            algorithm: CompressionAlgorithm::None,
            failure,
        }
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Compresses values above the threshold and tracks bytes saved
pub struct CompressionManager {
    config: CompressionConfig,
    active: Box<dyn Compressor>,
    counters: CompressionCounters,
}

impl CompressionManager {
    /// Create a new compression manager
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        let active = compressor_for(config.algorithm, config.level);
        Self {
            config,
            active,
            counters: CompressionCounters::default(),
        }
    }

    /// Create with an explicit compressor (used for custom codecs)
    pub fn with_compressor(config: CompressionConfig, compressor: Box<dyn Compressor>) -> Self {
        Self {
            config,
            active: compressor,
            counters: CompressionCounters::default(),
        }
    }

    /// Compress data if it reaches the threshold.
    ///
    /// Returns (stored_data, algorithm_used). `CompressionAlgorithm::None`
    /// means the value is stored as-is: below threshold, not smaller after
    /// compression, or the compressor failed.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        let outcome = self.compress_value(data);
        (outcome.bytes, outcome.algorithm)
    }

    /// Like [`compress`](Self::compress) but also reports a swallowed failure
    pub fn compress_value(&self, data: &[u8]) -> CompressOutcome {
        let algorithm = self.active.algorithm();
        if (data.len() as u64) < self.config.threshold_bytes || algorithm == CompressionAlgorithm::None
        {
            self.counters.uncompressed_values.fetch_add(1, Ordering::Relaxed);
            return CompressOutcome::stored_as_is(data, None);
        }

        match self.active.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                self.counters.compressed_values.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .original_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.counters
                    .compressed_bytes
                    .fetch_add(compressed.len() as u64, Ordering::Relaxed);
                CompressOutcome {
                    bytes: Bytes::from(compressed),
                    algorithm,
                    failure: None,
                }
            }
            Ok(_) => {
                self.counters.uncompressed_values.fetch_add(1, Ordering::Relaxed);
                CompressOutcome::stored_as_is(data, None)
            }
            Err(e) => {
                warn!(algorithm = %algorithm, size = data.len(), error = %e, "Compression failed, storing uncompressed");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.counters.uncompressed_values.fetch_add(1, Ordering::Relaxed);
                CompressOutcome::stored_as_is(data, Some(e.to_string()))
            }
        }
    }

    /// Decompress data stored with `algorithm` (no-op for `None`)
    pub fn decompress(&self, data: &Bytes, algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.clone()),
            a if a == self.active.algorithm() => Ok(Bytes::from(self.active.decompress(data)?)),
            a => Ok(Bytes::from(compressor_for(a, self.config.level).decompress(data)?)),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Snapshot of compression counters
    pub fn stats(&self) -> CompressionStats {
        let original_bytes = self.counters.original_bytes.load(Ordering::Relaxed);
        let compressed_bytes = self.counters.compressed_bytes.load(Ordering::Relaxed);
        CompressionStats {
            compressed_values: self.counters.compressed_values.load(Ordering::Relaxed),
            uncompressed_values: self.counters.uncompressed_values.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            original_bytes,
            compressed_bytes,
            bytes_saved: original_bytes.saturating_sub(compressed_bytes),
        }
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
