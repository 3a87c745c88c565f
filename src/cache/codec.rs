//! Value encoding: bincode envelope plus real compression (deflate via
//! `flate2`, brotli via `brotli`) above a configurable byte threshold. The
//! teacher's `enterprise::cache::codec` simulates compression as a
//! pass-through; this module keeps its envelope shape but replaces the
//! bodies with real round-tripping compression.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, CacheResult};
use crate::config::CompressionAlgorithm;

/// Wire envelope for a cached value: the compression flag travels with the
/// blob so decode is tier-uniform regardless of which tier served the hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedData {
    pub algorithm: StoredAlgorithm,
    pub original_size: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredAlgorithm {
    None,
    Deflate,
    Brotli,
}

impl EncodedData {
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.bytes.len() as f64 / self.original_size as f64
    }
}

/// Serializes `value`, compressing the bincode bytes with `algorithm` when
/// they exceed `threshold` bytes.
pub fn encode<T: Serialize>(value: &T, threshold: usize, algorithm: CompressionAlgorithm) -> CacheResult<EncodedData> {
    let raw = bincode::serialize(value).map_err(|e| CacheError::Codec(e.to_string()))?;
    let original_size = raw.len();

    if original_size <= threshold || algorithm == CompressionAlgorithm::None {
        return Ok(EncodedData {
            algorithm: StoredAlgorithm::None,
            original_size,
            bytes: raw,
        });
    }

    let (stored_algorithm, bytes) = match algorithm {
        CompressionAlgorithm::Deflate => (StoredAlgorithm::Deflate, compress_deflate(&raw)?),
        CompressionAlgorithm::Brotli => (StoredAlgorithm::Brotli, compress_brotli(&raw)),
        CompressionAlgorithm::None => unreachable!(),
    };

    Ok(EncodedData {
        algorithm: stored_algorithm,
        original_size,
        bytes,
    })
}

/// Reverses [`encode`], restoring the original typed value.
pub fn decode<T: for<'de> Deserialize<'de>>(encoded: &EncodedData) -> CacheResult<T> {
    let raw = match encoded.algorithm {
        StoredAlgorithm::None => encoded.bytes.clone(),
        StoredAlgorithm::Deflate => decompress_deflate(&encoded.bytes, encoded.original_size)?,
        StoredAlgorithm::Brotli => decompress_brotli(&encoded.bytes),
    };
    bincode::deserialize(&raw).map_err(|e| CacheError::Codec(e.to_string()))
}

fn compress_deflate(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).map_err(|e| CacheError::Codec(e.to_string()))?;
    encoder.finish().map_err(|e| CacheError::Codec(e.to_string()))
}

fn decompress_deflate(data: &[u8], original_size: usize) -> CacheResult<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(original_size);
    decoder.read_to_end(&mut out).map_err(|e| CacheError::Codec(e.to_string()))?;
    Ok(out)
}

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 9;
const BROTLI_LGWIN: u32 = 22;

fn compress_brotli(data: &[u8]) -> Vec<u8> {
    let mut reader = brotli::CompressorReader::new(data, BROTLI_BUFFER_SIZE, BROTLI_QUALITY, BROTLI_LGWIN);
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .expect("in-memory brotli compression cannot fail");
    out
}

fn decompress_brotli(data: &[u8]) -> Vec<u8> {
    let mut reader = brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE);
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .expect("brotli stream produced by compress_brotli is always valid");
    out
}
