//! Opt-in gzip compression for awareness payloads.
//!
//! Small payloads skip compression entirely, and a compressed result that
//! fails to beat the input is discarded in favor of the original bytes, so
//! the flag on the wire always reflects what actually happened.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::COMPRESSION_THRESHOLD;
use crate::error::FramingError;

/// Gzip codec with a size threshold.
#[derive(Debug, Clone)]
pub struct CompressionCodec {
    threshold: usize,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self {
            threshold: COMPRESSION_THRESHOLD,
        }
    }
}

impl CompressionCodec {
    pub fn with_threshold(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Compress `data`, returning the bytes to put on the wire and whether
    /// they are actually compressed.
    ///
    /// Inputs below the threshold, and inputs gzip cannot shrink, come back
    /// unchanged with `false`.
    pub fn compress(&self, data: &[u8]) -> (Vec<u8>, bool) {
        if data.len() < self.threshold {
            return (data.to_vec(), false);
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::default());
        if encoder.write_all(data).is_err() {
            return (data.to_vec(), false);
        }
        match encoder.finish() {
            Ok(compressed) if compressed.len() < data.len() => (compressed, true),
            _ => (data.to_vec(), false),
        }
    }

    /// Decompress bytes previously flagged as compressed.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 4);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| FramingError::DeserializationError(format!("gzip: {e}")))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_skipped() {
        let codec = CompressionCodec::default();
        let data = vec![7u8; 16];
        let (out, compressed) = codec.compress(&data);
        assert!(!compressed);
        assert_eq!(out, data);
    }

    #[test]
    fn test_compressible_payload_roundtrip() {
        let codec = CompressionCodec::with_threshold(64);
        let data = vec![42u8; 4096];
        let (out, compressed) = codec.compress(&data);
        assert!(compressed);
        assert!(out.len() < data.len());
        assert_eq!(codec.decompress(&out).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_kept_raw() {
        let codec = CompressionCodec::with_threshold(8);
        // Pseudo-random bytes: gzip cannot shrink these meaningfully.
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let (out, compressed) = codec.compress(&data);
        if !compressed {
            assert_eq!(out, data);
        } else {
            assert!(out.len() < data.len());
        }
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let codec = CompressionCodec::default();
        assert!(codec.decompress(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
