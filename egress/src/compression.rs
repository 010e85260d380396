//! Gzip helpers for batch and load-file payloads.
//!
//! Everything crossing the object store is gzip: raw batches, staging files
//! and load files, matching what the warehouse bulk loaders expect.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::EgressResult;

/// Compresses bytes with gzip at the default level.
pub fn gzip(data: &[u8]) -> EgressResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompresses a gzip payload.
pub fn gunzip(data: &[u8]) -> EgressResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"{\"messageId\":\"m1\"}\n{\"messageId\":\"m2\"}";
        let compressed = gzip(data).unwrap();
        let decompressed = gunzip(&compressed).unwrap();
        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_gzip_compresses_repetitive_data() {
        let data = vec![42u8; 10_000];
        let compressed = gzip(&data).unwrap();
        assert!(compressed.len() < data.len() / 2);
    }

    #[test]
    fn test_empty_data_roundtrip() {
        let data = b"";
        let compressed = gzip(data).unwrap();
        let decompressed = gunzip(&compressed).unwrap();
        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_invalid_gunzip_returns_error() {
        let bad = vec![1u8, 2, 3, 4];
        assert!(gunzip(&bad).is_err());
    }
}
