//! GZip helpers for metadata and signal-index-cache exchange.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::transport::error::{Error, Result};

/// Inflate a GZip-compressed payload.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression(e.to_string()))?;
    Ok(out)
}

/// Deflate a payload with GZip at the default level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payload = b"<DataSet><Table>metadata goes here</Table></DataSet>".repeat(20);
        let packed = deflate(&payload).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(inflate(&packed).unwrap(), payload);
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(matches!(
            inflate(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(Error::Compression(_))
        ));
    }
}
