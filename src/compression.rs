use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{Result, TransferError};

pub fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflate a zlib stream received from the peer.
pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| TransferError::DecompressionFailed(e.to_string()))?;
    log::debug!("inflated {} bytes into {}", bytes.len(), out.len());
    Ok(out)
}
