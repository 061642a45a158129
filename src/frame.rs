//! Data-chunk framing for both wire variants.
//!
//! Ack-per-chunk frames travel on the control channel, one link write each,
//! so a frame never exceeds the link payload of `mtu - LINK_OVERHEAD`:
//!
//! ```text
//! [10][flags][session][index][reserved u32 if FIRST][len u16][crc u32 if CRC][payload]
//! ```
//!
//! Windowed frames travel on the data channel of their direction. One
//! logical chunk is split into as many link writes as the MTU requires and
//! only the first write carries the header:
//!
//! ```text
//! [12][flags][index][len u16][crc u32 if CRC][payload...]
//! ```

use core::fmt::Display;

use crate::reader::ByteReader;
use crate::{Result, TransferError};

pub const CMD_CHUNK: u8 = 0x10;
pub const CMD_WINDOWED_CHUNK: u8 = 0x12;

/// Largest ack-per-chunk header: first chunk with a CRC field.
pub const ACK_PER_CHUNK_MAX_HEADER: usize = 14;
pub const WINDOWED_HEADER: usize = 9;
/// Bytes of every link write taken by the link layer itself.
pub const LINK_OVERHEAD: usize = 3;

/// Which protocol generation the peer speaks, fixed per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVariant {
    /// The sender waits for an ack of every chunk before the next.
    AckPerChunk { chunk_size: u16 },
    /// Several chunks in flight, optional compression, link-level splitting.
    Windowed {
        chunk_size: u16,
        compressed_chunk_size: u32,
    },
}

impl WireVariant {
    pub fn from_capabilities(
        version: u8,
        chunk_size: u16,
        compressed_chunk_size: Option<u32>,
    ) -> Option<Self> {
        match version {
            1 | 2 => Some(WireVariant::AckPerChunk { chunk_size }),
            3 => Some(WireVariant::Windowed {
                chunk_size,
                compressed_chunk_size: compressed_chunk_size
                    .unwrap_or(u32::from(chunk_size)),
            }),
            _ => None,
        }
    }

    pub fn supports_compression(&self) -> bool {
        matches!(self, WireVariant::Windowed { .. })
    }

    /// Chunks a sender may have unacknowledged.
    pub fn window(&self, configured: u8) -> usize {
        match self {
            WireVariant::AckPerChunk { .. } => 1,
            WireVariant::Windowed { .. } => usize::from(configured.max(1)),
        }
    }

    /// Payload bytes of one logical chunk.
    ///
    /// Must be recomputed whenever the transport reports a new MTU.
    pub fn chunk_capacity(
        &self,
        max_block_size: usize,
        mtu: usize,
        compressed: bool,
    ) -> usize {
        let capacity = match self {
            WireVariant::AckPerChunk { chunk_size } => {
                let frame =
                    max_block_size.min(mtu.saturating_sub(LINK_OVERHEAD));
                usize::from(*chunk_size)
                    .min(frame.saturating_sub(ACK_PER_CHUNK_MAX_HEADER))
            }
            WireVariant::Windowed {
                chunk_size,
                compressed_chunk_size,
            } => {
                if compressed {
                    *compressed_chunk_size as usize
                } else {
                    usize::from(*chunk_size)
                }
            }
        };
        capacity.clamp(1, usize::from(u16::MAX))
    }
}

impl Display for WireVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireVariant::AckPerChunk { chunk_size } => {
                write!(f, "ack-per-chunk (chunk {})", chunk_size)
            }
            WireVariant::Windowed {
                chunk_size,
                compressed_chunk_size,
            } => write!(
                f,
                "windowed (chunk {}, compressed chunk {})",
                chunk_size, compressed_chunk_size
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    pub const FIRST: u8 = 0x01;
    pub const LAST: u8 = 0x02;
    pub const CRC: u8 = 0x04;

    pub fn new(first: bool, last: bool, crc: bool) -> Self {
        let mut bits = 0;
        if first {
            bits |= Self::FIRST;
        }
        if last {
            bits |= Self::LAST;
        }
        if crc {
            bits |= Self::CRC;
        }
        Self(bits)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_first(&self) -> bool {
        self.0 & Self::FIRST != 0
    }

    pub fn is_last(&self) -> bool {
        self.0 & Self::LAST != 0
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC != 0
    }
}

/// Decoded chunk header; the payload is `bytes[payload_offset..][..length]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: ChunkFlags,
    /// Absent on windowed frames, which address the current slot.
    pub session: Option<u8>,
    pub index: u8,
    pub length: u16,
    pub crc: Option<u32>,
    pub payload_offset: usize,
}

impl ChunkHeader {
    pub fn payload<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let end = (self.payload_offset + usize::from(self.length))
            .min(bytes.len());
        &bytes[self.payload_offset.min(end)..end]
    }
}

/// One chunk ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingChunk {
    pub index: u8,
    pub flags: ChunkFlags,
    pub crc: u32,
    pub payload: Vec<u8>,
}

pub fn encode_ack_per_chunk(session: u8, chunk: &OutgoingChunk) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(ACK_PER_CHUNK_MAX_HEADER + chunk.payload.len());
    buf.push(CMD_CHUNK);
    buf.push(chunk.flags.bits());
    buf.push(session);
    buf.push(chunk.index);
    if chunk.flags.is_first() {
        buf.extend_from_slice(&[0u8; 4]);
    }
    buf.extend_from_slice(&(chunk.payload.len() as u16).to_le_bytes());
    if chunk.flags.has_crc() {
        buf.extend_from_slice(&chunk.crc.to_le_bytes());
    }
    buf.extend_from_slice(&chunk.payload);
    buf
}

/// Header and payload of a windowed chunk before link splitting.
pub fn encode_windowed(chunk: &OutgoingChunk) -> Vec<u8> {
    let mut buf = Vec::with_capacity(WINDOWED_HEADER + chunk.payload.len());
    buf.push(CMD_WINDOWED_CHUNK);
    buf.push(chunk.flags.bits());
    buf.push(chunk.index);
    buf.extend_from_slice(&(chunk.payload.len() as u16).to_le_bytes());
    if chunk.flags.has_crc() {
        buf.extend_from_slice(&chunk.crc.to_le_bytes());
    }
    buf.extend_from_slice(&chunk.payload);
    buf
}

/// Cut a framed chunk into link writes that fit the MTU.
pub fn split_for_link(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let write_size = mtu.saturating_sub(LINK_OVERHEAD).max(1);
    frame.chunks(write_size).map(|part| part.to_vec()).collect()
}

/// Decode a complete frame of either variant.
pub fn decode(bytes: &[u8]) -> Result<ChunkHeader> {
    let header = decode_header(bytes)?;
    let available = bytes.len() - header.payload_offset;
    if usize::from(header.length) > available {
        return Err(TransferError::malformed(format!(
            "chunk declares {} bytes, only {} present",
            header.length, available
        )));
    }
    Ok(header)
}

/// Decode the first link write of a windowed chunk; the payload may be
/// incomplete and continues in later writes.
pub fn decode_partial(bytes: &[u8]) -> Result<ChunkHeader> {
    decode_header(bytes)
}

fn decode_header(bytes: &[u8]) -> Result<ChunkHeader> {
    let mut reader = ByteReader::new(bytes);
    let command = reader.u8()?;
    let flags = ChunkFlags::from_bits(reader.u8()?);
    let session = match command {
        CMD_CHUNK => Some(reader.u8()?),
        CMD_WINDOWED_CHUNK => None,
        other => {
            return Err(TransferError::malformed(format!(
                "not a data frame: command {:#04x}",
                other
            )))
        }
    };
    let index = reader.u8()?;
    if command == CMD_CHUNK && flags.is_first() {
        reader.take(4)?;
    }
    let length = reader.u16()?;
    let crc = if flags.has_crc() {
        Some(reader.u32()?)
    } else {
        None
    };
    let header = ChunkHeader {
        flags,
        session,
        index,
        length,
        crc,
        payload_offset: reader.position(),
    };
    log::trace!("decoded chunk header {:?}", header);
    Ok(header)
}

/// Collects the link writes of one windowed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialChunk {
    pub header: ChunkHeader,
    payload: Vec<u8>,
}

impl PartialChunk {
    pub fn start(header: ChunkHeader, first_write: &[u8]) -> Result<Self> {
        let mut partial = Self {
            header,
            payload: Vec::with_capacity(usize::from(header.length)),
        };
        let start = header.payload_offset.min(first_write.len());
        partial.push(&first_write[start..])?;
        Ok(partial)
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.payload.len() + bytes.len() > usize::from(self.header.length) {
            return Err(TransferError::malformed(format!(
                "chunk {} overflows its declared {} bytes",
                self.header.index, self.header.length
            )));
        }
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.payload.len() == usize::from(self.header.length)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
