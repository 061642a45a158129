//! Control messages exchanged around the data chunks.

use core::fmt::Display;

use crate::descriptor::{FileDescriptor, FileHandle, FileKind};
use crate::reader::ByteReader;
use crate::{Result, TransferError};

pub const CMD_CAPABILITIES_REQUEST: u8 = 0x01;
pub const CMD_CAPABILITIES: u8 = 0x02;
pub const CMD_TRANSFER_REQUEST: u8 = 0x03;
pub const CMD_TRANSFER_RESPONSE: u8 = 0x04;
pub const CMD_DOWNLOAD_REQUEST: u8 = 0x05;
pub const CMD_DOWNLOAD_STATUS: u8 = 0x06;
pub const CMD_CHUNK_ACK: u8 = 0x11;
pub const CMD_WINDOW_ACK: u8 = 0x13;
pub const CMD_CANCEL: u8 = 0x20;
pub const CMD_SYNC_COMPLETE: u8 = 0x30;
pub const CMD_SET_FILE_FLAGS: u8 = 0x31;

/// Peer verdict carried by responses and acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8);

impl Status {
    pub const PROCEED: Status = Status(0);
    pub const BUSY: Status = Status(1);
    pub const ERROR: Status = Status(2);

    pub fn can_proceed(&self) -> bool {
        *self == Self::PROCEED
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::PROCEED => write!(f, "proceed"),
            Self::BUSY => write!(f, "busy"),
            Self::ERROR => write!(f, "error"),
            Status(other) => write!(f, "status {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CapabilitiesRequest,
    Capabilities {
        version: u8,
        chunk_size: u16,
        compressed_chunk_size: Option<u32>,
    },
    /// Announces a file the sender is about to push.
    TransferRequest {
        session: u8,
        descriptor: FileDescriptor,
        length: u32,
        crc: u32,
        compressed_chunk_size: Option<u32>,
    },
    TransferResponse {
        session: u8,
        status: Status,
        existing_progress: u32,
    },
    DownloadRequest {
        session: u8,
        handle: FileHandle,
        offset: u32,
    },
    DownloadStatus {
        session: u8,
        status: Status,
        max_size: u32,
        crc: u32,
        compressed: bool,
        existing_progress: u32,
    },
    ChunkAck {
        session: u8,
        status: Status,
        offset: u32,
    },
    WindowAck {
        status: Status,
        index: u8,
        offset: u32,
    },
    Cancel {
        session: u8,
    },
    SyncComplete {
        session: u8,
    },
    SetFileFlags {
        handle: FileHandle,
        flags: u8,
    },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        match self {
            Message::CapabilitiesRequest => buf.push(CMD_CAPABILITIES_REQUEST),
            Message::Capabilities {
                version,
                chunk_size,
                compressed_chunk_size,
            } => {
                buf.push(CMD_CAPABILITIES);
                buf.push(*version);
                buf.extend_from_slice(&chunk_size.to_le_bytes());
                if *version >= 3 {
                    let size = compressed_chunk_size
                        .unwrap_or(u32::from(*chunk_size));
                    buf.extend_from_slice(&size.to_le_bytes());
                }
            }
            Message::TransferRequest {
                session,
                descriptor,
                length,
                crc,
                compressed_chunk_size,
            } => {
                let (data_type, sub_type) = descriptor.kind.type_codes();
                buf.push(CMD_TRANSFER_REQUEST);
                buf.push(*session);
                descriptor.handle.encode_into(&mut buf);
                buf.push(data_type);
                buf.push(sub_type);
                buf.extend_from_slice(&length.to_le_bytes());
                buf.extend_from_slice(&crc.to_le_bytes());
                match compressed_chunk_size {
                    Some(size) => {
                        buf.push(1);
                        buf.extend_from_slice(&size.to_le_bytes());
                    }
                    None => buf.push(0),
                }
            }
            Message::TransferResponse {
                session,
                status,
                existing_progress,
            } => {
                buf.push(CMD_TRANSFER_RESPONSE);
                buf.push(*session);
                buf.push(status.0);
                buf.extend_from_slice(&existing_progress.to_le_bytes());
            }
            Message::DownloadRequest {
                session,
                handle,
                offset,
            } => {
                buf.push(CMD_DOWNLOAD_REQUEST);
                buf.push(*session);
                handle.encode_into(&mut buf);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Message::DownloadStatus {
                session,
                status,
                max_size,
                crc,
                compressed,
                existing_progress,
            } => {
                buf.push(CMD_DOWNLOAD_STATUS);
                buf.push(*session);
                buf.push(status.0);
                buf.extend_from_slice(&max_size.to_le_bytes());
                buf.extend_from_slice(&crc.to_le_bytes());
                buf.push(u8::from(*compressed));
                buf.extend_from_slice(&existing_progress.to_le_bytes());
            }
            Message::ChunkAck {
                session,
                status,
                offset,
            } => {
                buf.push(CMD_CHUNK_ACK);
                buf.push(*session);
                buf.push(status.0);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Message::WindowAck {
                status,
                index,
                offset,
            } => {
                buf.push(CMD_WINDOW_ACK);
                buf.push(status.0);
                buf.push(*index);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Message::Cancel { session } => {
                buf.push(CMD_CANCEL);
                buf.push(*session);
            }
            Message::SyncComplete { session } => {
                buf.push(CMD_SYNC_COMPLETE);
                buf.push(*session);
            }
            Message::SetFileFlags { handle, flags } => {
                buf.push(CMD_SET_FILE_FLAGS);
                handle.encode_into(&mut buf);
                buf.push(*flags);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let message = match reader.u8()? {
            CMD_CAPABILITIES_REQUEST => Message::CapabilitiesRequest,
            CMD_CAPABILITIES => {
                let version = reader.u8()?;
                let chunk_size = reader.u16()?;
                let compressed_chunk_size = if version >= 3 {
                    Some(reader.u32()?)
                } else {
                    None
                };
                Message::Capabilities {
                    version,
                    chunk_size,
                    compressed_chunk_size,
                }
            }
            CMD_TRANSFER_REQUEST => {
                let session = reader.u8()?;
                let handle = FileHandle::decode(&mut reader)?;
                let (data_type, sub_type) = (reader.u8()?, reader.u8()?);
                let kind = FileKind::from_type(data_type, sub_type)
                    .ok_or_else(|| {
                        TransferError::malformed(format!(
                            "unknown file type {}/{}",
                            data_type, sub_type
                        ))
                    })?;
                let length = reader.u32()?;
                let crc = reader.u32()?;
                let compressed_chunk_size = if reader.bool()? {
                    Some(reader.u32()?)
                } else {
                    None
                };
                Message::TransferRequest {
                    session,
                    descriptor: FileDescriptor::new(handle, kind, length),
                    length,
                    crc,
                    compressed_chunk_size,
                }
            }
            CMD_TRANSFER_RESPONSE => Message::TransferResponse {
                session: reader.u8()?,
                status: Status(reader.u8()?),
                existing_progress: reader.u32()?,
            },
            CMD_DOWNLOAD_REQUEST => Message::DownloadRequest {
                session: reader.u8()?,
                handle: FileHandle::decode(&mut reader)?,
                offset: reader.u32()?,
            },
            CMD_DOWNLOAD_STATUS => Message::DownloadStatus {
                session: reader.u8()?,
                status: Status(reader.u8()?),
                max_size: reader.u32()?,
                crc: reader.u32()?,
                compressed: reader.bool()?,
                existing_progress: reader.u32()?,
            },
            CMD_CHUNK_ACK => Message::ChunkAck {
                session: reader.u8()?,
                status: Status(reader.u8()?),
                offset: reader.u32()?,
            },
            CMD_WINDOW_ACK => Message::WindowAck {
                status: Status(reader.u8()?),
                index: reader.u8()?,
                offset: reader.u32()?,
            },
            CMD_CANCEL => Message::Cancel {
                session: reader.u8()?,
            },
            CMD_SYNC_COMPLETE => Message::SyncComplete {
                session: reader.u8()?,
            },
            CMD_SET_FILE_FLAGS => Message::SetFileFlags {
                handle: FileHandle::decode(&mut reader)?,
                flags: reader.u8()?,
            },
            other => {
                return Err(TransferError::malformed(format!(
                    "unknown control command {:#04x}",
                    other
                )))
            }
        };
        if reader.remaining() > 0 {
            log::debug!(
                "ignoring {} trailing bytes after {:?}",
                reader.remaining(),
                message
            );
        }
        Ok(message)
    }
}
