//! Parser for the directory listing file (handle 0).
//!
//! The listing is a flat array of 16-byte little-endian entries:
//!
//! ```text
//! index u16 | data type u8 | sub type u8 | file number u16 |
//! specific flags u8 | file flags u8 | size u32 | timestamp u32
//! ```

use crate::descriptor::{
    from_device_timestamp, FileDescriptor, FileHandle, FileKind,
};
use crate::reader::ByteReader;
use crate::{Result, TransferError};

pub const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub index: u16,
    pub data_type: u8,
    pub sub_type: u8,
    pub file_number: u16,
    pub specific_flags: u8,
    pub file_flags: u8,
    pub size: u32,
    pub timestamp: u32,
}

impl DirectoryEntry {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            index: reader.u16()?,
            data_type: reader.u8()?,
            sub_type: reader.u8()?,
            file_number: reader.u16()?,
            specific_flags: reader.u8()?,
            file_flags: reader.u8()?,
            size: reader.u32()?,
            timestamp: reader.u32()?,
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.push(self.data_type);
        buf.push(self.sub_type);
        buf.extend_from_slice(&self.file_number.to_le_bytes());
        buf.push(self.specific_flags);
        buf.push(self.file_flags);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_type(self.data_type, self.sub_type)
    }

    /// An entry with every field but the timestamp zeroed.
    ///
    /// Some firmware lists such an entry, which would point back at the root
    /// directory and re-enqueue it forever. Known workaround: the entry is
    /// ignored rather than interpreted.
    pub fn is_zero_placeholder(&self) -> bool {
        self.index == 0
            && self.data_type == 0
            && self.sub_type == 0
            && self.file_number == 0
            && self.specific_flags == 0
            && self.file_flags == 0
            && self.size == 0
    }

    /// `None` when the type pair maps to no known kind.
    pub fn descriptor(&self) -> Option<FileDescriptor> {
        let kind = self.kind()?;
        let mut descriptor =
            FileDescriptor::new(FileHandle::Index(self.index), kind, self.size)
                .with_flags(self.file_flags);
        descriptor.modified = from_device_timestamp(self.timestamp);
        Some(descriptor)
    }
}

pub fn parse(bytes: &[u8]) -> Result<Vec<DirectoryEntry>> {
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(TransferError::malformed(format!(
            "directory length {} is not a multiple of {}",
            bytes.len(),
            ENTRY_SIZE
        )));
    }
    let mut reader = ByteReader::new(bytes);
    let mut entries = Vec::with_capacity(bytes.len() / ENTRY_SIZE);
    while reader.remaining() > 0 {
        entries.push(DirectoryEntry::read(&mut reader)?);
    }
    log::debug!("Parsed {} directory entries", entries.len());
    Ok(entries)
}

/// Entries worth enqueueing: known kinds, optionally restricted to the
/// supported set, without the zero placeholder.
pub fn qualifying(
    entries: &[DirectoryEntry],
    fetch_unknown: bool,
) -> Vec<FileDescriptor> {
    entries
        .iter()
        .filter_map(|entry| {
            let Some(descriptor) = entry.descriptor() else {
                log::warn!(
                    "Unsupported directory entry of type {}/{}: {:?}",
                    entry.data_type,
                    entry.sub_type,
                    entry
                );
                return None;
            };
            if !descriptor.kind.is_supported() && !fetch_unknown {
                log::debug!("Skipping directory entry {}", descriptor);
                return None;
            }
            if entry.is_zero_placeholder() {
                log::warn!("Ignoring {:?} to avoid re-listing the root", entry);
                return None;
            }
            Some(descriptor)
        })
        .collect()
}
