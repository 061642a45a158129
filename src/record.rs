use core::fmt::Display;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::checksum::{self, RunningCrc};
use crate::compression;
use crate::descriptor::FileDescriptor;
use crate::frame::{ChunkFlags, OutgoingChunk, PartialChunk};
use crate::{Result, TransferError};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Download => write!(f, "download"),
            TransferDirection::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    RequestSent,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

/// Upper bound on buffer space reserved from a peer-declared length; the
/// buffer grows past it only as chunks are accepted.
const PREALLOCATION_LIMIT: u32 = 1 << 20;

fn preallocation(declared: u32) -> usize {
    declared.min(PREALLOCATION_LIMIT) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    index: u8,
    end: u32,
}

/// State of one download or upload.
///
/// For downloads `buffer` collects the wire bytes as they arrive, for uploads
/// it holds the wire bytes still to be sent. `progress` counts accepted
/// (download) or acknowledged (upload) bytes and never exceeds the declared
/// length.
#[derive(Debug)]
pub struct TransferRecord {
    direction: TransferDirection,
    descriptor: FileDescriptor,
    state: TransferState,
    buffer: Vec<u8>,
    progress: u32,
    start_offset: u32,
    sequence_index: u8,
    declared_length: u32,
    declared_checksum: Option<u32>,
    compressed: bool,
    running: RunningCrc,
    last_activity: Instant,
    cancelled: bool,
    partial: Option<PartialChunk>,
    sent: u32,
    in_flight: VecDeque<InFlight>,
}

impl TransferRecord {
    pub fn new(
        direction: TransferDirection,
        descriptor: FileDescriptor,
        size_hint: Option<u32>,
        now: Instant,
    ) -> Self {
        let declared_length = size_hint.unwrap_or(descriptor.size);
        Self {
            direction,
            descriptor,
            state: TransferState::Idle,
            buffer: Vec::with_capacity(preallocation(declared_length)),
            progress: 0,
            start_offset: 0,
            sequence_index: 0,
            declared_length,
            declared_checksum: None,
            compressed: false,
            running: RunningCrc::new(),
            last_activity: now,
            cancelled: false,
            partial: None,
            sent: 0,
            in_flight: VecDeque::new(),
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        log::trace!(
            "{} of {}: {:?} -> {:?}",
            self.direction,
            self.descriptor,
            self.state,
            state
        );
        self.state = state;
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn declared_length(&self) -> u32 {
        self.declared_length
    }

    pub fn declared_checksum(&self) -> Option<u32> {
        self.declared_checksum
    }

    pub fn sequence_index(&self) -> u8 {
        self.sequence_index
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn running_checksum(&self) -> u32 {
        self.running.value()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Bytes retained from an interrupted attempt, offered to the peer as
    /// the resume offset.
    pub fn retain_prefix(&mut self, prefix: Vec<u8>) {
        self.buffer = prefix;
    }

    pub fn retained_len(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Adopt the peer's answer to our download request.
    pub fn accept_download_status(
        &mut self,
        max_size: u32,
        crc: u32,
        compressed: bool,
        existing_progress: u32,
        now: Instant,
    ) -> Result<()> {
        if existing_progress > self.retained_len() {
            return Err(TransferError::UnalignedOffset {
                expected: u64::from(self.retained_len()),
                actual: u64::from(existing_progress),
            });
        }
        if existing_progress > max_size {
            return Err(TransferError::malformed(format!(
                "existing progress {} beyond file size {}",
                existing_progress, max_size
            )));
        }
        self.buffer.truncate(existing_progress as usize);
        self.running = RunningCrc::seeded(&self.buffer);
        self.buffer.reserve(preallocation(max_size - existing_progress));
        self.progress = existing_progress;
        self.start_offset = existing_progress;
        self.declared_length = max_size;
        self.declared_checksum = Some(crc);
        self.compressed = compressed;
        self.set_state(TransferState::Transferring);
        self.touch(now);
        Ok(())
    }

    /// Adopt a file the peer announced on its own.
    pub fn accept_announcement(
        &mut self,
        length: u32,
        crc: u32,
        compressed: bool,
        now: Instant,
    ) -> Result<()> {
        self.buffer.clear();
        self.accept_download_status(length, crc, compressed, 0, now)
    }

    pub(crate) fn take_partial(&mut self) -> Option<PartialChunk> {
        self.partial.take()
    }

    pub(crate) fn set_partial(&mut self, partial: PartialChunk) {
        self.partial = Some(partial);
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Validate and append one received chunk.
    pub fn accept_chunk(
        &mut self,
        flags: ChunkFlags,
        index: u8,
        crc: Option<u32>,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        if self.state != TransferState::Transferring {
            return Err(TransferError::malformed(format!(
                "chunk {} while {:?}",
                index, self.state
            )));
        }
        if index != self.sequence_index {
            return Err(TransferError::UnexpectedSequence {
                expected: self.sequence_index,
                actual: index,
            });
        }
        if flags.is_first() && self.progress != self.start_offset {
            return Err(TransferError::malformed(format!(
                "FIRST flag at offset {}",
                self.progress
            )));
        }
        let end = u64::from(self.progress) + payload.len() as u64;
        if end > u64::from(self.declared_length) {
            return Err(TransferError::malformed(format!(
                "chunk ends at {} past declared length {}",
                end, self.declared_length
            )));
        }
        let end = end as u32;
        if flags.is_last() != (end == self.declared_length) {
            return Err(TransferError::malformed(format!(
                "LAST flag {} at offset {} of {}",
                flags.is_last(),
                end,
                self.declared_length
            )));
        }
        if let Some(declared) = crc {
            let local = self.running.peek(payload);
            if declared != local {
                return Err(TransferError::ChunkChecksumMismatch {
                    expected: declared,
                    actual: local,
                });
            }
        }
        self.running.advance(payload);
        self.buffer.extend_from_slice(payload);
        self.progress = end;
        self.sequence_index = self.sequence_index.wrapping_add(1);
        self.touch(now);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.direction == TransferDirection::Download
            && self.state == TransferState::Transferring
            && self.progress == self.declared_length
    }

    /// Decompress and verify the reassembled file.
    pub fn finish_download(&mut self) -> Result<Vec<u8>> {
        self.set_state(TransferState::Finalizing);
        let wire = std::mem::take(&mut self.buffer);
        let data = if self.compressed {
            compression::inflate(&wire)?
        } else {
            wire
        };
        if let Some(expected) = self.declared_checksum {
            let actual = checksum::crc32(&data);
            if actual != expected {
                return Err(TransferError::FileChecksumMismatch {
                    expected,
                    actual,
                });
            }
        }
        self.set_state(TransferState::Done);
        Ok(data)
    }

    /// Install the upload payload. The declared checksum always covers the
    /// raw bytes, compressed or not.
    pub fn load_source(&mut self, raw: &[u8], compress: bool) -> Result<()> {
        self.declared_checksum = Some(checksum::crc32(raw));
        self.buffer = if compress {
            compression::deflate(raw)?
        } else {
            raw.to_vec()
        };
        self.compressed = compress;
        self.declared_length = self.buffer.len() as u32;
        Ok(())
    }

    /// Start sending once the peer accepted the upload.
    pub fn accept_upload_response(
        &mut self,
        existing_progress: u32,
        now: Instant,
    ) -> Result<()> {
        if existing_progress > self.declared_length {
            return Err(TransferError::UnalignedOffset {
                expected: u64::from(self.declared_length),
                actual: u64::from(existing_progress),
            });
        }
        self.running =
            RunningCrc::seeded(&self.buffer[..existing_progress as usize]);
        self.progress = existing_progress;
        self.start_offset = existing_progress;
        self.sent = existing_progress;
        self.set_state(TransferState::Transferring);
        self.touch(now);
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Cut the next chunk of at most `capacity` bytes, or `None` when every
    /// byte has been sent.
    pub fn next_chunk(&mut self, capacity: usize) -> Option<OutgoingChunk> {
        if self.state != TransferState::Transferring
            || self.sent >= self.declared_length
        {
            return None;
        }
        let start = self.sent as usize;
        let end = (start + capacity.max(1)).min(self.declared_length as usize);
        let payload = self.buffer[start..end].to_vec();
        let crc = self.running.advance(&payload);
        let chunk = OutgoingChunk {
            index: self.sequence_index,
            flags: ChunkFlags::new(
                self.sent == self.start_offset,
                end == self.declared_length as usize,
                true,
            ),
            crc,
            payload,
        };
        self.in_flight.push_back(InFlight {
            index: chunk.index,
            end: end as u32,
        });
        self.sent = end as u32;
        self.sequence_index = self.sequence_index.wrapping_add(1);
        Some(chunk)
    }

    /// Consume an ack for the oldest chunk in flight.
    pub fn acknowledge(
        &mut self,
        offset: u32,
        index: Option<u8>,
        now: Instant,
    ) -> Result<()> {
        let Some(front) = self.in_flight.front().copied() else {
            return Err(TransferError::UnalignedOffset {
                expected: u64::from(self.progress),
                actual: u64::from(offset),
            });
        };
        if let Some(index) = index {
            if index != front.index {
                return Err(TransferError::UnexpectedSequence {
                    expected: front.index,
                    actual: index,
                });
            }
        }
        if offset != front.end {
            return Err(TransferError::UnalignedOffset {
                expected: u64::from(front.end),
                actual: u64::from(offset),
            });
        }
        self.in_flight.pop_front();
        self.progress = offset;
        self.touch(now);
        Ok(())
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.direction == TransferDirection::Upload
            && self.state == TransferState::Transferring
            && self.in_flight.is_empty()
            && self.progress == self.declared_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FileHandle, FileKind};

    fn descriptor(size: u32) -> FileDescriptor {
        FileDescriptor::new(FileHandle::Index(5), FileKind::Activity, size)
    }

    fn download(data: &[u8], now: Instant) -> TransferRecord {
        let mut record = TransferRecord::new(
            TransferDirection::Download,
            descriptor(data.len() as u32),
            None,
            now,
        );
        record
            .accept_download_status(
                data.len() as u32,
                checksum::crc32(data),
                false,
                0,
                now,
            )
            .unwrap();
        record
    }

    #[test]
    fn two_chunk_download_completes() {
        let now = Instant::now();
        let mut record = download(b"0123456789", now);
        let first_crc = checksum::crc32(b"01234");
        record
            .accept_chunk(
                ChunkFlags::new(true, false, true),
                0,
                Some(first_crc),
                b"01234",
                now,
            )
            .unwrap();
        let second_crc = checksum::update(first_crc, b"56789");
        record
            .accept_chunk(
                ChunkFlags::new(false, true, true),
                1,
                Some(second_crc),
                b"56789",
                now,
            )
            .unwrap();
        assert!(record.is_complete());
        assert_eq!(record.progress(), 10);
        assert_eq!(record.running_checksum(), checksum::crc32(b"0123456789"));
        assert_eq!(record.finish_download().unwrap(), b"0123456789");
        assert_eq!(record.state(), TransferState::Done);
    }

    #[test]
    fn second_chunk_first_is_out_of_sequence() {
        let now = Instant::now();
        let mut record = download(b"0123456789", now);
        let result = record.accept_chunk(
            ChunkFlags::new(false, true, false),
            1,
            None,
            b"56789",
            now,
        );
        assert!(matches!(
            result,
            Err(TransferError::UnexpectedSequence {
                expected: 0,
                actual: 1
            })
        ));
        assert_eq!(record.progress(), 0);
    }

    #[test]
    fn missing_last_flag_is_rejected() {
        let now = Instant::now();
        let mut record = download(b"0123", now);
        let result = record.accept_chunk(
            ChunkFlags::new(true, false, false),
            0,
            None,
            b"0123",
            now,
        );
        assert!(matches!(result, Err(TransferError::MalformedFrame(_))));
    }

    #[test]
    fn chunk_crc_is_checked_on_arrival() {
        let now = Instant::now();
        let mut record = download(b"0123456789", now);
        let result = record.accept_chunk(
            ChunkFlags::new(true, false, true),
            0,
            Some(0x1234),
            b"01234",
            now,
        );
        assert!(matches!(
            result,
            Err(TransferError::ChunkChecksumMismatch { .. })
        ));
    }

    #[test]
    fn forged_chunk_crcs_fail_the_file_checksum() {
        let now = Instant::now();
        let mut record = download(b"0123456789", now);
        // tampered second half with a running value forged to match
        let first = checksum::crc32(b"01234");
        record
            .accept_chunk(
                ChunkFlags::new(true, false, true),
                0,
                Some(first),
                b"01234",
                now,
            )
            .unwrap();
        record
            .accept_chunk(
                ChunkFlags::new(false, true, true),
                1,
                Some(checksum::update(first, b"5678X")),
                b"5678X",
                now,
            )
            .unwrap();
        assert!(matches!(
            record.finish_download(),
            Err(TransferError::FileChecksumMismatch { .. })
        ));
    }

    #[test]
    fn resume_seeds_running_crc() {
        let now = Instant::now();
        let data = b"0123456789";
        let mut record = TransferRecord::new(
            TransferDirection::Download,
            descriptor(10),
            None,
            now,
        );
        record.retain_prefix(b"0123456".to_vec());
        record
            .accept_download_status(10, checksum::crc32(data), false, 5, now)
            .unwrap();
        assert_eq!(record.progress(), 5);
        record
            .accept_chunk(
                ChunkFlags::new(true, true, true),
                0,
                Some(checksum::crc32(data)),
                b"56789",
                now,
            )
            .unwrap();
        assert_eq!(record.finish_download().unwrap(), data);
    }

    #[test]
    fn huge_declared_size_reserves_a_bounded_buffer() {
        let now = Instant::now();
        let mut record = TransferRecord::new(
            TransferDirection::Download,
            descriptor(u32::MAX),
            None,
            now,
        );
        record
            .accept_download_status(u32::MAX, 0, false, 0, now)
            .unwrap();
        assert!(record.buffer.capacity() <= 2 * PREALLOCATION_LIMIT as usize);
        assert_eq!(record.declared_length(), u32::MAX);

        let crc = checksum::crc32(b"abc");
        record
            .accept_chunk(
                ChunkFlags::new(true, false, true),
                0,
                Some(crc),
                b"abc",
                now,
            )
            .unwrap();
        assert_eq!(record.progress(), 3);
    }

    #[test]
    fn resume_beyond_prefix_is_unaligned() {
        let now = Instant::now();
        let mut record = TransferRecord::new(
            TransferDirection::Download,
            descriptor(10),
            None,
            now,
        );
        record.retain_prefix(b"01".to_vec());
        assert!(matches!(
            record.accept_download_status(10, 0, false, 4, now),
            Err(TransferError::UnalignedOffset {
                expected: 2,
                actual: 4
            })
        ));
    }

    fn upload(len: usize, now: Instant) -> TransferRecord {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut record = TransferRecord::new(
            TransferDirection::Upload,
            descriptor(len as u32),
            None,
            now,
        );
        record.load_source(&data, false).unwrap();
        record.accept_upload_response(0, now).unwrap();
        record
    }

    #[test]
    fn upload_cuts_six_chunks() {
        let now = Instant::now();
        let mut record = upload(1024, now);
        let mut sizes = vec![];
        while let Some(chunk) = record.next_chunk(200) {
            sizes.push(chunk.payload.len());
            let last = chunk.flags.is_last();
            let end = sizes.iter().sum::<usize>() as u32;
            record.acknowledge(end, Some(chunk.index), now).unwrap();
            assert_eq!(last, end == 1024);
        }
        assert_eq!(sizes, vec![200, 200, 200, 200, 200, 24]);
        assert!(record.is_fully_acknowledged());
    }

    #[test]
    fn misplaced_ack_is_unaligned() {
        let now = Instant::now();
        let mut record = upload(1024, now);
        record.next_chunk(200).unwrap();
        assert!(matches!(
            record.acknowledge(150, None, now),
            Err(TransferError::UnalignedOffset {
                expected: 200,
                actual: 150
            })
        ));
    }

    #[test]
    fn upload_chunk_crcs_chain() {
        let now = Instant::now();
        let mut record = upload(300, now);
        let first = record.next_chunk(100).unwrap();
        let second = record.next_chunk(100).unwrap();
        assert!(first.flags.is_first());
        assert!(!second.flags.is_first());
        assert_eq!(second.crc, checksum::update(first.crc, &second.payload));
        assert_eq!(record.in_flight(), 2);
    }

    #[test]
    fn staleness_uses_last_activity() {
        let start = Instant::now();
        let record = upload(10, start);
        let timeout = Duration::from_secs(5);
        assert!(!record.is_stale(start + Duration::from_secs(5), timeout));
        assert!(record.is_stale(start + Duration::from_secs(6), timeout));
    }
}
