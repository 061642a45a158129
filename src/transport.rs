//! Collaborators the sync core talks to.
//!
//! The radio link, the local file sink and the clock are injected so the
//! protocol can run against real hardware or an in-memory peer alike.

use std::path::PathBuf;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::descriptor::FileDescriptor;
use crate::{Result, TransferError};

/// Characteristic a frame travels on.
///
/// The windowed variant streams each direction on its own bulk
/// characteristic, and the receiving side acks on the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    /// Windowed chunks from the peer, and the phone's acks for them.
    Download,
    /// Windowed chunks to the peer, and the peer's acks for them.
    Upload,
}

pub trait Transport {
    fn write_frame(&mut self, channel: Channel, bytes: &[u8]) -> Result<()>;

    /// Largest single write the link currently accepts, following MTU
    /// negotiation. Every frame handed to `write_frame` fits in it.
    fn current_max_payload_size(&self) -> usize;
}

/// Receives finished downloads and transfer progress.
pub trait FileSink {
    /// Whether the descriptor was already retrieved by this or an earlier
    /// release.
    fn is_present(&self, descriptor: &FileDescriptor) -> bool;

    fn on_transfer_complete(
        &mut self,
        descriptor: &FileDescriptor,
        bytes: &[u8],
    ) -> Result<Option<PathBuf>>;

    fn on_transfer_failed(
        &mut self,
        descriptor: &FileDescriptor,
        reason: &TransferError,
    ) {
        log::debug!("{} failed: {}", descriptor, reason);
    }

    fn on_progress(
        &mut self,
        descriptor: &FileDescriptor,
        bytes_so_far: u32,
        total: u32,
    ) {
        log::trace!("{}: {}/{}", descriptor, bytes_so_far, total);
    }
}

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Instant::now())
    }
}

/// Transport recording every write; clones share the same log and link
/// state.
///
/// Like a real link it refuses writes larger than its payload size.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    written: Arc<Mutex<Vec<(Channel, Vec<u8>)>>>,
    max_payload: Arc<AtomicUsize>,
    refusing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new(max_payload: usize) -> Self {
        Self {
            written: Arc::new(Mutex::new(vec![])),
            max_payload: Arc::new(AtomicUsize::new(max_payload)),
            refusing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Renegotiated MTU; callers then notify the session.
    pub fn set_max_payload(&self, max_payload: usize) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
    }

    /// While set, every write fails.
    pub fn refuse_writes(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Remove and return everything written so far.
    pub fn drain(&self) -> Vec<(Channel, Vec<u8>)> {
        self.written
            .lock()
            .map(|mut written| std::mem::take(&mut *written))
            .unwrap_or_default()
    }
}

impl Transport for MemoryTransport {
    fn write_frame(&mut self, channel: Channel, bytes: &[u8]) -> Result<()> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link refused the write",
            )
            .into());
        }
        let limit = self.current_max_payload_size();
        if bytes.len() > limit {
            return Err(anyhow::anyhow!(
                "{} byte write exceeds the {} byte link payload",
                bytes.len(),
                limit
            )
            .into());
        }
        self.written
            .lock()
            .map_err(|_| anyhow::anyhow!("transport log poisoned"))?
            .push((channel, bytes.to_vec()));
        Ok(())
    }

    fn current_max_payload_size(&self) -> usize {
        self.max_payload.load(Ordering::SeqCst)
    }
}
