//! Everything that happens on one device connection.
//!
//! [`SyncSession`] negotiates the wire variant, feeds inbound frames to the
//! [`TransferEngine`], routes engine outcomes to the file sink and the
//! [`DownloadQueue`], and turns queue decisions into new transfers. All
//! methods are plain calls made from a single logical event stream.

use std::path::PathBuf;

use crate::config::SyncConfig;
use crate::descriptor::FileDescriptor;
use crate::directory;
use crate::engine::{EngineEvent, TransferEngine};
use crate::frame::{WireVariant, LINK_OVERHEAD};
use crate::message::Message;
use crate::queue::{BatchSummary, DownloadQueue, QueueAction};
use crate::record::TransferDirection;
use crate::registry::Slot;
use crate::transport::{Channel, Clock, FileSink, Transport};
use crate::{Result, TransferError};

#[derive(Debug)]
pub enum SyncEvent {
    Connected {
        variant: WireVariant,
    },
    Progress {
        direction: TransferDirection,
        descriptor: FileDescriptor,
        bytes_so_far: u32,
        total: u32,
    },
    FileStored {
        descriptor: FileDescriptor,
        path: Option<PathBuf>,
    },
    FileSkipped(FileDescriptor),
    FileFailed {
        descriptor: FileDescriptor,
        error: TransferError,
    },
    UploadFinished(FileDescriptor),
    UploadFailed {
        descriptor: FileDescriptor,
        error: TransferError,
    },
    /// The application should request the next file-list page.
    FileListRequested,
    BatchFinished(BatchSummary),
}

pub struct SyncSession {
    config: SyncConfig,
    engine: Option<TransferEngine>,
    queue: DownloadQueue,
    current_slot: Option<Slot>,
    transport: Box<dyn Transport + Send>,
    sink: Box<dyn FileSink + Send>,
    clock: Box<dyn Clock + Send>,
}

impl SyncSession {
    pub fn new(
        config: SyncConfig,
        transport: Box<dyn Transport + Send>,
        sink: Box<dyn FileSink + Send>,
        clock: Box<dyn Clock + Send>,
    ) -> Self {
        Self {
            queue: DownloadQueue::new(&config),
            config,
            engine: None,
            current_slot: None,
            transport,
            sink,
            clock,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> Option<&TransferEngine> {
        self.engine.as_ref()
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn is_negotiated(&self) -> bool {
        self.engine.is_some()
    }

    /// Link is up: ask the peer which protocol generation it speaks.
    pub fn on_connected(&mut self) -> Vec<SyncEvent> {
        log::info!("Connected, requesting capabilities");
        self.engine = None;
        self.write(Channel::Control, &Message::CapabilitiesRequest.encode());
        vec![]
    }

    pub fn on_frame_received(
        &mut self,
        channel: Channel,
        bytes: &[u8],
    ) -> Vec<SyncEvent> {
        let mut out = vec![];
        let now = self.clock.now();
        match self.engine.as_mut() {
            Some(engine) => {
                let events = engine.handle_frame(channel, bytes, now);
                self.apply(events, &mut out);
            }
            None => self.negotiate(bytes, &mut out),
        }
        self.pump(&mut out);
        out
    }

    fn negotiate(&mut self, bytes: &[u8], out: &mut Vec<SyncEvent>) {
        match Message::decode(bytes) {
            Ok(Message::Capabilities {
                version,
                chunk_size,
                compressed_chunk_size,
            }) => {
                let Some(variant) = WireVariant::from_capabilities(
                    version,
                    chunk_size,
                    compressed_chunk_size,
                ) else {
                    log::warn!("Unsupported transfer protocol {}", version);
                    return;
                };
                let mut engine = TransferEngine::new(variant, &self.config);
                engine.set_mtu(self.link_mtu());
                self.engine = Some(engine);
                out.push(SyncEvent::Connected { variant });
            }
            Ok(other) => log::debug!("Ignoring {:?} before negotiation", other),
            Err(e) => log::warn!("Dropping frame before negotiation: {}", e),
        }
    }

    /// The transport renegotiated its MTU; chunk sizes follow its new
    /// payload size.
    pub fn on_mtu_changed(&mut self) {
        let mtu = self.link_mtu();
        if let Some(engine) = self.engine.as_mut() {
            engine.set_mtu(mtu);
        }
    }

    fn link_mtu(&self) -> usize {
        self.transport.current_max_payload_size() + LINK_OVERHEAD
    }

    pub fn on_tick(&mut self) -> Vec<SyncEvent> {
        let mut out = vec![];
        let now = self.clock.now();
        if let Some(engine) = self.engine.as_mut() {
            let events = engine.on_tick(now);
            self.apply(events, &mut out);
        }
        self.pump(&mut out);
        out
    }

    /// Fails every active transfer and abandons the rest of the batch.
    pub fn on_link_lost(&mut self) -> Vec<SyncEvent> {
        let mut out = vec![];
        if let Some(mut engine) = self.engine.take() {
            let events = engine.on_link_lost();
            self.apply(events, &mut out);
        }
        self.queue.clear();
        for action in self.queue.poll(|_| false) {
            if let QueueAction::BatchFinished(summary) = action {
                out.push(SyncEvent::BatchFinished(summary));
            }
        }
        out
    }

    /// Fetch the root directory and everything it lists.
    pub fn sync(&mut self) -> Vec<SyncEvent> {
        self.queue.enqueue_directory(FileDescriptor::root_directory());
        let mut out = vec![];
        self.pump(&mut out);
        out
    }

    pub fn enqueue(&mut self, descriptor: FileDescriptor) -> Vec<SyncEvent> {
        self.queue.enqueue(descriptor);
        let mut out = vec![];
        self.pump(&mut out);
        out
    }

    pub fn on_directory_entries(
        &mut self,
        entries: Vec<FileDescriptor>,
    ) -> Vec<SyncEvent> {
        self.queue.on_directory_entries(entries);
        let mut out = vec![];
        self.pump(&mut out);
        out
    }

    pub fn on_file_list_page(
        &mut self,
        entries: Vec<FileDescriptor>,
        has_more: bool,
    ) -> Vec<SyncEvent> {
        let mut out = vec![];
        if self.queue.on_file_list_page(entries, has_more) {
            out.push(SyncEvent::FileListRequested);
        } else {
            self.pump(&mut out);
        }
        out
    }

    pub fn upload(
        &mut self,
        descriptor: FileDescriptor,
        data: &[u8],
        compress: bool,
    ) -> Result<Vec<SyncEvent>> {
        let now = self.clock.now();
        let engine = self.engine.as_mut().ok_or_else(|| {
            anyhow::anyhow!("transfer protocol not negotiated yet")
        })?;
        let (_, events) = engine.start_upload(&descriptor, data, compress, now)?;
        let mut out = vec![];
        self.apply(events, &mut out);
        Ok(out)
    }

    /// Cancel the queue's current download; the next event reports it.
    pub fn cancel_current(&mut self) -> bool {
        match (self.engine.as_mut(), self.current_slot) {
            (Some(engine), Some(slot)) => engine.cancel(slot),
            _ => false,
        }
    }

    /// Start queued work while no download is outstanding.
    fn pump(&mut self, out: &mut Vec<SyncEvent>) {
        loop {
            if self.engine.is_none() || self.queue.current().is_some() {
                return;
            }
            let sink = &self.sink;
            let actions =
                self.queue.poll(|descriptor| sink.is_present(descriptor));
            let mut start_failed = false;
            for action in actions {
                match action {
                    QueueAction::Start(descriptor) => {
                        let now = self.clock.now();
                        let Some(engine) = self.engine.as_mut() else {
                            return;
                        };
                        match engine.start_download(&descriptor, None, now) {
                            Ok((slot, events)) => {
                                self.current_slot = Some(slot);
                                self.apply(events, out);
                                start_failed = self.current_slot.is_none();
                            }
                            Err(error) => {
                                self.fail_current(descriptor, error, out);
                                start_failed = true;
                            }
                        }
                    }
                    QueueAction::Skipped(descriptor) => {
                        out.push(SyncEvent::FileSkipped(descriptor))
                    }
                    QueueAction::MarkArchived { handle, flags } => {
                        log::debug!("Archiving file {} on the peer", handle);
                        let message = Message::SetFileFlags { handle, flags };
                        self.write(Channel::Control, &message.encode());
                    }
                    QueueAction::BatchFinished(summary) => {
                        out.push(SyncEvent::BatchFinished(summary))
                    }
                }
            }
            if !start_failed {
                return;
            }
        }
    }

    fn apply(&mut self, events: Vec<EngineEvent>, out: &mut Vec<SyncEvent>) {
        let mut broken: Vec<Slot> = vec![];
        for event in events {
            match event {
                EngineEvent::Write { slot, channel, bytes } => {
                    if slot.map_or(false, |slot| broken.contains(&slot)) {
                        continue;
                    }
                    if let Err(error) = self.transport.write_frame(channel, &bytes)
                    {
                        log::error!(
                            "Failed to write {} bytes on {:?}: {}",
                            bytes.len(),
                            channel,
                            error
                        );
                        if let Some(slot) = slot {
                            broken.push(slot);
                            let failed = match self.engine.as_mut() {
                                Some(engine) => engine.fail(slot, error),
                                None => vec![],
                            };
                            self.apply(failed, out);
                        }
                    }
                }
                EngineEvent::Progress {
                    direction,
                    descriptor,
                    bytes_so_far,
                    total,
                    ..
                } => {
                    self.sink.on_progress(&descriptor, bytes_so_far, total);
                    out.push(SyncEvent::Progress {
                        direction,
                        descriptor,
                        bytes_so_far,
                        total,
                    });
                }
                EngineEvent::Completed {
                    slot,
                    direction: TransferDirection::Download,
                    descriptor,
                    data,
                } => self.on_download_complete(slot, descriptor, data, out),
                EngineEvent::Completed {
                    direction: TransferDirection::Upload,
                    descriptor,
                    ..
                } => out.push(SyncEvent::UploadFinished(descriptor)),
                EngineEvent::Failed {
                    slot,
                    direction: TransferDirection::Download,
                    descriptor,
                    error,
                } => {
                    if self.take_slot(slot) {
                        self.fail_current(descriptor, error, out);
                    } else {
                        self.sink.on_transfer_failed(&descriptor, &error);
                        out.push(SyncEvent::FileFailed { descriptor, error });
                    }
                }
                EngineEvent::Failed {
                    direction: TransferDirection::Upload,
                    descriptor,
                    error,
                    ..
                } => out.push(SyncEvent::UploadFailed { descriptor, error }),
            }
        }
    }

    fn take_slot(&mut self, slot: Slot) -> bool {
        if self.current_slot == Some(slot) {
            self.current_slot = None;
            true
        } else {
            false
        }
    }

    fn on_download_complete(
        &mut self,
        slot: Slot,
        descriptor: FileDescriptor,
        data: Vec<u8>,
        out: &mut Vec<SyncEvent>,
    ) {
        let ours = self.take_slot(slot);
        if descriptor.is_directory() {
            match directory::parse(&data) {
                Ok(entries) => {
                    log::info!("Directory lists {} entries", entries.len());
                    if ours {
                        self.queue.on_completed(&descriptor, data.len() as u64);
                    }
                    self.queue.on_directory_listing(&entries);
                }
                Err(error) if ours => self.fail_current(descriptor, error, out),
                Err(error) => out.push(SyncEvent::FileFailed { descriptor, error }),
            }
            return;
        }

        match self.sink.on_transfer_complete(&descriptor, &data) {
            Ok(path) => {
                out.push(SyncEvent::FileStored {
                    descriptor: descriptor.clone(),
                    path,
                });
                if ours {
                    let actions =
                        self.queue.on_completed(&descriptor, data.len() as u64);
                    for action in actions {
                        if let QueueAction::MarkArchived { handle, flags } = action {
                            let message = Message::SetFileFlags { handle, flags };
                            self.write(Channel::Control, &message.encode());
                        }
                    }
                }
            }
            Err(error) => {
                log::error!("Failed to store {}: {}", descriptor, error);
                if ours {
                    self.fail_current(descriptor, error, out);
                } else {
                    out.push(SyncEvent::FileFailed { descriptor, error });
                }
            }
        }
    }

    fn fail_current(
        &mut self,
        descriptor: FileDescriptor,
        error: TransferError,
        out: &mut Vec<SyncEvent>,
    ) {
        self.sink.on_transfer_failed(&descriptor, &error);
        self.queue.on_failed(&descriptor, &error);
        out.push(SyncEvent::FileFailed { descriptor, error });
    }

    /// Writes owned by no transfer; a refusal is only logged.
    fn write(&mut self, channel: Channel, bytes: &[u8]) {
        if let Err(e) = self.transport.write_frame(channel, bytes) {
            log::error!(
                "Failed to write {} bytes on {:?}: {}",
                bytes.len(),
                channel,
                e
            );
        }
    }
}
