//! Request/response state machine moving records through
//! `Idle → RequestSent → Transferring → Finalizing → Done | Failed`.
//!
//! The engine never performs I/O. Every entry point takes the current time
//! and returns the [`EngineEvent`]s the transition produced; the caller
//! writes the frames and routes completions.

use std::time::Instant;

use crate::config::SyncConfig;
use crate::descriptor::FileDescriptor;
use crate::frame::{
    self, ChunkHeader, PartialChunk, WireVariant, CMD_CHUNK, CMD_WINDOWED_CHUNK,
};
use crate::message::{Message, Status};
use crate::record::{TransferDirection, TransferRecord, TransferState};
use crate::registry::{SessionRegistry, Slot};
use crate::transport::Channel;
use crate::{Result, TransferError};

#[derive(Debug)]
pub enum EngineEvent {
    /// `slot` names the transfer the write belongs to, if any.
    Write {
        slot: Option<Slot>,
        channel: Channel,
        bytes: Vec<u8>,
    },
    Progress {
        slot: Slot,
        direction: TransferDirection,
        descriptor: FileDescriptor,
        bytes_so_far: u32,
        total: u32,
    },
    /// `data` is the verified file for downloads and empty for uploads.
    Completed {
        slot: Slot,
        direction: TransferDirection,
        descriptor: FileDescriptor,
        data: Vec<u8>,
    },
    Failed {
        slot: Slot,
        direction: TransferDirection,
        descriptor: FileDescriptor,
        error: TransferError,
    },
}

impl EngineEvent {
    fn control(message: Message) -> Self {
        log::trace!("-> {:?}", message);
        EngineEvent::Write {
            slot: None,
            channel: Channel::Control,
            bytes: message.encode(),
        }
    }

    fn for_slot(mut self, owner: Slot) -> Self {
        if let EngineEvent::Write { slot, .. } = &mut self {
            *slot = Some(owner);
        }
        self
    }
}

pub struct TransferEngine {
    variant: WireVariant,
    max_block_size: usize,
    window_size: u8,
    mtu: usize,
    registry: SessionRegistry,
}

impl TransferEngine {
    pub fn new(variant: WireVariant, config: &SyncConfig) -> Self {
        log::info!("Transfer engine speaking {}", variant);
        Self {
            variant,
            max_block_size: config.max_block_size,
            window_size: config.window_size,
            mtu: config.default_mtu,
            registry: SessionRegistry::new(config.transfer_timeout()),
        }
    }

    pub fn variant(&self) -> WireVariant {
        self.variant
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// `mtu` is the link MTU: the transport's largest write plus
    /// [`frame::LINK_OVERHEAD`].
    pub fn set_mtu(&mut self, mtu: usize) {
        if mtu != self.mtu {
            log::debug!("MTU changed from {} to {}", self.mtu, mtu);
            self.mtu = mtu;
        }
    }

    pub fn chunk_capacity(&self, compressed: bool) -> usize {
        self.variant
            .chunk_capacity(self.max_block_size, self.mtu, compressed)
    }

    fn slot_for(&self, session: u8, direction: TransferDirection) -> Slot {
        match self.variant {
            WireVariant::AckPerChunk { .. } => Slot::Session(session),
            WireVariant::Windowed { .. } => Slot::Current(direction),
        }
    }

    fn allocate_slot(&mut self, direction: TransferDirection) -> Result<Slot> {
        match self.variant {
            WireVariant::AckPerChunk { .. } => self
                .registry
                .allocate_session()
                .map(Slot::Session)
                .ok_or(TransferError::SlotBusy(Slot::Session(u8::MAX))),
            WireVariant::Windowed { .. } => Ok(Slot::Current(direction)),
        }
    }

    /// Ask the peer for a file, optionally resuming from a retained prefix.
    pub fn start_download(
        &mut self,
        descriptor: &FileDescriptor,
        resume: Option<Vec<u8>>,
        now: Instant,
    ) -> Result<(Slot, Vec<EngineEvent>)> {
        let slot = self.allocate_slot(TransferDirection::Download)?;
        let mut record = TransferRecord::new(
            TransferDirection::Download,
            descriptor.clone(),
            None,
            now,
        );
        if let Some(prefix) = resume {
            record.retain_prefix(prefix);
        }
        let offset = record.retained_len();
        let admission = self.registry.begin_with(slot, record, now)?;
        admission.record.set_state(TransferState::RequestSent);

        let mut events = vec![];
        if let Some(evicted) = admission.evicted {
            events.push(failed(slot, evicted, TransferError::Timeout));
        }
        log::info!("Requesting {} from offset {} on {}", descriptor, offset, slot);
        events.push(
            EngineEvent::control(Message::DownloadRequest {
                session: slot.session_id(),
                handle: descriptor.handle,
                offset,
            })
            .for_slot(slot),
        );
        Ok((slot, events))
    }

    /// Announce an upload; chunks flow once the peer accepts.
    ///
    /// Compression is only honoured by the windowed variant, the
    /// ack-per-chunk variant sends the raw bytes.
    pub fn start_upload(
        &mut self,
        descriptor: &FileDescriptor,
        data: &[u8],
        compress: bool,
        now: Instant,
    ) -> Result<(Slot, Vec<EngineEvent>)> {
        let compress = compress && self.variant.supports_compression();
        let slot = self.allocate_slot(TransferDirection::Upload)?;
        let mut record = TransferRecord::new(
            TransferDirection::Upload,
            descriptor.clone(),
            Some(data.len() as u32),
            now,
        );
        record.load_source(data, compress)?;
        let length = record.declared_length();
        let crc = record.declared_checksum().unwrap_or_default();
        let compressed_chunk_size =
            compress.then(|| self.chunk_capacity(true) as u32);

        let admission = self.registry.begin_with(slot, record, now)?;
        admission.record.set_state(TransferState::RequestSent);

        let mut events = vec![];
        if let Some(evicted) = admission.evicted {
            events.push(failed(slot, evicted, TransferError::Timeout));
        }
        log::info!(
            "Offering {} ({} bytes on the wire) on {}",
            descriptor,
            length,
            slot
        );
        events.push(
            EngineEvent::control(Message::TransferRequest {
                session: slot.session_id(),
                descriptor: descriptor.clone(),
                length,
                crc,
                compressed_chunk_size,
            })
            .for_slot(slot),
        );
        Ok((slot, events))
    }

    /// Mark a transfer for eviction; observed by the next event.
    pub fn cancel(&mut self, slot: Slot) -> bool {
        self.registry.cancel(slot)
    }

    /// Fail a live transfer from outside the wire, e.g. a refused write.
    pub fn fail(&mut self, slot: Slot, error: TransferError) -> Vec<EngineEvent> {
        let mut events = vec![];
        self.fail_slot(slot, error, &mut events);
        events
    }

    pub fn reap_cancelled(&mut self) -> Vec<EngineEvent> {
        let mut events = vec![];
        for (slot, record) in self.registry.take_cancelled() {
            events.push(EngineEvent::control(Message::Cancel {
                session: slot.session_id(),
            }));
            events.push(failed(slot, record, TransferError::Cancelled));
        }
        events
    }

    /// Stall detection; called on every timer tick.
    pub fn on_tick(&mut self, now: Instant) -> Vec<EngineEvent> {
        let mut events = self.reap_cancelled();
        for (slot, record) in self.registry.expire(now) {
            log::warn!("{} of {} stalled", record.direction(), slot);
            events.push(failed(slot, record, TransferError::Timeout));
        }
        events
    }

    pub fn on_link_lost(&mut self) -> Vec<EngineEvent> {
        let records = self.registry.fail_all();
        if !records.is_empty() {
            log::warn!("Link lost with {} transfers active", records.len());
        }
        records
            .into_iter()
            .map(|(slot, record)| failed(slot, record, TransferError::LinkLost))
            .collect()
    }

    pub fn handle_frame(
        &mut self,
        channel: Channel,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<EngineEvent> {
        let mut events = self.reap_cancelled();
        if bytes.is_empty() {
            log::warn!("Ignoring empty frame on {:?}", channel);
            return events;
        }
        log::trace!("<- {:?} {:02x?}", channel, bytes);
        match channel {
            Channel::Download => self.on_download_write(bytes, now, &mut events),
            Channel::Upload => self.on_upload_write(bytes, now, &mut events),
            Channel::Control if bytes[0] == CMD_CHUNK => {
                self.on_ack_per_chunk_frame(bytes, now, &mut events)
            }
            Channel::Control => match Message::decode(bytes) {
                Ok(message) => self.on_message(message, now, &mut events),
                Err(e) => log::warn!("Dropping control frame: {}", e),
            },
        }
        events
    }

    fn on_message(
        &mut self,
        message: Message,
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        match message {
            Message::TransferRequest {
                session,
                descriptor,
                length,
                crc,
                compressed_chunk_size,
            } => self.on_peer_announcement(
                session,
                descriptor,
                length,
                crc,
                compressed_chunk_size.is_some(),
                now,
                events,
            ),
            Message::TransferResponse {
                session,
                status,
                existing_progress,
            } => self.on_upload_response(
                session,
                status,
                existing_progress,
                now,
                events,
            ),
            Message::DownloadStatus {
                session,
                status,
                max_size,
                crc,
                compressed,
                existing_progress,
            } => {
                let slot = self.slot_for(session, TransferDirection::Download);
                let result = match self.registry.current_mut(slot) {
                    Some(record)
                        if record.state() == TransferState::RequestSent =>
                    {
                        if status.can_proceed() {
                            record
                                .accept_download_status(
                                    max_size,
                                    crc,
                                    compressed,
                                    existing_progress,
                                    now,
                                )
                                .map(|_| record.is_complete())
                        } else {
                            Err(TransferError::PeerRejected { status: status.0 })
                        }
                    }
                    Some(_) => Err(TransferError::malformed(
                        "download status outside a request",
                    )),
                    None => {
                        log::debug!("Download status for idle {}", slot);
                        return;
                    }
                };
                match result {
                    Ok(true) => self.finalize(slot, events),
                    Ok(false) => log::debug!("{} transferring", slot),
                    Err(e) => self.fail_slot(slot, e, events),
                }
            }
            Message::ChunkAck {
                session,
                status,
                offset,
            } => {
                let slot = self.slot_for(session, TransferDirection::Upload);
                self.on_ack(slot, status, offset, None, now, events)
            }
            Message::WindowAck {
                status,
                index,
                offset,
            } => {
                let slot = Slot::Current(TransferDirection::Upload);
                self.on_ack(slot, status, offset, Some(index), now, events)
            }
            Message::Cancel { session } => {
                for direction in
                    [TransferDirection::Download, TransferDirection::Upload]
                {
                    let slot = self.slot_for(session, direction);
                    self.fail_slot(slot, TransferError::Cancelled, events);
                }
            }
            other => log::debug!("Ignoring {:?}", other),
        }
    }

    fn on_ack_per_chunk_frame(
        &mut self,
        bytes: &[u8],
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        match frame::decode(bytes) {
            Ok(header) => {
                let slot = Slot::Session(header.session.unwrap_or_default());
                let payload = header.payload(bytes);
                self.receive_chunk(slot, header, payload, now, events);
            }
            Err(e) => match bytes.get(2) {
                Some(&session) => {
                    self.fail_slot(Slot::Session(session), e, events)
                }
                None => log::warn!("Dropping data frame: {}", e),
            },
        }
    }

    /// One link write of the windowed download channel: a chunk header or
    /// the continuation of a pending chunk.
    fn on_download_write(
        &mut self,
        bytes: &[u8],
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        let slot = Slot::Current(TransferDirection::Download);
        let pending = self
            .registry
            .current_mut(slot)
            .and_then(|record| record.take_partial());
        let partial = match pending {
            Some(mut partial) => match partial.push(bytes) {
                Ok(()) => partial,
                Err(e) => return self.fail_slot(slot, e, events),
            },
            None if bytes[0] == CMD_WINDOWED_CHUNK => {
                let started = frame::decode_partial(bytes)
                    .and_then(|header| PartialChunk::start(header, bytes));
                match started {
                    Ok(partial) => partial,
                    Err(e) => return self.fail_slot(slot, e, events),
                }
            }
            None => {
                log::warn!(
                    "Dropping download channel write starting {:#04x}",
                    bytes[0]
                );
                return;
            }
        };

        if !partial.is_complete() {
            match self.registry.current_mut(slot) {
                Some(record) => record.set_partial(partial),
                None => log::debug!("Discarding partial chunk for idle slot"),
            }
            return;
        }
        let header = partial.header;
        let payload = partial.into_payload();
        self.receive_chunk(slot, header, &payload, now, events);
    }

    /// The upload channel only carries the peer's window acks.
    fn on_upload_write(
        &mut self,
        bytes: &[u8],
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        match Message::decode(bytes) {
            Ok(message @ Message::WindowAck { .. }) => {
                self.on_message(message, now, events)
            }
            Ok(other) => log::warn!("Unexpected {:?} on the upload channel", other),
            Err(e) => log::warn!("Dropping upload channel write: {}", e),
        }
    }

    fn receive_chunk(
        &mut self,
        slot: Slot,
        header: ChunkHeader,
        payload: &[u8],
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        let result = match self.registry.current_mut(slot) {
            Some(record) if record.direction() == TransferDirection::Download => {
                record
                    .accept_chunk(
                        header.flags,
                        header.index,
                        header.crc,
                        payload,
                        now,
                    )
                    .map(|_| {
                        (
                            record.descriptor().clone(),
                            record.progress(),
                            record.declared_length(),
                            record.is_complete(),
                        )
                    })
            }
            Some(_) => Err(TransferError::malformed("data chunk for an upload")),
            None => {
                log::debug!("Discarding chunk {} for idle {}", header.index, slot);
                return;
            }
        };
        let (descriptor, bytes_so_far, total, complete) = match result {
            Ok(accepted) => accepted,
            Err(e) => return self.fail_slot(slot, e, events),
        };

        let ack = match self.variant {
            WireVariant::AckPerChunk { .. } => Message::ChunkAck {
                session: slot.session_id(),
                status: Status::PROCEED,
                offset: bytes_so_far,
            },
            WireVariant::Windowed { .. } => Message::WindowAck {
                status: Status::PROCEED,
                index: header.index,
                offset: bytes_so_far,
            },
        };
        events.push(EngineEvent::Write {
            slot: Some(slot),
            channel: self.download_ack_channel(),
            bytes: ack.encode(),
        });
        events.push(EngineEvent::Progress {
            slot,
            direction: TransferDirection::Download,
            descriptor,
            bytes_so_far,
            total,
        });
        if complete {
            self.finalize(slot, events);
        }
    }

    fn download_ack_channel(&self) -> Channel {
        match self.variant {
            WireVariant::AckPerChunk { .. } => Channel::Control,
            WireVariant::Windowed { .. } => Channel::Download,
        }
    }

    fn finalize(&mut self, slot: Slot, events: &mut Vec<EngineEvent>) {
        let Some(mut record) = self.registry.complete(slot) else {
            return;
        };
        match record.finish_download() {
            Ok(data) => {
                log::info!(
                    "Downloaded {} ({} bytes) on {}",
                    record.descriptor(),
                    data.len(),
                    slot
                );
                events.push(EngineEvent::Completed {
                    slot,
                    direction: TransferDirection::Download,
                    descriptor: record.descriptor().clone(),
                    data,
                });
            }
            Err(e) => events.push(failed(slot, record, e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_peer_announcement(
        &mut self,
        session: u8,
        descriptor: FileDescriptor,
        length: u32,
        crc: u32,
        compressed: bool,
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        let slot = self.slot_for(session, TransferDirection::Download);
        let mut record = TransferRecord::new(
            TransferDirection::Download,
            descriptor,
            Some(length),
            now,
        );
        let accepted = record.accept_announcement(length, crc, compressed, now);
        let admitted = match accepted {
            Ok(()) => self.registry.begin_with(slot, record, now),
            Err(e) => Err(e),
        };
        let status = match admitted {
            Ok(admission) => {
                let complete = admission.record.is_complete();
                log::info!(
                    "Peer pushes {} on {}",
                    admission.record.descriptor(),
                    slot
                );
                if let Some(evicted) = admission.evicted {
                    events.push(failed(slot, evicted, TransferError::Timeout));
                }
                events.push(
                    EngineEvent::control(Message::TransferResponse {
                        session,
                        status: Status::PROCEED,
                        existing_progress: 0,
                    })
                    .for_slot(slot),
                );
                if complete {
                    self.finalize(slot, events);
                }
                return;
            }
            Err(TransferError::SlotBusy(_)) => Status::BUSY,
            Err(e) => {
                log::warn!("Refusing peer transfer on {}: {}", slot, e);
                Status::ERROR
            }
        };
        events.push(EngineEvent::control(Message::TransferResponse {
            session,
            status,
            existing_progress: 0,
        }));
    }

    fn on_upload_response(
        &mut self,
        session: u8,
        status: Status,
        existing_progress: u32,
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        let slot = self.slot_for(session, TransferDirection::Upload);
        let result = match self.registry.current_mut(slot) {
            Some(record)
                if record.direction() == TransferDirection::Upload
                    && record.state() == TransferState::RequestSent =>
            {
                if status.can_proceed() {
                    record.accept_upload_response(existing_progress, now)
                } else {
                    Err(TransferError::PeerRejected { status: status.0 })
                }
            }
            Some(_) => Err(TransferError::malformed(
                "transfer response outside an upload request",
            )),
            None => {
                log::debug!("Transfer response for idle {}", slot);
                return;
            }
        };
        match result {
            Ok(()) => self.pump_upload(slot, events),
            Err(e) => self.fail_slot(slot, e, events),
        }
    }

    fn on_ack(
        &mut self,
        slot: Slot,
        status: Status,
        offset: u32,
        index: Option<u8>,
        now: Instant,
        events: &mut Vec<EngineEvent>,
    ) {
        let result = match self.registry.current_mut(slot) {
            Some(record)
                if record.direction() == TransferDirection::Upload
                    && record.state() == TransferState::Transferring =>
            {
                if status.can_proceed() {
                    record.acknowledge(offset, index, now).map(|_| {
                        (
                            record.descriptor().clone(),
                            record.progress(),
                            record.declared_length(),
                        )
                    })
                } else {
                    Err(TransferError::PeerRejected { status: status.0 })
                }
            }
            Some(_) => Err(TransferError::malformed("ack outside an upload")),
            None => {
                log::debug!("Ack for idle {}", slot);
                return;
            }
        };
        match result {
            Ok((descriptor, bytes_so_far, total)) => {
                events.push(EngineEvent::Progress {
                    slot,
                    direction: TransferDirection::Upload,
                    descriptor,
                    bytes_so_far,
                    total,
                });
                self.pump_upload(slot, events);
            }
            Err(e) => self.fail_slot(slot, e, events),
        }
    }

    /// Fill the window with chunks, or finish once everything is acked.
    fn pump_upload(&mut self, slot: Slot, events: &mut Vec<EngineEvent>) {
        let compressed = match self.registry.current(slot) {
            Some(record) => record.is_compressed(),
            None => return,
        };
        let capacity = self.chunk_capacity(compressed);
        let window = self.variant.window(self.window_size);
        let (variant, mtu) = (self.variant, self.mtu);
        let Some(record) = self.registry.current_mut(slot) else {
            return;
        };

        while record.in_flight() < window {
            let Some(chunk) = record.next_chunk(capacity) else {
                break;
            };
            log::trace!(
                "sending chunk {} ({} bytes) on {}",
                chunk.index,
                chunk.payload.len(),
                slot
            );
            match variant {
                WireVariant::AckPerChunk { .. } => {
                    events.push(EngineEvent::Write {
                        slot: Some(slot),
                        channel: Channel::Control,
                        bytes: frame::encode_ack_per_chunk(
                            slot.session_id(),
                            &chunk,
                        ),
                    })
                }
                WireVariant::Windowed { .. } => {
                    let framed = frame::encode_windowed(&chunk);
                    for bytes in frame::split_for_link(&framed, mtu) {
                        events.push(EngineEvent::Write {
                            slot: Some(slot),
                            channel: Channel::Upload,
                            bytes,
                        });
                    }
                }
            }
        }

        if record.is_fully_acknowledged() {
            if let Some(mut record) = self.registry.complete(slot) {
                record.set_state(TransferState::Done);
                log::info!("Uploaded {} on {}", record.descriptor(), slot);
                events.push(EngineEvent::control(Message::SyncComplete {
                    session: slot.session_id(),
                }));
                events.push(EngineEvent::Completed {
                    slot,
                    direction: TransferDirection::Upload,
                    descriptor: record.descriptor().clone(),
                    data: vec![],
                });
            }
        }
    }

    fn fail_slot(
        &mut self,
        slot: Slot,
        error: TransferError,
        events: &mut Vec<EngineEvent>,
    ) {
        match self.registry.fail(slot) {
            Some(record) => events.push(failed(slot, record, error)),
            None => log::debug!("{} already gone: {}", slot, error),
        }
    }
}

fn failed(
    slot: Slot,
    mut record: TransferRecord,
    error: TransferError,
) -> EngineEvent {
    record.set_state(TransferState::Failed);
    log::warn!(
        "{} of {} on {} failed: {}",
        record.direction(),
        record.descriptor(),
        slot,
        error
    );
    EngineEvent::Failed {
        slot,
        direction: record.direction(),
        descriptor: record.descriptor().clone(),
        error,
    }
}
