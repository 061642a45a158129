#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use bandsync::checksum;
use bandsync::compression;
use bandsync::descriptor::{FileDescriptor, FileHandle};
use bandsync::directory::DirectoryEntry;
use bandsync::frame::{self, ChunkFlags, OutgoingChunk, PartialChunk};
use bandsync::message::{Message, Status};
use bandsync::transport::{MemoryTransport, Transport};
use bandsync::{Channel, SyncEvent, SyncSession, TransferDirection};

pub type Reply = (Channel, Vec<u8>);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Outgoing {
    data: Vec<u8>,
    sent: usize,
    index: u8,
    crc: u32,
}

struct Incoming {
    descriptor: FileDescriptor,
    compressed: bool,
    data: Vec<u8>,
}

/// Wearable speaking either the ack-per-chunk (v2) or the windowed (v3)
/// variant.
pub struct SimulatedPeer {
    pub files: HashMap<u16, Vec<u8>>,
    pub rejected: HashSet<u16>,
    pub silent: HashSet<u16>,
    /// Windowed downloads are served deflated.
    pub compress: bool,
    pub archived: Vec<(FileHandle, u8)>,
    pub received: Vec<(FileDescriptor, Vec<u8>)>,
    version: u8,
    chunk: usize,
    link_payload: usize,
    outgoing: HashMap<u8, Outgoing>,
    incoming: HashMap<u8, Incoming>,
    pending_upload: Option<PartialChunk>,
}

impl SimulatedPeer {
    pub fn new(chunk: usize) -> Self {
        Self {
            files: HashMap::new(),
            rejected: HashSet::new(),
            silent: HashSet::new(),
            compress: false,
            archived: vec![],
            received: vec![],
            version: 2,
            chunk,
            link_payload: 244,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            pending_upload: None,
        }
    }

    pub fn windowed(chunk: usize) -> Self {
        Self {
            version: 3,
            ..Self::new(chunk)
        }
    }

    /// Largest write the peer's side of the link accepts.
    pub fn with_link_payload(mut self, link_payload: usize) -> Self {
        self.link_payload = link_payload;
        self
    }

    fn is_windowed(&self) -> bool {
        self.version >= 3
    }

    pub fn with_directory(mut self, entries: &[DirectoryEntry]) -> Self {
        let mut listing = vec![];
        for entry in entries {
            entry.encode_into(&mut listing);
        }
        self.files.insert(0, listing);
        self
    }

    pub fn handle(&mut self, channel: Channel, bytes: &[u8]) -> Vec<Reply> {
        assert!(bytes.len() <= self.link_payload, "{} byte write", bytes.len());
        match channel {
            Channel::Control if bytes[0] == frame::CMD_CHUNK => {
                self.on_upload_chunk(bytes)
            }
            Channel::Upload => self.on_windowed_upload_write(bytes),
            Channel::Download => match Message::decode(bytes).unwrap() {
                Message::WindowAck { offset, .. } => {
                    self.on_ack(0, offset as usize)
                }
                other => panic!("unexpected {:?} on the download channel", other),
            },
            Channel::Control => self.on_control(Message::decode(bytes).unwrap()),
        }
    }

    fn on_control(&mut self, message: Message) -> Vec<Reply> {
        match message {
            Message::CapabilitiesRequest => control(Message::Capabilities {
                version: self.version,
                chunk_size: self.chunk as u16,
                compressed_chunk_size: self
                    .is_windowed()
                    .then(|| self.chunk as u32),
            }),
            Message::DownloadRequest {
                session,
                handle: FileHandle::Index(index),
                ..
            } => self.on_download_request(session, index),
            Message::ChunkAck {
                session, offset, ..
            } => self.on_ack(session, offset as usize),
            Message::SetFileFlags { handle, flags } => {
                self.archived.push((handle, flags));
                vec![]
            }
            Message::TransferRequest {
                session,
                descriptor,
                compressed_chunk_size,
                ..
            } => {
                self.incoming.insert(
                    session,
                    Incoming {
                        descriptor,
                        compressed: compressed_chunk_size.is_some(),
                        data: vec![],
                    },
                );
                control(Message::TransferResponse {
                    session,
                    status: Status::PROCEED,
                    existing_progress: 0,
                })
            }
            Message::SyncComplete { session } => {
                if let Some(incoming) = self.incoming.remove(&session) {
                    let data = if incoming.compressed {
                        compression::inflate(&incoming.data).unwrap()
                    } else {
                        incoming.data
                    };
                    self.received.push((incoming.descriptor, data));
                }
                vec![]
            }
            _ => vec![],
        }
    }

    fn on_download_request(&mut self, session: u8, index: u16) -> Vec<Reply> {
        if self.silent.contains(&index) {
            return vec![];
        }
        let data = match self.files.get(&index) {
            Some(data) if !self.rejected.contains(&index) => data.clone(),
            _ => {
                return control(Message::DownloadStatus {
                    session,
                    status: Status::ERROR,
                    max_size: 0,
                    crc: 0,
                    compressed: false,
                    existing_progress: 0,
                })
            }
        };
        let compressed = self.compress && self.is_windowed();
        let crc = checksum::crc32(&data);
        let data = if compressed {
            compression::deflate(&data).unwrap()
        } else {
            data
        };
        let status = Message::DownloadStatus {
            session,
            status: Status::PROCEED,
            max_size: data.len() as u32,
            crc,
            compressed,
            existing_progress: 0,
        };
        self.outgoing.insert(
            session,
            Outgoing {
                data,
                sent: 0,
                index: 0,
                crc: 0,
            },
        );
        let mut replies = control(status);
        replies.extend(self.next_chunk(session));
        replies
    }

    fn on_ack(&mut self, session: u8, offset: usize) -> Vec<Reply> {
        match self.outgoing.get(&session) {
            Some(outgoing) if offset >= outgoing.data.len() => {
                self.outgoing.remove(&session);
                vec![]
            }
            Some(_) => self.next_chunk(session),
            None => vec![],
        }
    }

    fn next_chunk(&mut self, session: u8) -> Vec<Reply> {
        let windowed = self.is_windowed();
        let link_payload = self.link_payload;
        let Some(outgoing) = self.outgoing.get_mut(&session) else {
            return vec![];
        };
        if outgoing.sent >= outgoing.data.len() {
            return vec![];
        }
        let end = (outgoing.sent + self.chunk).min(outgoing.data.len());
        let payload = outgoing.data[outgoing.sent..end].to_vec();
        outgoing.crc = checksum::update(outgoing.crc, &payload);
        let chunk = OutgoingChunk {
            index: outgoing.index,
            flags: ChunkFlags::new(
                outgoing.sent == 0,
                end == outgoing.data.len(),
                true,
            ),
            crc: outgoing.crc,
            payload,
        };
        outgoing.sent = end;
        outgoing.index = outgoing.index.wrapping_add(1);
        if !windowed {
            let framed = frame::encode_ack_per_chunk(session, &chunk);
            return vec![(Channel::Control, framed)];
        }
        let framed = frame::encode_windowed(&chunk);
        frame::split_for_link(&framed, link_payload + frame::LINK_OVERHEAD)
            .into_iter()
            .map(|bytes| (Channel::Download, bytes))
            .collect()
    }

    fn on_upload_chunk(&mut self, bytes: &[u8]) -> Vec<Reply> {
        let header = frame::decode(bytes).unwrap();
        let session = header.session.unwrap();
        let Some(incoming) = self.incoming.get_mut(&session) else {
            return vec![];
        };
        incoming.data.extend_from_slice(header.payload(bytes));
        control(Message::ChunkAck {
            session,
            status: Status::PROCEED,
            offset: incoming.data.len() as u32,
        })
    }

    fn on_windowed_upload_write(&mut self, bytes: &[u8]) -> Vec<Reply> {
        let partial = match self.pending_upload.take() {
            Some(mut partial) => {
                partial.push(bytes).unwrap();
                partial
            }
            None => {
                let header = frame::decode_partial(bytes).unwrap();
                PartialChunk::start(header, bytes).unwrap()
            }
        };
        if !partial.is_complete() {
            self.pending_upload = Some(partial);
            return vec![];
        }
        let index = partial.header.index;
        let Some(incoming) = self.incoming.get_mut(&0) else {
            return vec![];
        };
        incoming.data.extend(partial.into_payload());
        let ack = Message::WindowAck {
            status: Status::PROCEED,
            index,
            offset: incoming.data.len() as u32,
        };
        vec![(Channel::Upload, ack.encode())]
    }
}

fn control(message: Message) -> Vec<Reply> {
    vec![(Channel::Control, message.encode())]
}

/// Shuttle frames between session and peer until both go quiet.
pub fn exchange(
    session: &mut SyncSession,
    transport: &MemoryTransport,
    peer: &mut SimulatedPeer,
) -> Vec<SyncEvent> {
    let mut events = vec![];
    loop {
        let written = transport.drain();
        if written.is_empty() {
            return events;
        }
        for (channel, bytes) in written {
            assert!(bytes.len() <= transport.current_max_payload_size());
            for (channel, reply) in peer.handle(channel, &bytes) {
                events.extend(session.on_frame_received(channel, &reply));
                assert_single_download(session);
            }
        }
    }
}

/// The queue's current download is exactly what the registry holds.
pub fn assert_single_download(session: &SyncSession) {
    let in_flight = session
        .engine()
        .map(|engine| engine.registry().in_flight(TransferDirection::Download))
        .unwrap_or_default();
    assert!(in_flight.len() <= 1);
    assert_eq!(session.queue().current(), in_flight.first().copied());
}

pub fn entry(index: u16, data_type: u8, sub_type: u8, size: u32) -> DirectoryEntry {
    DirectoryEntry {
        index,
        data_type,
        sub_type,
        file_number: index,
        specific_flags: 0,
        file_flags: 0,
        size,
        timestamp: 1_000_000_000,
    }
}
