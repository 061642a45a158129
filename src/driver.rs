//! Single tokio task serialising every event of one connection.
//!
//! Transport callbacks may fire on any thread; they only ever send a
//! [`LinkEvent`] into the driver's channel. The task applies events to the
//! [`SyncSession`] one at a time and ticks it for stall detection.

use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::descriptor::FileDescriptor;
use crate::session::{SyncEvent, SyncSession};
use crate::transport::Channel;

#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Frame { channel: Channel, bytes: Vec<u8> },
    /// The transport's payload size changed.
    MtuChanged,
    LinkLost,
    Tick,
    Sync,
    Enqueue(FileDescriptor),
    FileListPage {
        entries: Vec<FileDescriptor>,
        has_more: bool,
    },
    Upload {
        descriptor: FileDescriptor,
        data: Vec<u8>,
        compress: bool,
    },
    CancelCurrent,
    Shutdown,
}

pub struct DriverHandle {
    pub events: UnboundedSender<LinkEvent>,
    pub outcomes: UnboundedReceiver<SyncEvent>,
    /// Resolves to the session once the driver shuts down.
    pub task: JoinHandle<SyncSession>,
}

/// Move `session` onto its own task.
pub fn spawn_driver(session: SyncSession, tick_every: Duration) -> DriverHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(session, events_rx, outcomes_tx, tick_every));
    DriverHandle {
        events: events_tx,
        outcomes: outcomes_rx,
        task,
    }
}

async fn run(
    mut session: SyncSession,
    mut events: UnboundedReceiver<LinkEvent>,
    outcomes: UnboundedSender<SyncEvent>,
    tick_every: Duration,
) -> SyncSession {
    log::info!("Sync driver started");
    let mut ticker = interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Some(event) => event,
                None => break,
            },
            _ = ticker.tick() => LinkEvent::Tick,
        };
        if matches!(event, LinkEvent::Shutdown) {
            break;
        }
        for outcome in dispatch(&mut session, event) {
            if outcomes.send(outcome).is_err() {
                log::debug!("Outcome receiver dropped");
            }
        }
    }
    log::info!("Sync driver stopped");
    session
}

fn dispatch(session: &mut SyncSession, event: LinkEvent) -> Vec<SyncEvent> {
    match event {
        LinkEvent::Connected => session.on_connected(),
        LinkEvent::Frame { channel, bytes } => {
            session.on_frame_received(channel, &bytes)
        }
        LinkEvent::MtuChanged => {
            session.on_mtu_changed();
            vec![]
        }
        LinkEvent::LinkLost => session.on_link_lost(),
        LinkEvent::Tick => session.on_tick(),
        LinkEvent::Sync => session.sync(),
        LinkEvent::Enqueue(descriptor) => session.enqueue(descriptor),
        LinkEvent::FileListPage { entries, has_more } => {
            session.on_file_list_page(entries, has_more)
        }
        LinkEvent::Upload {
            descriptor,
            data,
            compress,
        } => match session.upload(descriptor.clone(), &data, compress) {
            Ok(events) => events,
            Err(error) => vec![SyncEvent::UploadFailed { descriptor, error }],
        },
        LinkEvent::CancelCurrent => {
            session.cancel_current();
            vec![]
        }
        LinkEvent::Shutdown => vec![],
    }
}
