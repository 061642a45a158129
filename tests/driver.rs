mod common;

use std::time::Duration;

use bandsync::message::Message;
use bandsync::transport::{Channel, MemoryTransport};
use bandsync::{
    spawn_driver, LinkEvent, SyncConfig, SyncEvent, SyncSession, SystemClock,
};
use tempdir::TempDir;

use common::{init_logging, SimulatedPeer};

fn session(transport: &MemoryTransport, dir: &TempDir) -> SyncSession {
    SyncSession::new(
        SyncConfig::default(),
        Box::new(transport.clone()),
        Box::new(bandsync::LocalStore::new(dir.path())),
        Box::new(SystemClock),
    )
}

#[tokio::test]
async fn driver_negotiates_and_returns_the_session() {
    init_logging();
    let dir = TempDir::new("bandsync-driver").unwrap();
    let transport = MemoryTransport::new(244);
    let mut handle =
        spawn_driver(session(&transport, &dir), Duration::from_millis(50));
    let mut peer = SimulatedPeer::new(64);

    handle.events.send(LinkEvent::Connected).unwrap();
    let request = loop {
        if let Some((_, bytes)) = transport.drain().into_iter().next() {
            break bytes;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(Message::decode(&request).unwrap(), Message::CapabilitiesRequest);

    for (channel, bytes) in peer.handle(Channel::Control, &request) {
        handle
            .events
            .send(LinkEvent::Frame { channel, bytes })
            .unwrap();
    }
    let outcome = handle.outcomes.recv().await.unwrap();
    assert!(matches!(outcome, SyncEvent::Connected { .. }));

    transport.set_max_payload(20);
    handle.events.send(LinkEvent::MtuChanged).unwrap();
    handle.events.send(LinkEvent::Shutdown).unwrap();
    let session = handle.task.await.unwrap();
    assert!(session.is_negotiated());
    assert_eq!(session.engine().unwrap().mtu(), 23);
}

#[tokio::test]
async fn driver_ticks_without_work_stay_quiet() {
    init_logging();
    let dir = TempDir::new("bandsync-driver").unwrap();
    let transport = MemoryTransport::new(244);
    let mut handle =
        spawn_driver(session(&transport, &dir), Duration::from_millis(10));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(handle.outcomes.try_recv().is_err());

    drop(handle.events);
    let session = handle.task.await.unwrap();
    assert!(!session.is_negotiated());
    assert!(transport.drain().is_empty());
}
