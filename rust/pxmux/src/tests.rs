use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use super::*;
use crate::physical::{PhysicalDriver, PhysicalShared, SlotLifecycle, handshake};

const GENERATION: u64 = 7;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sid(id: u16) -> StreamId {
    StreamId::new(id).unwrap()
}

#[derive(Default)]
struct RecordingLifecycle {
    events: Mutex<Vec<(&'static str, u64)>>,
}

impl RecordingLifecycle {
    fn events(&self) -> Vec<(&'static str, u64)> {
        self.events.lock().clone()
    }
}

impl SlotLifecycle for RecordingLifecycle {
    fn disconnecting(&self, _slot: &SlotRef, generation: u64) {
        self.events.lock().push(("disconnecting", generation));
    }

    fn torn_down(&self, _slot: &SlotRef, generation: u64) {
        self.events.lock().push(("torn_down", generation));
    }
}

/// A driver wired to an in-memory backend.
struct Harness {
    shared: Arc<PhysicalShared>,
    backend: MuxFramed<DuplexStream>,
    lifecycle: Arc<RecordingLifecycle>,
    stats: Arc<MuxStats>,
    driver: JoinHandle<()>,
}

fn test_config() -> MuxConfig {
    MuxConfig {
        slots: 1,
        ..MuxConfig::default()
    }
}

fn start(config: MuxConfig) -> Harness {
    init_tracing();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let lifecycle = Arc::new(RecordingLifecycle::default());
    let weak: Weak<dyn SlotLifecycle> = Arc::downgrade(&lifecycle) as Weak<dyn SlotLifecycle>;
    let stats = Arc::new(MuxStats::new(1));
    let (driver, shared) = PhysicalDriver::new(
        MuxFramed::new(ours, config.max_frame_len),
        SlotRef::new("backend", 0),
        GENERATION,
        weak,
        Arc::clone(&stats),
        &config,
    );
    Harness {
        shared,
        backend: MuxFramed::new(theirs, config.max_frame_len),
        lifecycle,
        stats,
        driver: tokio::spawn(driver.run()),
    }
}

async fn backend_recv(backend: &mut MuxFramed<DuplexStream>) -> Frame {
    tokio::time::timeout(Duration::from_secs(2), backend.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("backend recv failed")
        .expect("unexpected eof")
}

async fn open(h: &mut Harness) -> VirtualConnection {
    let vc = VirtualConnection::open(PhysicalRef::acquire(&h.shared))
        .await
        .expect("open should succeed");
    assert_eq!(
        backend_recv(&mut h.backend).await,
        Frame::CreateStream {
            stream_id: vc.stream_id()
        }
    );
    vc
}

async fn recv(vc: &mut VirtualConnection) -> Option<Inbound> {
    tokio::time::timeout(Duration::from_secs(2), vc.recv())
        .await
        .expect("timed out waiting for inbound event")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn finished(driver: JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(3), driver)
        .await
        .expect("driver did not finish")
        .unwrap();
}

fn virtual_count(stats: &MuxStats) -> u64 {
    stats.slot(0).unwrap().virtual_connections
}

#[tokio::test]
async fn streams_get_smallest_ids_and_are_counted() {
    let mut h = start(test_config());
    let a = open(&mut h).await;
    let b = open(&mut h).await;
    let c = open(&mut h).await;
    assert_eq!(
        [a.stream_id(), b.stream_id(), c.stream_id()],
        [sid(1), sid(2), sid(3)]
    );
    assert_eq!(virtual_count(&h.stats), 3);
    assert_eq!(a.slot(), &SlotRef::new("backend", 0));
}

#[tokio::test]
async fn data_flows_both_ways_in_order() {
    let mut h = start(test_config());
    let mut vc = open(&mut h).await;

    for i in 0..20u8 {
        vc.send(vec![i]).unwrap();
    }
    for i in 0..20u8 {
        assert_eq!(
            backend_recv(&mut h.backend).await,
            Frame::Data {
                stream_id: vc.stream_id(),
                payload: vec![i],
            }
        );
    }

    for i in 0..20u8 {
        h.backend
            .send(&Frame::Data {
                stream_id: vc.stream_id(),
                payload: vec![i, i],
            })
            .await
            .unwrap();
    }
    for i in 0..20u8 {
        assert_eq!(recv(&mut vc).await, Some(Inbound::Data(vec![i, i])));
    }
}

#[tokio::test]
async fn local_close_keeps_id_until_backend_acknowledges() {
    let mut h = start(test_config());
    let mut first = open(&mut h).await;

    first.close(ReasonCode::CLOSED_BY_CLIENT);
    first.close(ReasonCode::CLOSED_BY_CLIENT);
    assert!(first.is_closed());
    assert_eq!(first.send(b"late".to_vec()), Err(MuxError::StreamClosed));
    assert_eq!(
        backend_recv(&mut h.backend).await,
        Frame::CloseStream {
            stream_id: sid(1),
            reason: ReasonCode::CLOSED_BY_CLIENT,
        }
    );

    let second = open(&mut h).await;
    assert_eq!(second.stream_id(), sid(2));

    h.backend
        .send(&Frame::CloseStream {
            stream_id: sid(1),
            reason: ReasonCode::CLOSED_BY_SERVER,
        })
        .await
        .unwrap();
    // The close crossed ours, so the owner hears nothing more.
    assert_eq!(recv(&mut first).await, None);

    let third = open(&mut h).await;
    assert_eq!(third.stream_id(), sid(1));
    assert_eq!(virtual_count(&h.stats), 2);
}

#[tokio::test]
async fn remote_close_is_notified_once_and_acknowledged_silently() {
    let mut h = start(test_config());
    let mut vc = open(&mut h).await;

    for _ in 0..2 {
        h.backend
            .send(&Frame::CloseStream {
                stream_id: vc.stream_id(),
                reason: ReasonCode::ENDPOINT_DISABLED,
            })
            .await
            .unwrap();
    }

    assert_eq!(
        recv(&mut vc).await,
        Some(Inbound::Closed(ReasonCode::ENDPOINT_DISABLED))
    );
    assert!(vc.is_closed());
    assert_eq!(recv(&mut vc).await, None);

    // No CloseStream goes back for an acknowledged remote close; the next
    // frame the backend sees is the CreateStream reusing the id.
    let next = open(&mut h).await;
    assert_eq!(next.stream_id(), sid(1));
    assert_eq!(virtual_count(&h.stats), 1);
}

#[tokio::test]
async fn data_for_unknown_stream_is_dropped() {
    let mut h = start(test_config());
    h.backend
        .send(&Frame::Data {
            stream_id: sid(99),
            payload: b"stray".to_vec(),
        })
        .await
        .unwrap();

    let mut vc = open(&mut h).await;
    h.backend
        .send(&Frame::Data {
            stream_id: vc.stream_id(),
            payload: b"hello".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(recv(&mut vc).await, Some(Inbound::Data(b"hello".to_vec())));
    assert_eq!(virtual_count(&h.stats), 1);
    assert!(h.lifecycle.events().is_empty());
}

#[tokio::test]
async fn capacity_is_reported_when_ids_run_out() {
    let mut h = start(MuxConfig {
        max_streams: 2,
        ..test_config()
    });
    let mut a = open(&mut h).await;
    let _b = open(&mut h).await;

    let err = VirtualConnection::open(PhysicalRef::acquire(&h.shared))
        .await
        .unwrap_err();
    assert_eq!(err, MuxError::ServerCapacity);
    assert_eq!(err.reason(), ReasonCode::SERVER_CAPACITY);

    a.close(ReasonCode::CLOSED_BY_CLIENT);
    assert!(matches!(
        backend_recv(&mut h.backend).await,
        Frame::CloseStream { .. }
    ));
    h.backend
        .send(&Frame::CloseStream {
            stream_id: sid(1),
            reason: ReasonCode::CLOSED_BY_SERVER,
        })
        .await
        .unwrap();
    assert_eq!(recv(&mut a).await, None);

    let c = open(&mut h).await;
    assert_eq!(c.stream_id(), sid(1));
}

#[tokio::test]
async fn backend_failure_notifies_only_open_streams() {
    let mut h = start(test_config());
    let mut v1 = open(&mut h).await;
    let mut v2 = open(&mut h).await;
    let mut v3 = open(&mut h).await;

    v1.close(ReasonCode::CLOSED_BY_CLIENT);
    v2.close(ReasonCode::CLOSED_BY_CLIENT);
    for _ in 0..2 {
        assert!(matches!(
            backend_recv(&mut h.backend).await,
            Frame::CloseStream { .. }
        ));
    }

    let Harness {
        backend,
        lifecycle,
        stats,
        driver,
        ..
    } = h;
    drop(backend);

    assert_eq!(
        recv(&mut v3).await,
        Some(Inbound::Closed(ReasonCode::CLOSED_BY_SERVER))
    );
    assert_eq!(recv(&mut v1).await, None);
    assert_eq!(recv(&mut v2).await, None);

    finished(driver).await;
    assert_eq!(
        lifecycle.events(),
        vec![("disconnecting", GENERATION), ("torn_down", GENERATION)]
    );
    assert_eq!(recv(&mut v3).await, None);
    assert_eq!(virtual_count(&stats), 0);
}

#[tokio::test]
async fn teardown_waits_for_owners_until_drain_timeout() {
    let mut h = start(MuxConfig {
        close_drain_timeout: Duration::from_millis(200),
        ..test_config()
    });
    let mut vc = open(&mut h).await;

    let Harness {
        backend,
        lifecycle,
        stats,
        driver,
        ..
    } = h;
    drop(backend);

    wait_until(|| !lifecycle.events().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!driver.is_finished());
    assert_eq!(lifecycle.events(), vec![("disconnecting", GENERATION)]);

    finished(driver).await;
    assert_eq!(
        lifecycle.events(),
        vec![("disconnecting", GENERATION), ("torn_down", GENERATION)]
    );
    assert_eq!(virtual_count(&stats), 0);

    // The notification queued before the forced teardown is still there.
    assert_eq!(
        recv(&mut vc).await,
        Some(Inbound::Closed(ReasonCode::CLOSED_BY_SERVER))
    );
    assert_eq!(recv(&mut vc).await, None);
}

#[tokio::test]
async fn shutdown_waits_for_outstanding_references() {
    let mut h = start(test_config());
    let held = PhysicalRef::acquire(&h.shared);
    assert_eq!(held.use_count(), 2);

    h.shared.shutdown(ReasonCode::ENDPOINT_DISABLED);
    assert_eq!(backend_recv(&mut h.backend).await, Frame::ClosePhysical);

    wait_until(|| !h.lifecycle.events().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.driver.is_finished());
    assert_eq!(held.use_count(), 1);

    held.release();
    finished(h.driver).await;
    assert_eq!(
        h.lifecycle.events(),
        vec![("disconnecting", GENERATION), ("torn_down", GENERATION)]
    );
}

#[tokio::test]
async fn open_on_closing_connection_is_refused() {
    let mut h = start(test_config());
    let _held = PhysicalRef::acquire(&h.shared);
    h.backend.send(&Frame::ClosePhysical).await.unwrap();
    wait_until(|| !h.lifecycle.events().is_empty()).await;

    let err = VirtualConnection::open(PhysicalRef::acquire(&h.shared))
        .await
        .unwrap_err();
    assert_eq!(err, MuxError::ServerNotAvailable);
}

#[tokio::test]
async fn unexpected_create_stream_is_a_protocol_violation() {
    let mut h = start(test_config());
    let mut vc = open(&mut h).await;

    h.backend
        .send(&Frame::CreateStream { stream_id: sid(5) })
        .await
        .unwrap();

    assert_eq!(backend_recv(&mut h.backend).await, Frame::ClosePhysical);
    assert_eq!(
        recv(&mut vc).await,
        Some(Inbound::Closed(ReasonCode::BAD_CLIENT_DATA))
    );
    finished(h.driver).await;
}

#[tokio::test]
async fn garbage_from_backend_is_a_protocol_violation() {
    use tokio::io::AsyncWriteExt;

    init_tracing();
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let lifecycle = Arc::new(RecordingLifecycle::default());
    let weak: Weak<dyn SlotLifecycle> = Arc::downgrade(&lifecycle) as Weak<dyn SlotLifecycle>;
    let config = test_config();
    let (driver, shared) = PhysicalDriver::new(
        MuxFramed::new(ours, config.max_frame_len),
        SlotRef::new("backend", 0),
        GENERATION,
        weak,
        Arc::new(MuxStats::new(1)),
        &config,
    );
    let driver = tokio::spawn(driver.run());
    let mut vc = VirtualConnection::open(PhysicalRef::acquire(&shared))
        .await
        .unwrap();

    theirs.write_all(&[0, 0, 0, 3, 0x42, 0, 1]).await.unwrap();
    assert_eq!(
        recv(&mut vc).await,
        Some(Inbound::Closed(ReasonCode::BAD_CLIENT_DATA))
    );
    finished(driver).await;
}

#[tokio::test]
async fn handshake_sends_create_physical_and_accepts_ack() {
    init_tracing();
    let (ours, theirs) = tokio::io::duplex(1024);
    let config = MuxConfig {
        instance_name: "proxy-a".into(),
        info: "test build".into(),
        ..test_config()
    };

    let backend = tokio::spawn(async move {
        let mut backend = MuxFramed::new(theirs, 1024);
        let hello = backend_recv(&mut backend).await;
        backend.send(&Frame::CreatePhysicalAck).await.unwrap();
        hello
    });

    let mut io = MuxFramed::new(ours, 1024);
    handshake(&mut io, &config).await.unwrap();

    let Frame::CreatePhysical(hello) = backend.await.unwrap() else {
        panic!("expected CreatePhysical");
    };
    assert_eq!(hello.version, wire::PROTOCOL_VERSION);
    assert_eq!(hello.name, "proxy-a");
    assert_eq!(hello.info, "test build");
}

#[tokio::test]
async fn handshake_times_out_without_ack() {
    init_tracing();
    let (ours, _theirs) = tokio::io::duplex(1024);
    let config = MuxConfig {
        handshake_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let mut io = MuxFramed::new(ours, 1024);
    assert!(matches!(
        handshake(&mut io, &config).await,
        Err(ConnectionError::Timeout)
    ));
}

#[tokio::test]
async fn handshake_rejects_other_frames() {
    init_tracing();
    let (ours, theirs) = tokio::io::duplex(1024);
    let config = test_config();

    tokio::spawn(async move {
        let mut backend = MuxFramed::new(theirs, 1024);
        let _ = backend.recv().await;
        backend
            .send(&Frame::Data {
                stream_id: sid(1),
                payload: vec![],
            })
            .await
            .unwrap();
        // Keep the stream open until the proxy side gives up.
        let _ = backend.recv().await;
    });

    let mut io = MuxFramed::new(ours, 1024);
    let err = handshake(&mut io, &config).await.unwrap_err();
    assert!(err.is_protocol_violation());
}

#[test]
fn config_validation() {
    assert_eq!(
        MuxConfig {
            slots: 0,
            ..MuxConfig::default()
        }
        .validate(),
        Err(ConfigError::NoSlots)
    );
    assert_eq!(
        MuxConfig {
            max_streams: 0,
            ..MuxConfig::default()
        }
        .validate(),
        Err(ConfigError::NoStreams)
    );
    let too_long = usize::from(u16::MAX) + 1;
    assert_eq!(
        MuxConfig {
            instance_name: "n".repeat(too_long),
            ..MuxConfig::default()
        }
        .validate(),
        Err(ConfigError::NameTooLong(too_long))
    );
    assert_eq!(
        MuxConfig {
            info: "i".repeat(too_long),
            ..MuxConfig::default()
        }
        .validate(),
        Err(ConfigError::InfoTooLong(too_long))
    );
    assert!(
        MuxConfig {
            info: "i".repeat(usize::from(u16::MAX)),
            ..MuxConfig::default()
        }
        .validate()
        .is_ok()
    );
    assert!(MuxConfig::default().validate().is_ok());
    assert_eq!(MuxConfig::default().reconnect_delay, Duration::from_secs(10));
    assert_eq!(
        MuxConfig::default().initial_connect_delay,
        Duration::from_millis(10)
    );
}

#[test]
fn error_reasons() {
    assert_eq!(
        MuxError::ServerNotAvailable.reason(),
        ReasonCode::SERVER_NOT_AVAILABLE
    );
    assert_eq!(
        MuxError::UnknownServer("x".into()).reason(),
        ReasonCode::SERVER_NOT_AVAILABLE
    );
    assert_eq!(
        ConnectionError::Closed.reason(),
        ReasonCode::CLOSED_BY_SERVER
    );
    assert_eq!(
        ConnectionError::FrameTooLarge { len: 10, max: 1 }.reason(),
        ReasonCode::BAD_CLIENT_DATA
    );
}
