//! A scriptable backend that speaks the mux protocol over TCP.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pxmux::wire::CreatePhysical;
use pxmux::{Frame, MuxConfig, MuxFramed, MuxPool, ReasonCode, ServerConfig, StreamId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn sid(id: u16) -> StreamId {
    StreamId::new(id).unwrap()
}

/// Pool settings with delays short enough for tests.
pub fn fast_config(slots: usize) -> MuxConfig {
    MuxConfig {
        slots,
        instance_name: "test-proxy".into(),
        initial_connect_delay: Duration::from_millis(10),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(1),
        close_drain_timeout: Duration::from_secs(2),
        ..MuxConfig::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Connected { conn: usize, hello: CreatePhysical },
    StreamOpened { conn: usize, stream_id: StreamId },
    Data { conn: usize, stream_id: StreamId, payload: Vec<u8> },
    StreamClosed { conn: usize, stream_id: StreamId, reason: ReasonCode },
    PhysicalClosed { conn: usize },
    Disconnected { conn: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct BackendOptions {
    /// Echo every `Data` frame back on the same stream.
    pub echo: bool,
    /// Answer every `CloseStream` with one of our own.
    pub ack_closes: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            echo: true,
            ack_closes: true,
        }
    }
}

enum Control {
    Send(Frame),
    Kill,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    controls: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(options: BackendOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, events) = mpsc::unbounded_channel();
        let controls = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn({
            let controls = Arc::clone(&controls);
            let connections = Arc::clone(&connections);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let conn = connections.fetch_add(1, Ordering::SeqCst);
                    let (control_tx, control_rx) = mpsc::unbounded_channel();
                    controls.lock().push(control_tx);
                    tokio::spawn(serve(conn, stream, options, events_tx.clone(), control_rx));
                }
            }
        });

        Self {
            addr,
            events,
            controls,
            connections,
            accept_task,
        }
    }

    pub fn server_config(&self, name: &str) -> ServerConfig {
        ServerConfig::new(name, self.addr.to_string())
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn next_event(&mut self) -> BackendEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for backend event")
            .expect("backend event channel closed")
    }

    /// Skip events until one matches.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&BackendEvent) -> bool) -> BackendEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Send a raw frame on the most recent connection.
    pub fn inject(&self, frame: Frame) {
        if let Some(control) = self.controls.lock().last() {
            let _ = control.send(Control::Send(frame));
        }
    }

    /// Drop every open connection without a `ClosePhysical`.
    pub fn kill_all(&self) {
        for control in self.controls.lock().iter() {
            let _ = control.send(Control::Kill);
        }
    }

    /// Stop accepting new connections.
    pub fn stop_accepting(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kill_all();
    }
}

async fn serve(
    conn: usize,
    stream: TcpStream,
    options: BackendOptions,
    events: mpsc::UnboundedSender<BackendEvent>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut io = MuxFramed::new(stream, 1024 * 1024);

    let Ok(Some(Frame::CreatePhysical(hello))) = io.recv().await else {
        return;
    };
    if io.send(&Frame::CreatePhysicalAck).await.is_err() {
        return;
    }
    let _ = events.send(BackendEvent::Connected { conn, hello });

    loop {
        tokio::select! {
            frame = io.recv() => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    _ => {
                        let _ = events.send(BackendEvent::Disconnected { conn });
                        return;
                    }
                };
                match frame {
                    Frame::CreateStream { stream_id } => {
                        let _ = events.send(BackendEvent::StreamOpened { conn, stream_id });
                    }
                    Frame::Data { stream_id, payload } => {
                        let _ = events.send(BackendEvent::Data { conn, stream_id, payload: payload.clone() });
                        if options.echo && io.send(&Frame::Data { stream_id, payload }).await.is_err() {
                            return;
                        }
                    }
                    Frame::CloseStream { stream_id, reason } => {
                        let _ = events.send(BackendEvent::StreamClosed { conn, stream_id, reason });
                        if options.ack_closes {
                            let ack = Frame::CloseStream { stream_id, reason: ReasonCode::CLOSED_BY_SERVER };
                            if io.send(&ack).await.is_err() {
                                return;
                            }
                        }
                    }
                    Frame::ClosePhysical => {
                        let _ = events.send(BackendEvent::PhysicalClosed { conn });
                    }
                    Frame::CreatePhysical(_) | Frame::CreatePhysicalAck => {}
                }
            }
            cmd = control.recv() => {
                match cmd {
                    Some(Control::Send(frame)) => {
                        if io.send(&frame).await.is_err() {
                            return;
                        }
                    }
                    Some(Control::Kill) | None => return,
                }
            }
        }
    }
}

/// Poll until the slot accepts new streams.
pub async fn wait_available<C: pxmux::Connector>(pool: &MuxPool<C>, server: &str, slot: usize) {
    wait_until(|| pool.is_available(server, slot)).await;
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
