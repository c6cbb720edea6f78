//! One physical connection to a backend and the task that drives it.
//!
//! All state of a physical connection (its stream table, its socket, its
//! close progress) is owned by a single [`PhysicalDriver`] task. Everyone
//! else talks to it by sending [`Command`]s over one unbounded channel,
//! which keeps per-stream ordering without any lock around the table.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use pxmux_wire::{CreatePhysical, Frame, ReasonCode, StreamId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::framing::MuxFramed;
use crate::runtime::{self, OneshotSender, UnboundedReceiver, UnboundedSender, unbounded_channel};
use crate::stream_table::{Applied, CloseEvent, Effect, StreamState, StreamTable};
use crate::virtual_conn::Inbound;
use crate::{ConnectionError, MuxConfig, MuxError, MuxStats, SlotRef};

// ============================================================================
// Commands: callers send these to the driver task
// ============================================================================

pub(crate) enum Command {
    /// Allocate a stream and send `CreateStream`.
    Open {
        owner: UnboundedSender<Inbound>,
        reply: OneshotSender<Result<StreamId, MuxError>>,
    },
    /// Application bytes for an open stream.
    Data {
        stream_id: StreamId,
        payload: Vec<u8>,
    },
    /// The owner closed the stream, or acknowledged a close.
    CloseStream {
        stream_id: StreamId,
        reason: ReasonCode,
    },
    /// A [`PhysicalRef`] was released. Only wakes the driver so it can
    /// re-check whether teardown can complete.
    Released,
    /// Close the whole physical connection.
    Shutdown { reason: ReasonCode },
}

/// Callbacks from a driver into whatever owns its slot.
pub(crate) trait SlotLifecycle: Send + Sync + 'static {
    /// The connection stopped accepting new streams.
    fn disconnecting(&self, slot: &SlotRef, generation: u64);
    /// The connection is gone and the slot may be reused.
    fn torn_down(&self, slot: &SlotRef, generation: u64);
}

// ============================================================================
// Shared state and counted references
// ============================================================================

/// The part of a physical connection visible outside its driver.
pub(crate) struct PhysicalShared {
    slot: SlotRef,
    generation: u64,
    /// One for the connection itself (dropped when closing starts) plus one
    /// per live [`PhysicalRef`].
    use_count: AtomicUsize,
    commands: UnboundedSender<Command>,
}

impl PhysicalShared {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn submit(&self, command: Command) -> Result<(), MuxError> {
        self.commands
            .send(command)
            .map_err(|_| MuxError::ServerNotAvailable)
    }

    pub(crate) fn shutdown(&self, reason: ReasonCode) {
        let _ = self.submit(Command::Shutdown { reason });
    }
}

/// Counted reference to a connected physical connection.
///
/// The physical connection is not torn down while a reference is alive,
/// unless the drain timeout runs out. Dropping the reference releases it.
pub struct PhysicalRef {
    shared: Arc<PhysicalShared>,
    released: bool,
}

impl PhysicalRef {
    /// Only call with the slot lock held and the slot in `Connected`, so no
    /// reference can be taken once teardown has been decided.
    pub(crate) fn acquire(shared: &Arc<PhysicalShared>) -> Self {
        shared.use_count.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(shared),
            released: false,
        }
    }

    pub fn slot(&self) -> &SlotRef {
        &self.shared.slot
    }

    /// Current number of outstanding references, including the
    /// connection's own while it is not closing.
    pub fn use_count(&self) -> usize {
        self.shared.use_count.load(Ordering::Acquire)
    }

    pub(crate) fn submit(&self, command: Command) -> Result<(), MuxError> {
        self.shared.submit(command)
    }

    /// Release the reference now rather than at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.use_count.fetch_sub(1, Ordering::AcqRel);
        let _ = self.shared.commands.send(Command::Released);
    }
}

impl Drop for PhysicalRef {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for PhysicalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalRef")
            .field("slot", &self.shared.slot)
            .field("generation", &self.shared.generation)
            .finish()
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Send `CreatePhysical` and wait for `CreatePhysicalAck`.
pub(crate) async fn handshake<T>(
    io: &mut MuxFramed<T>,
    config: &MuxConfig,
) -> Result<(), ConnectionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Frame::CreatePhysical(CreatePhysical {
        version: config.protocol_version,
        name: config.instance_name.clone(),
        info: config.info.clone(),
    });
    io.send(&hello).await?;

    match runtime::timeout(config.handshake_timeout, io.recv()).await {
        None => Err(ConnectionError::Timeout),
        Some(Ok(Some(Frame::CreatePhysicalAck))) => Ok(()),
        Some(Ok(Some(Frame::ClosePhysical)) | Ok(None)) => Err(ConnectionError::Closed),
        Some(Ok(Some(other))) => Err(ConnectionError::ProtocolViolation {
            context: format!("expected CreatePhysicalAck, got {:?}", other.command()),
        }),
        Some(Err(e)) => Err(e),
    }
}

// ============================================================================
// Driver task
// ============================================================================

/// Work the driver queues for itself, run before it waits for more input.
enum Job {
    /// Notify every stream that the physical connection is closing.
    CloseStreams { reason: ReasonCode },
}

struct Closing {
    deadline: Instant,
    /// The drain deadline passed; tear down regardless of stragglers.
    forced: bool,
}

/// Owns one physical connection: its socket, its stream table and its close
/// sequence.
pub(crate) struct PhysicalDriver<T> {
    io: MuxFramed<T>,
    shared: Arc<PhysicalShared>,
    commands: UnboundedReceiver<Command>,
    lifecycle: Weak<dyn SlotLifecycle>,
    stats: Arc<MuxStats>,
    streams: StreamTable<UnboundedSender<Inbound>>,
    jobs: VecDeque<Job>,
    closing: Option<Closing>,
    reading: bool,
    writable: bool,
    drain_timeout: Duration,
}

impl<T> PhysicalDriver<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Build a driver for a connection that completed its handshake. The
    /// driver does nothing until [`run`](Self::run) is spawned.
    pub(crate) fn new(
        io: MuxFramed<T>,
        slot: SlotRef,
        generation: u64,
        lifecycle: Weak<dyn SlotLifecycle>,
        stats: Arc<MuxStats>,
        config: &MuxConfig,
    ) -> (Self, Arc<PhysicalShared>) {
        let (tx, rx) = unbounded_channel();
        let shared = Arc::new(PhysicalShared {
            slot,
            generation,
            use_count: AtomicUsize::new(1),
            commands: tx,
        });
        let driver = Self {
            io,
            shared: Arc::clone(&shared),
            commands: rx,
            lifecycle,
            stats,
            streams: StreamTable::new(config.max_streams),
            jobs: VecDeque::new(),
            closing: None,
            reading: true,
            writable: true,
            drain_timeout: config.close_drain_timeout,
        };
        (driver, shared)
    }

    pub(crate) async fn run(mut self) {
        debug!(slot = %self.shared.slot, generation = self.shared.generation, "physical connection up");
        loop {
            while let Some(job) = self.jobs.pop_front() {
                self.run_job(job);
            }
            if self.try_complete_teardown() {
                break;
            }

            let deadline = self.closing.as_ref().map(|c| c.deadline);
            tokio::select! {
                frame = self.io.recv(), if self.reading => {
                    self.handle_recv(frame).await;
                }
                // `shared` holds a sender, so the channel stays open while we run.
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.drain_expired();
                }
            }
        }
        self.finish().await;
    }

    fn slot_index(&self) -> usize {
        self.shared.slot.index
    }

    // ------------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------------

    async fn handle_recv(&mut self, frame: Result<Option<Frame>, ConnectionError>) {
        match frame {
            Ok(Some(frame)) => self.handle_frame(frame).await,
            Ok(None) => self.begin_close(ReasonCode::CLOSED_BY_SERVER, &"backend closed the connection"),
            Err(error) if error.is_protocol_violation() => self.protocol_violation(error).await,
            Err(error) => {
                self.writable = false;
                self.begin_close(error.reason(), &error);
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Data { stream_id, payload } => self.deliver(stream_id, payload),
            Frame::CloseStream { stream_id, reason } => {
                self.close_stream(stream_id, CloseEvent::Remote(reason)).await;
            }
            Frame::ClosePhysical => {
                self.begin_close(ReasonCode::CLOSED_BY_SERVER, &"backend sent ClosePhysical");
            }
            other @ (Frame::CreateStream { .. }
            | Frame::CreatePhysical(_)
            | Frame::CreatePhysicalAck) => {
                let error = ConnectionError::ProtocolViolation {
                    context: format!(
                        "unexpected {:?} on an established connection",
                        other.command()
                    ),
                };
                self.protocol_violation(error).await;
            }
        }
    }

    fn deliver(&self, stream_id: StreamId, payload: Vec<u8>) {
        match self.streams.get(stream_id) {
            Some(entry) if entry.state == StreamState::Open => {
                if entry.owner.send(Inbound::Data(payload)).is_err() {
                    trace!(slot = %self.shared.slot, %stream_id, "owner gone, dropping data");
                }
            }
            Some(entry) => {
                debug!(slot = %self.shared.slot, %stream_id, state = ?entry.state, "dropping data for closing stream");
            }
            None => {
                debug!(slot = %self.shared.slot, %stream_id, len = payload.len(), "dropping data for unknown stream");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { owner, reply } => self.open_stream(owner, reply).await,
            Command::Data { stream_id, payload } => self.send_data(stream_id, payload).await,
            Command::CloseStream { stream_id, reason } => {
                self.close_stream(stream_id, CloseEvent::Local(reason)).await;
            }
            Command::Released => {
                trace!(slot = %self.shared.slot, use_count = self.shared.use_count.load(Ordering::Acquire), "reference released");
            }
            Command::Shutdown { reason } => {
                if self.closing.is_none() {
                    self.write(Frame::ClosePhysical).await;
                    self.begin_close(reason, &"shutdown requested");
                }
            }
        }
    }

    async fn open_stream(
        &mut self,
        owner: UnboundedSender<Inbound>,
        reply: OneshotSender<Result<StreamId, MuxError>>,
    ) {
        if self.closing.is_some() {
            let _ = reply.send(Err(MuxError::ServerNotAvailable));
            return;
        }
        let Some(stream_id) = self.streams.insert(owner) else {
            debug!(slot = %self.shared.slot, streams = self.streams.len(), "stream ids exhausted");
            let _ = reply.send(Err(MuxError::ServerCapacity));
            return;
        };
        if !self.write(Frame::CreateStream { stream_id }).await {
            self.streams.remove(stream_id);
            let _ = reply.send(Err(MuxError::ServerNotAvailable));
            return;
        }
        self.stats.virtual_opened(self.slot_index());
        debug!(slot = %self.shared.slot, %stream_id, "stream opened");

        if reply.send(Ok(stream_id)).is_err() {
            // The caller stopped waiting, so nobody will ever close it.
            self.close_stream(stream_id, CloseEvent::Local(ReasonCode::CLOSED_BY_CLIENT))
                .await;
        }
    }

    async fn send_data(&mut self, stream_id: StreamId, payload: Vec<u8>) {
        if self.closing.is_some() {
            return;
        }
        match self.streams.get(stream_id) {
            Some(entry) if entry.state == StreamState::Open => {
                self.write(Frame::Data { stream_id, payload }).await;
            }
            _ => trace!(slot = %self.shared.slot, %stream_id, "dropping outbound data for closed stream"),
        }
    }

    // ------------------------------------------------------------------------
    // Stream close
    // ------------------------------------------------------------------------

    async fn close_stream(&mut self, stream_id: StreamId, event: CloseEvent) {
        match self.streams.apply(stream_id, event) {
            Applied::Missing => {
                debug!(slot = %self.shared.slot, %stream_id, ?event, "close for unknown stream");
            }
            Applied::Ignored => {
                trace!(slot = %self.shared.slot, %stream_id, ?event, "duplicate close");
            }
            Applied::Advanced(Effect::SendClose(reason)) => {
                self.write(Frame::CloseStream { stream_id, reason }).await;
            }
            Applied::Advanced(Effect::NotifyOwner(reason)) => self.notify(stream_id, reason),
            Applied::Removed(_) => self.removed(stream_id),
        }
    }

    /// Tell the owner its stream closed. The entry stays until the owner
    /// acknowledges with its own close.
    fn notify(&self, stream_id: StreamId, reason: ReasonCode) {
        let delivered = self
            .streams
            .get(stream_id)
            .is_some_and(|entry| entry.owner.send(Inbound::Closed(reason)).is_ok());
        if delivered {
            debug!(slot = %self.shared.slot, %stream_id, %reason, "stream closed, owner notified");
        } else {
            debug!(slot = %self.shared.slot, %stream_id, %reason, "stream closed, owner already gone");
        }
    }

    fn removed(&self, stream_id: StreamId) {
        self.stats.virtual_closed(self.slot_index());
        trace!(slot = %self.shared.slot, %stream_id, "stream removed");
    }

    // ------------------------------------------------------------------------
    // Physical close
    // ------------------------------------------------------------------------

    /// Write one frame. On failure the connection starts closing and this
    /// returns false.
    async fn write(&mut self, frame: Frame) -> bool {
        if !self.writable {
            return false;
        }
        match self.io.send(&frame).await {
            Ok(()) => true,
            Err(error) => {
                self.writable = false;
                self.begin_close(error.reason(), &error);
                false
            }
        }
    }

    async fn protocol_violation(&mut self, error: ConnectionError) {
        warn!(slot = %self.shared.slot, %error, "protocol violation from backend");
        if self.closing.is_none() {
            self.write(Frame::ClosePhysical).await;
        }
        self.begin_close(error.reason(), &error);
    }

    /// Start closing. Only the first call has any effect.
    fn begin_close(&mut self, reason: ReasonCode, cause: &dyn fmt::Display) {
        if self.closing.is_some() {
            return;
        }
        info!(
            slot = %self.shared.slot,
            %reason,
            %cause,
            streams = self.streams.len(),
            "closing physical connection"
        );
        self.reading = false;
        self.closing = Some(Closing {
            deadline: Instant::now() + self.drain_timeout,
            forced: false,
        });
        if let Some(lifecycle) = self.lifecycle.upgrade() {
            lifecycle.disconnecting(&self.shared.slot, self.shared.generation);
        }
        // Drop the connection's own reference.
        self.shared.use_count.fetch_sub(1, Ordering::AcqRel);
        self.jobs.push_back(Job::CloseStreams { reason });
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::CloseStreams { reason } => {
                for stream_id in self.streams.ids() {
                    match self.streams.apply(stream_id, CloseEvent::Physical(reason)) {
                        Applied::Advanced(Effect::NotifyOwner(reason)) => {
                            self.notify(stream_id, reason);
                        }
                        Applied::Removed(_) => self.removed(stream_id),
                        _ => {}
                    }
                }
                debug!(
                    slot = %self.shared.slot,
                    pending = self.streams.len(),
                    "streams notified of physical close"
                );
            }
        }
    }

    fn try_complete_teardown(&self) -> bool {
        let Some(closing) = &self.closing else {
            return false;
        };
        closing.forced
            || (self.streams.is_empty() && self.shared.use_count.load(Ordering::Acquire) == 0)
    }

    fn drain_expired(&mut self) {
        if let Some(closing) = &mut self.closing {
            warn!(
                slot = %self.shared.slot,
                pending = self.streams.len(),
                use_count = self.shared.use_count.load(Ordering::Acquire),
                "drain timeout expired, forcing teardown"
            );
            closing.forced = true;
        }
    }

    async fn finish(mut self) {
        for (stream_id, _) in self.streams.drain() {
            self.removed(stream_id);
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Open { reply, .. } = command {
                let _ = reply.send(Err(MuxError::ServerNotAvailable));
            }
        }

        if self.writable {
            self.io.shutdown().await;
        }
        self.stats.physical_closed(self.slot_index());
        if let Some(lifecycle) = self.lifecycle.upgrade() {
            lifecycle.torn_down(&self.shared.slot, self.shared.generation);
        }
        info!(slot = %self.shared.slot, generation = self.shared.generation, "physical connection torn down");
    }
}
