use pxmux_wire::{ReasonCode, StreamId};

use crate::physical::{Command, PhysicalRef};
use crate::runtime::{UnboundedReceiver, oneshot, unbounded_channel};
use crate::{MuxError, SlotRef};

/// Delivered to the owner of a virtual connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes from the backend, in the order it sent them.
    Data(Vec<u8>),
    /// The stream was closed by the backend or because its physical
    /// connection went away. Delivered at most once.
    Closed(ReasonCode),
}

/// One client's logical channel to a backend, carried as a stream of a
/// shared physical connection.
///
/// Holds a [`PhysicalRef`] until closed, which keeps the physical connection
/// from being torn down under it. Dropping an open connection closes it
/// with [`ReasonCode::CLOSED_BY_CLIENT`].
#[derive(Debug)]
pub struct VirtualConnection {
    stream_id: StreamId,
    slot: SlotRef,
    phys: Option<PhysicalRef>,
    inbound: UnboundedReceiver<Inbound>,
}

impl VirtualConnection {
    /// Ask the driver behind `phys` for a new stream.
    pub(crate) async fn open(phys: PhysicalRef) -> Result<Self, MuxError> {
        let (owner, inbound) = unbounded_channel();
        let (reply, reply_rx) = oneshot();
        phys.submit(Command::Open { owner, reply })?;
        let stream_id = reply_rx
            .await
            .map_err(|_| MuxError::ServerNotAvailable)??;
        Ok(Self {
            stream_id,
            slot: phys.slot().clone(),
            phys: Some(phys),
            inbound,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn slot(&self) -> &SlotRef {
        &self.slot
    }

    /// Whether this side has closed or acknowledged a close.
    pub fn is_closed(&self) -> bool {
        self.phys.is_none()
    }

    /// Queue application bytes for the backend.
    ///
    /// Safe to call from several tasks through a shared reference; bytes
    /// from one caller arrive in order.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), MuxError> {
        let phys = self.phys.as_ref().ok_or(MuxError::StreamClosed)?;
        phys.submit(Command::Data {
            stream_id: self.stream_id,
            payload: payload.into(),
        })
        .map_err(|_| MuxError::StreamClosed)
    }

    /// Next event from the backend.
    ///
    /// Receiving [`Inbound::Closed`] acknowledges the close, after which
    /// the stream is gone. Returns `None` once nothing more can arrive.
    pub async fn recv(&mut self) -> Option<Inbound> {
        let event = self.inbound.recv().await?;
        if let Inbound::Closed(_) = event {
            self.close(ReasonCode::CLOSED_BY_CLIENT);
        }
        Some(event)
    }

    /// Close the stream. Closing twice is a no-op.
    pub fn close(&mut self, reason: ReasonCode) {
        let Some(phys) = self.phys.take() else {
            return;
        };
        let _ = phys.submit(Command::CloseStream {
            stream_id: self.stream_id,
            reason,
        });
        phys.release();
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        self.close(ReasonCode::CLOSED_BY_CLIENT);
    }
}
