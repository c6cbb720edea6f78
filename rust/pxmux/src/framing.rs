//! Length-prefixed mux framing for async byte streams.
//!
//! Each mux frame travels as a 4-byte big-endian length followed by the
//! frame bytes (control word and payload). Generic over the transport so the
//! same code runs over `TcpStream` in production and `tokio::io::duplex` in
//! tests.

use pxmux_wire::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::ConnectionError;

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;
const FRAME_LEN_PREFIX_SIZE: usize = 4;

fn compact_recv_buffer(buf: &mut Vec<u8>, unread_start: &mut usize) {
    if *unread_start == buf.len() {
        buf.clear();
        *unread_start = 0;
        return;
    }

    if *unread_start >= RECV_BUF_COMPACT_THRESHOLD && *unread_start >= buf.len() / 2 {
        buf.drain(..*unread_start);
        *unread_start = 0;
    }
}

fn try_decode_one_from_buffer(
    buf: &mut Vec<u8>,
    unread_start: &mut usize,
    max_frame_len: usize,
) -> Result<Option<Frame>, ConnectionError> {
    let unread = &buf[*unread_start..];
    if unread.len() < FRAME_LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let frame_len = u32::from_be_bytes([unread[0], unread[1], unread[2], unread[3]]) as usize;
    if frame_len > max_frame_len {
        return Err(ConnectionError::FrameTooLarge {
            len: frame_len,
            max: max_frame_len,
        });
    }
    let frame_end = *unread_start + FRAME_LEN_PREFIX_SIZE + frame_len;
    if frame_end > buf.len() {
        return Ok(None);
    }

    let frame_start = *unread_start + FRAME_LEN_PREFIX_SIZE;
    let decoded = Frame::decode(&buf[frame_start..frame_end]);
    *unread_start = frame_end;
    compact_recv_buffer(buf, unread_start);

    let frame = decoded?;
    trace!(command = ?frame.command(), stream_id = ?frame.stream_id(), "<-- frame");
    Ok(Some(frame))
}

/// A mux connection over an async byte stream.
///
/// Used by the proxy side of every physical connection, and usable as the
/// backend side as well since the framing is symmetric.
pub struct MuxFramed<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
    max_frame_len: usize,
    /// Reused for encoding to avoid reallocations.
    encode_buf: Vec<u8>,
}

impl<S> MuxFramed<S> {
    /// Wrap `stream`, rejecting inbound frames longer than `max_frame_len`.
    pub fn new(stream: S, max_frame_len: usize) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
            max_frame_len,
            encode_buf: Vec::with_capacity(1024),
        }
    }
}

impl<S> MuxFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one frame and flush.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        self.encode_buf.clear();
        self.encode_buf.extend_from_slice(&[0; FRAME_LEN_PREFIX_SIZE]);
        frame.encode_into(&mut self.encode_buf)?;

        let frame_len = self.encode_buf.len() - FRAME_LEN_PREFIX_SIZE;
        let prefix = u32::try_from(frame_len).map_err(|_| ConnectionError::FrameTooLarge {
            len: frame_len,
            max: u32::MAX as usize,
        })?;
        self.encode_buf[..FRAME_LEN_PREFIX_SIZE].copy_from_slice(&prefix.to_be_bytes());

        trace!(command = ?frame.command(), stream_id = ?frame.stream_id(), len = frame_len, "--> frame");
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one frame.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. Cancel safe: bytes
    /// already read stay buffered.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ConnectionError> {
        loop {
            if let Some(frame) =
                try_decode_one_from_buffer(&mut self.buf, &mut self.unread_start, self.max_frame_len)?
            {
                return Ok(Some(frame));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len().saturating_sub(self.unread_start);
                if trailing != 0 {
                    return Err(ConnectionError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no complete frame"),
                    )));
                }
                trace!("<-- eof");
                return Ok(None);
            }
            compact_recv_buffer(&mut self.buf, &mut self.unread_start);
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Shut down the write half, ignoring errors.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
