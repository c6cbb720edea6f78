#![deny(unsafe_code)]

//! Multiplexed backend connections for a messaging proxy.
//!
//! Many client sessions share a small number of long-lived TCP connections
//! to each backend server. Every client session gets a
//! [`VirtualConnection`]: a numbered stream carried over one of the
//! server's physical connections.
//!
//! - One physical connection per server per slot (IO processor), opened and
//!   re-opened by the pool on a fixed schedule
//! - `CreatePhysical` / `CreatePhysicalAck` handshake before a connection
//!   carries streams
//! - Stream ids handed out smallest-first, up to `max_streams`
//! - A backend failure closes every stream on that connection with a
//!   reason code; each stream's owner is told exactly once
//!
//! ```ignore
//! use pxmux::{Inbound, MuxConfig, MuxPool, ServerConfig};
//!
//! let pool = MuxPool::tcp(MuxConfig::default())?;
//! pool.register_server(ServerConfig::new("backend-1", "10.0.0.5:16102"))?;
//!
//! // later, from the IO processor with index `slot`:
//! let mut conn = pool.create_virtual_connection("backend-1", slot).await?;
//! conn.send(packet)?;
//! while let Some(event) = conn.recv().await {
//!     match event {
//!         Inbound::Data(bytes) => forward_to_client(bytes),
//!         Inbound::Closed(reason) => disconnect_client(reason),
//!     }
//! }
//! ```

mod config;
mod errors;
mod framing;
mod physical;
mod pool;
mod reconnect;
pub mod runtime;
mod stats;
pub mod stream_table;
mod virtual_conn;

#[cfg(test)]
mod tests;

pub use config::{MuxConfig, ServerConfig};
pub use errors::{ConfigError, ConnectionError, MuxError};
pub use framing::MuxFramed;
pub use physical::PhysicalRef;
pub use pool::{MuxPool, PhysState, SlotRef};
pub use reconnect::{Connector, TcpConnector};
pub use stats::{MuxStats, SlotStats, StatsSummary};
pub use virtual_conn::{Inbound, VirtualConnection};

pub use pxmux_wire as wire;
pub use pxmux_wire::{Frame, ReasonCode, StreamId};
