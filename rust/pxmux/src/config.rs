use std::time::Duration;

use pxmux_wire::PROTOCOL_VERSION;

use crate::ConfigError;

/// Pool-wide settings, fixed when the pool is created.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Number of slots (IO processors) per server. Each slot holds at most
    /// one physical connection.
    pub slots: usize,
    /// Name sent to the backend in `CreatePhysical`.
    pub instance_name: String,
    /// Build/info string sent to the backend in `CreatePhysical`.
    pub info: String,
    /// Protocol version sent in `CreatePhysical`.
    pub protocol_version: u8,
    /// Delay before the first connect of a newly registered server.
    pub initial_connect_delay: Duration,
    /// Fixed delay before re-dialing a slot after a failure or teardown.
    pub reconnect_delay: Duration,
    /// Limit on the TCP connect.
    pub connect_timeout: Duration,
    /// Limit on the `CreatePhysical` / `CreatePhysicalAck` exchange.
    pub handshake_timeout: Duration,
    /// How long a closing physical connection waits for stream owners to
    /// acknowledge before tearing down anyway.
    pub close_drain_timeout: Duration,
    /// Concurrent streams per physical connection (ids `1..=max_streams`).
    pub max_streams: u16,
    /// Largest mux frame accepted from the backend.
    pub max_frame_len: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            instance_name: "pxmux".to_string(),
            info: concat!("pxmux ", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: PROTOCOL_VERSION,
            initial_connect_delay: Duration::from_millis(10),
            reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            close_drain_timeout: Duration::from_secs(5),
            max_streams: u16::MAX,
            max_frame_len: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(ConfigError::NoSlots);
        }
        if self.max_streams == 0 {
            return Err(ConfigError::NoStreams);
        }
        if self.instance_name.len() > u16::MAX as usize {
            return Err(ConfigError::NameTooLong(self.instance_name.len()));
        }
        if self.info.len() > u16::MAX as usize {
            return Err(ConfigError::InfoTooLong(self.info.len()));
        }
        Ok(())
    }
}

/// A backend server the pool keeps connections to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Unique name; used to address the server in pool calls.
    pub name: String,
    /// `host:port` handed to the connector.
    pub address: String,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}
