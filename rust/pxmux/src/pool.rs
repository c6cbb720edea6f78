use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pxmux_wire::ReasonCode;
use tracing::{debug, info};

use crate::physical::{PhysicalRef, PhysicalShared, SlotLifecycle};
use crate::reconnect::{self, Connector, TcpConnector};
use crate::{ConfigError, MuxConfig, MuxError, MuxStats, ServerConfig, VirtualConnection};

/// Identifies one slot of one server. Immutable; cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub server: Arc<str>,
    pub index: usize,
}

impl SlotRef {
    pub fn new(server: impl Into<Arc<str>>, index: usize) -> Self {
        Self {
            server: server.into(),
            index,
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.server, self.index)
    }
}

/// Lifecycle of the physical connection in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysState {
    Disconnected,
    TcpConnecting,
    ProtocolHandshaking,
    /// The only state in which new streams may be created.
    Connected,
    /// Closing; waiting for streams and references to drain.
    Disconnecting,
}

struct Slot {
    state: PhysState,
    conn: Option<Arc<PhysicalShared>>,
    /// Consecutive failed connect attempts.
    failures: u32,
}

pub(crate) struct Server {
    config: ServerConfig,
    slots: Box<[Mutex<Slot>]>,
    /// Set by `remove_server`. The entry stays in the map until every slot
    /// is back to `Disconnected`, so the name cannot be dialed twice.
    removed: AtomicBool,
}

impl Server {
    fn new(config: ServerConfig, slots: usize) -> Self {
        Self {
            config,
            removed: AtomicBool::new(false),
            slots: (0..slots)
                .map(|_| {
                    Mutex::new(Slot {
                        state: PhysState::Disconnected,
                        conn: None,
                        failures: 0,
                    })
                })
                .collect(),
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// No slot holds or is building a physical connection.
    fn is_idle(&self) -> bool {
        self.slots.iter().all(|slot| {
            let slot = slot.lock();
            slot.state == PhysState::Disconnected && slot.conn.is_none()
        })
    }

    fn shutdown_connections(&self, reason: ReasonCode) {
        for slot in self.slots.iter() {
            if let Some(conn) = &slot.lock().conn {
                conn.shutdown(reason);
            }
        }
    }
}

/// Keeps up to one physical connection per slot to every registered server
/// and hands out virtual connections over them.
///
/// Must be used from within a tokio runtime: registering a server spawns
/// the tasks that connect its slots.
pub struct MuxPool<C: Connector = TcpConnector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for MuxPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MuxPool<TcpConnector> {
    /// A pool dialing backends over TCP.
    pub fn tcp(config: MuxConfig) -> Result<Self, ConfigError> {
        Self::new(config, TcpConnector)
    }
}

impl<C: Connector> MuxPool<C> {
    pub fn new(config: MuxConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let stats = Arc::new(MuxStats::new(config.slots));
        let inner = Arc::new_cyclic(|me| PoolInner {
            config,
            connector,
            stats,
            servers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            me: me.clone(),
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &MuxStats {
        &self.inner.stats
    }

    /// Register a backend and start connecting each of its slots after
    /// `initial_connect_delay`. Registering a name twice is a no-op.
    ///
    /// Fails with [`MuxError::ServerNotAvailable`] while the pool is shutting
    /// down, or while the connections of a removed server with the same name
    /// are still draining.
    pub fn register_server(&self, server: ServerConfig) -> Result<(), MuxError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(MuxError::ServerNotAvailable);
        }
        let name: Arc<str> = Arc::from(server.name.as_str());
        {
            let mut servers = self.inner.servers.lock();
            if let Some(existing) = servers.get(&name) {
                if existing.is_removed() {
                    debug!(server = %name, "previous connections still draining, registration refused");
                    return Err(MuxError::ServerNotAvailable);
                }
                debug!(server = %name, "server already registered");
                return Ok(());
            }
            info!(server = %name, address = %server.address, slots = self.inner.config.slots, "registering server");
            servers.insert(
                Arc::clone(&name),
                Arc::new(Server::new(server, self.inner.config.slots)),
            );
        }
        for index in 0..self.inner.config.slots {
            reconnect::schedule(
                self.inner.me.clone(),
                SlotRef::new(Arc::clone(&name), index),
                self.inner.config.initial_connect_delay,
            );
        }
        Ok(())
    }

    /// Forget a backend. Its physical connections close with
    /// [`ReasonCode::ENDPOINT_DISABLED`] and are not reconnected.
    ///
    /// The name is unknown to every call from here on, but cannot be
    /// registered again until those connections have been torn down.
    pub fn remove_server(&self, name: &str) -> Result<(), MuxError> {
        let server = {
            let servers = self.inner.servers.lock();
            let server = servers
                .get(name)
                .filter(|server| !server.is_removed())
                .ok_or_else(|| MuxError::UnknownServer(name.to_string()))?;
            server.removed.store(true, Ordering::Release);
            Arc::clone(server)
        };
        info!(server = %name, "removing server");
        server.shutdown_connections(ReasonCode::ENDPOINT_DISABLED);
        self.inner.reap_if_drained(name);
        Ok(())
    }

    /// Names of the registered servers.
    pub fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .servers
            .lock()
            .iter()
            .filter(|(_, server)| !server.is_removed())
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn slot_state(&self, server: &str, slot: usize) -> Result<PhysState, MuxError> {
        let server = self.inner.lookup(server)?;
        let slot = server.slots.get(slot).ok_or(MuxError::InvalidSlot(slot))?;
        Ok(slot.lock().state)
    }

    /// Whether new streams can currently be created on the slot.
    pub fn is_available(&self, server: &str, slot: usize) -> bool {
        matches!(self.slot_state(server, slot), Ok(PhysState::Connected))
    }

    /// Take a counted reference to the slot's physical connection.
    ///
    /// Fails with [`MuxError::ServerNotAvailable`] unless the slot is
    /// `Connected`.
    pub fn acquire(&self, server: &str, slot: usize) -> Result<PhysicalRef, MuxError> {
        let server = self.inner.lookup(server)?;
        let slot = server.slots.get(slot).ok_or(MuxError::InvalidSlot(slot))?;
        let guard = slot.lock();
        match (&guard.state, &guard.conn) {
            (PhysState::Connected, Some(conn)) => Ok(PhysicalRef::acquire(conn)),
            _ => Err(MuxError::ServerNotAvailable),
        }
    }

    /// Open a new stream on the slot's physical connection.
    pub async fn create_virtual_connection(
        &self,
        server: &str,
        slot: usize,
    ) -> Result<VirtualConnection, MuxError> {
        let phys = self.acquire(server, slot)?;
        VirtualConnection::open(phys).await
    }

    /// Remove every server and stop reconnecting.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let servers: Vec<_> = self.inner.servers.lock().drain().collect();
        info!(servers = servers.len(), "shutting down mux pool");
        for (_, server) in servers {
            server.shutdown_connections(ReasonCode::SERVER_NOT_AVAILABLE);
        }
    }
}

// ============================================================================
// Shared pool state
// ============================================================================

pub(crate) struct PoolInner<C: Connector> {
    pub(crate) config: MuxConfig,
    pub(crate) connector: C,
    pub(crate) stats: Arc<MuxStats>,
    servers: Mutex<HashMap<Arc<str>, Arc<Server>>>,
    shutting_down: AtomicBool,
    next_generation: AtomicU64,
    me: Weak<PoolInner<C>>,
}

impl<C: Connector> PoolInner<C> {
    /// A registered server. Removed servers that are still draining are
    /// reported as unknown.
    fn lookup(&self, name: &str) -> Result<Arc<Server>, MuxError> {
        self.servers
            .lock()
            .get(name)
            .filter(|server| !server.is_removed())
            .cloned()
            .ok_or_else(|| MuxError::UnknownServer(name.to_string()))
    }

    /// Run `f` with the slot locked, draining servers included. `None` once
    /// the server has left the map.
    fn with_slot<R>(&self, slot: &SlotRef, f: impl FnOnce(&Server, &mut Slot) -> R) -> Option<R> {
        let server = self.servers.lock().get(&*slot.server).cloned()?;
        let mut guard = server.slots.get(slot.index)?.lock();
        Some(f(&server, &mut guard))
    }

    /// Drop a removed server from the map once none of its slots holds a
    /// connection.
    fn reap_if_drained(&self, name: &str) {
        let mut servers = self.servers.lock();
        if servers
            .get(name)
            .is_some_and(|server| server.is_removed() && server.is_idle())
        {
            servers.remove(name);
            debug!(server = %name, "removed server drained");
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn lifecycle(&self) -> Weak<dyn SlotLifecycle> {
        let me: Weak<dyn SlotLifecycle> = self.me.clone();
        me
    }

    /// Claim a disconnected slot for a connect attempt. Returns the server
    /// to dial, or `None` if the slot is busy or gone.
    pub(crate) fn begin_connect(&self, slot: &SlotRef) -> Option<ServerConfig> {
        if self.is_shutting_down() {
            return None;
        }
        self.with_slot(slot, |server, s| {
            if server.is_removed() || s.state != PhysState::Disconnected {
                return None;
            }
            s.state = PhysState::TcpConnecting;
            Some(server.config.clone())
        })
        .flatten()
    }

    /// TCP is up; move to the handshake. False if the attempt was abandoned.
    pub(crate) fn begin_handshake(&self, slot: &SlotRef) -> bool {
        let proceed = self
            .with_slot(slot, |server, s| {
                if s.state != PhysState::TcpConnecting {
                    return false;
                }
                if server.is_removed() {
                    s.state = PhysState::Disconnected;
                    return false;
                }
                s.state = PhysState::ProtocolHandshaking;
                true
            })
            .unwrap_or(false);
        if !proceed {
            self.reap_if_drained(&slot.server);
        }
        proceed
    }

    /// The attempt failed. Returns the consecutive failure count, or `None`
    /// if the slot no longer belongs to this attempt or its server was
    /// removed.
    pub(crate) fn attempt_failed(&self, slot: &SlotRef) -> Option<u32> {
        let failures = self
            .with_slot(slot, |server, s| match s.state {
                PhysState::TcpConnecting | PhysState::ProtocolHandshaking => {
                    s.state = PhysState::Disconnected;
                    s.failures += 1;
                    (!server.is_removed()).then_some(s.failures)
                }
                _ => None,
            })
            .flatten();
        if failures.is_none() {
            self.reap_if_drained(&slot.server);
        }
        failures
    }

    /// Install a handshaken connection. False if the slot no longer wants
    /// it, in which case the caller drops it.
    pub(crate) fn connected(&self, slot: &SlotRef, conn: Arc<PhysicalShared>) -> bool {
        let shutting_down = self.is_shutting_down();
        let installed = self
            .with_slot(slot, |server, s| {
                if s.state != PhysState::ProtocolHandshaking {
                    return false;
                }
                if shutting_down || server.is_removed() {
                    s.state = PhysState::Disconnected;
                    return false;
                }
                s.state = PhysState::Connected;
                s.conn = Some(conn);
                s.failures = 0;
                true
            })
            .unwrap_or(false);
        if installed {
            self.stats.physical_opened(slot.index);
        } else {
            self.reap_if_drained(&slot.server);
        }
        installed
    }

    /// Count and schedule a reconnect after `reconnect_delay`.
    pub(crate) fn schedule_reconnect(&self, slot: SlotRef) {
        if self.is_shutting_down() {
            return;
        }
        self.stats.reconnect_scheduled(slot.index);
        reconnect::schedule(self.me.clone(), slot, self.config.reconnect_delay);
    }
}

impl<C: Connector> SlotLifecycle for PoolInner<C> {
    fn disconnecting(&self, slot: &SlotRef, generation: u64) {
        self.with_slot(slot, |_, s| {
            if s.conn.as_ref().is_some_and(|c| c.generation() == generation) {
                s.state = PhysState::Disconnecting;
            }
        });
    }

    fn torn_down(&self, slot: &SlotRef, generation: u64) {
        // Some(removed) when this generation was still installed.
        let freed = self
            .with_slot(slot, |server, s| {
                if s.conn.as_ref().is_some_and(|c| c.generation() == generation) {
                    s.state = PhysState::Disconnected;
                    s.conn = None;
                    Some(server.is_removed())
                } else {
                    None
                }
            })
            .flatten();
        match freed {
            Some(true) => {
                debug!(%slot, "slot of removed server free");
                self.reap_if_drained(&slot.server);
            }
            Some(false) => {
                debug!(%slot, delay = ?self.config.reconnect_delay, "slot free, scheduling reconnect");
                self.schedule_reconnect(slot.clone());
            }
            None => {}
        }
    }
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        for server in self.servers.get_mut().values() {
            server.shutdown_connections(ReasonCode::SERVER_NOT_AVAILABLE);
        }
    }
}
