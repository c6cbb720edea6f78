//! Dialing backends and re-dialing them after failures.

use std::future::Future;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::framing::MuxFramed;
use crate::physical::{PhysicalDriver, handshake};
use crate::pool::PoolInner;
use crate::runtime;
use crate::{ConnectionError, ServerConfig, SlotRef};

/// Failed attempts per slot logged at info; later ones go to debug.
const LOUD_CONNECT_FAILURES: u32 = 3;

/// Opens transports to backend servers.
///
/// Called again for every connect attempt, so it should be cheap to call.
pub trait Connector: Send + Sync + 'static {
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        server: &ServerConfig,
    ) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Dials `server.address` over TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpStream;

    fn connect(
        &self,
        server: &ServerConfig,
    ) -> impl Future<Output = io::Result<Self::Transport>> + Send {
        let address = server.address.clone();
        async move {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// Attempt to connect `slot` after `delay`. The attempt is skipped if the
/// pool is gone or the slot is not `Disconnected` by then.
pub(crate) fn schedule<C: Connector>(pool: Weak<PoolInner<C>>, slot: SlotRef, delay: Duration) {
    trace!(%slot, ?delay, "connect scheduled");
    runtime::schedule_once(delay, async move {
        if let Some(pool) = pool.upgrade() {
            connect_slot(&pool, slot).await;
        }
    });
}

async fn connect_slot<C: Connector>(pool: &Arc<PoolInner<C>>, slot: SlotRef) {
    let Some(server) = pool.begin_connect(&slot) else {
        trace!(%slot, "slot busy or gone, connect skipped");
        return;
    };
    debug!(%slot, address = %server.address, "connecting");

    let stream = match runtime::timeout(pool.config.connect_timeout, pool.connector.connect(&server)).await {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => {
            connect_failed(pool, &slot, &server, ConnectionError::Io(e));
            return;
        }
        None => {
            connect_failed(pool, &slot, &server, ConnectionError::Timeout);
            return;
        }
    };

    if !pool.begin_handshake(&slot) {
        debug!(%slot, "slot changed during connect, dropping transport");
        return;
    }
    let mut io = MuxFramed::new(stream, pool.config.max_frame_len);
    if let Err(e) = handshake(&mut io, &pool.config).await {
        connect_failed(pool, &slot, &server, e);
        return;
    }

    let generation = pool.next_generation();
    let (driver, shared) = PhysicalDriver::new(
        io,
        slot.clone(),
        generation,
        pool.lifecycle(),
        Arc::clone(&pool.stats),
        &pool.config,
    );
    if pool.connected(&slot, shared) {
        info!(%slot, address = %server.address, generation, "physical connection established");
        runtime::spawn(driver.run());
    } else {
        debug!(%slot, "slot no longer wanted, dropping new connection");
    }
}

fn connect_failed<C: Connector>(
    pool: &PoolInner<C>,
    slot: &SlotRef,
    server: &ServerConfig,
    error: ConnectionError,
) {
    let Some(failures) = pool.attempt_failed(slot) else {
        return;
    };
    let delay = pool.config.reconnect_delay;
    if failures <= LOUD_CONNECT_FAILURES {
        info!(%slot, address = %server.address, %error, failures, ?delay, "connect failed, will retry");
    } else {
        debug!(%slot, address = %server.address, %error, failures, ?delay, "connect failed, will retry");
    }
    pool.schedule_reconnect(slot.clone());
}
