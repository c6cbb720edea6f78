//! Runtime primitives used by the pool and the physical connection drivers.
//!
//! Everything goes through these wrappers so the places that spawn or sleep
//! are easy to find.

use std::future::Future;
use std::time::Duration;

pub use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
pub use tokio::sync::oneshot::{Sender as OneshotSender, channel as oneshot};
pub use tokio::task::JoinHandle;

/// Spawn a task that runs concurrently.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// Run `future` once, after `delay`.
pub fn schedule_once<F>(delay: Duration, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        sleep(delay).await;
        future.await;
    })
}

/// Sleep for the given duration.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Run a future with a timeout.
///
/// Returns `Some(result)` if the future completes within the timeout,
/// or `None` if the timeout expires.
pub async fn timeout<F, T>(duration: Duration, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    (tokio::time::timeout(duration, future).await).ok()
}
