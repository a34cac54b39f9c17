use std::future::Future;

use futures::future::{self, AbortHandle};
use tokio::task::spawn_local;

/// Aborts the spawned task when dropped.
#[derive(Debug)]
pub struct TaskHandle(AbortHandle);

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns `fut` on the current `LocalSet`, tying its lifetime to the
/// returned [`TaskHandle`].
pub fn spawn_abortable<F>(fut: F) -> TaskHandle
where
    F: Future<Output = ()> + 'static,
{
    let (fut, handle) = future::abortable(fut);
    spawn_local(async move {
        let _ = fut.await;
    });
    TaskHandle(handle)
}
