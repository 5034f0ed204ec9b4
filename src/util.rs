//! Small helpers for task lifetimes.

use tokio::task::JoinHandle;

/// A join handle that aborts its task when dropped.
#[derive(Debug)]
pub(crate) struct AbortingJoinHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> From<JoinHandle<T>> for AbortingJoinHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        AbortingJoinHandle { handle }
    }
}

impl<T> Drop for AbortingJoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
