//! The generic operation framework the coordinators are built on.

mod operation;
pub use operation::*;

mod queue;
pub use queue::*;

mod backoff;
pub use backoff::*;

mod bus;
pub use bus::*;

mod waiting;
pub use waiting::*;

/// Aborts a spawned task when dropped.
pub(crate) struct DropAbortHandle {
    pub(crate) name: String,
    pub(crate) handle: tokio::task::AbortHandle,
}

impl std::fmt::Debug for DropAbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropAbortHandle")
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for DropAbortHandle {
    fn drop(&mut self) {
        tracing::debug!("Aborting: {}", self.name);
        self.handle.abort();
    }
}

impl DropAbortHandle {
    pub(crate) fn spawn<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            handle: tokio::task::spawn(fut).abort_handle(),
        }
    }
}

#[cfg(test)]
mod test;
