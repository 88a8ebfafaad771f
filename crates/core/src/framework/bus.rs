//! The notification bus.
//!
//! Notifications are delivered asynchronously, on a single dispatch task,
//! in the order they were posted. The listeners of a notification are
//! snapshotted when it is posted: a listener registered afterwards does
//! not see it, a listener removed afterwards still does.

use netfetch_api::notification::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// A bus listener.
pub type Listener = Arc<dyn Fn(&Notification) + 'static + Send + Sync>;

type Dispatch = (Notification, Vec<Listener>);

#[derive(Default)]
struct Listeners {
    by_kind: HashMap<NotificationKind, Vec<(u64, Listener)>>,
    next_id: u64,
}

struct BusInner {
    listeners: Mutex<Listeners>,
    dispatch_send: mpsc::UnboundedSender<Dispatch>,
    dispatch_task: tokio::task::AbortHandle,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

/// Publish/subscribe bus for [Notification]s.
#[derive(Clone)]
pub struct NotificationBus(Arc<BusInner>);

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus").finish()
    }
}

impl NotificationBus {
    /// Construct a new bus. Must be called within a tokio runtime.
    pub fn create() -> Self {
        let (dispatch_send, mut dispatch_recv) =
            mpsc::unbounded_channel::<Dispatch>();

        let dispatch_task = tokio::task::spawn(async move {
            while let Some((notification, listeners)) =
                dispatch_recv.recv().await
            {
                for listener in listeners {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                        || listener(&notification),
                    ))
                    .is_err()
                    {
                        tracing::error!(
                            kind = ?notification.kind(),
                            "notification listener panicked"
                        );
                    }
                }
            }
        })
        .abort_handle();

        Self(Arc::new(BusInner {
            listeners: Mutex::new(Listeners::default()),
            dispatch_send,
            dispatch_task,
        }))
    }

    /// Register a listener for one kind of notification. It stays
    /// registered until the returned [Subscription] is dropped or
    /// unsubscribed.
    pub fn subscribe<F>(&self, kind: NotificationKind, f: F) -> Subscription
    where
        F: Fn(&Notification) + 'static + Send + Sync,
    {
        let mut lock = self.0.listeners.lock().unwrap();
        let id = lock.next_id;
        lock.next_id += 1;
        lock.by_kind.entry(kind).or_default().push((id, Arc::new(f)));
        Subscription {
            bus: Arc::downgrade(&self.0),
            kind,
            id,
        }
    }

    /// Post a notification to the listeners currently subscribed to its
    /// kind.
    pub fn post(&self, notification: Notification) {
        let listeners = self
            .0
            .listeners
            .lock()
            .unwrap()
            .by_kind
            .get(&notification.kind())
            .map(|l| l.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>())
            .unwrap_or_default();

        tracing::trace!(?notification, listeners = listeners.len(), "post");

        if listeners.is_empty() {
            return;
        }

        if self.0.dispatch_send.send((notification, listeners)).is_err() {
            tracing::warn!("notification dispatch task has stopped");
        }
    }
}

/// A live bus registration.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: NotificationKind,
    id: u64,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        // handled by drop
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        // Dropping a listener can drop the last reference to its owner,
        // whose own subscriptions then come back here: never drop one
        // while the lock is held.
        let removed = {
            let mut lock = bus.listeners.lock().unwrap();
            let Some(list) = lock.by_kind.get_mut(&self.kind) else {
                return;
            };
            let removed = list
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|i| list.remove(i));
            if list.is_empty() {
                lock.by_kind.remove(&self.kind);
            }
            removed
        };
        drop(removed);
    }
}
