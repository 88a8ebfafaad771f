//! Server-side deletion of consumed messages.
//!
//! Requests are appended to a per-identity FIFO. One operation per
//! identity drains up to [DeleteConfig::max_batch_size] requests when it
//! starts executing and sends them in a single call. Whatever is left, or
//! was appended meanwhile, is picked up by exactly one follow-up operation.
//!
//! A batch that could not be sent goes back to the front of its FIFO, so
//! requests keep their order across retries.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, server::*, *,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Module name of the [DeleteConfig].
pub const MOD_NAME: &str = "Delete";

/// Configuration parameters for [DeleteCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteConfig {
    /// The maximum number of messages sent in one deletion call.
    ///
    /// Default: 50.
    pub max_batch_size: u32,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self { max_batch_size: 50 }
    }
}

impl ModConfig for DeleteConfig {}

/// Why a deletion batch was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteCancelReason {
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The owned identity no longer exists.
    IdentityNotFound,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for DeleteCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> DeleteCancelReason {
    tracing::warn!(?err, "store error");
    DeleteCancelReason::StoreError
}

/// A deletion request: the message, and whether it is only to be marked
/// as listed.
type Item = (MessageUid, bool);

#[derive(Debug, Default)]
struct PendingItems(Mutex<HashMap<OwnedIdentity, VecDeque<Item>>>);

impl PendingItems {
    fn push(&self, identity: OwnedIdentity, item: Item) {
        self.0
            .lock()
            .unwrap()
            .entry(identity)
            .or_default()
            .push_back(item);
    }

    fn drain(&self, identity: &OwnedIdentity, max: usize) -> Vec<Item> {
        let mut lock = self.0.lock().unwrap();
        let Some(items) = lock.get_mut(identity) else {
            return Vec::new();
        };
        let count = max.min(items.len());
        let out = items.drain(..count).collect();
        if items.is_empty() {
            lock.remove(identity);
        }
        out
    }

    fn restore_front(&self, identity: OwnedIdentity, batch: Vec<Item>) {
        if batch.is_empty() {
            return;
        }
        let mut lock = self.0.lock().unwrap();
        let items = lock.entry(identity).or_default();
        for item in batch.into_iter().rev() {
            items.push_front(item);
        }
    }

    fn len(&self, identity: &OwnedIdentity) -> usize {
        self.0
            .lock()
            .unwrap()
            .get(identity)
            .map(|i| i.len())
            .unwrap_or(0)
    }

    fn forget(&self, identity: &OwnedIdentity) -> usize {
        self.0
            .lock()
            .unwrap()
            .remove(identity)
            .map(|i| i.len())
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub(crate) struct DeleteBatchOp {
    ctx: Context,
    identity: OwnedIdentity,
    max_batch_size: usize,
    pending: Arc<PendingItems>,
    batch: Mutex<Vec<Item>>,
}

impl DeleteBatchOp {
    fn take_batch(&self) -> Vec<Item> {
        std::mem::take(&mut *self.batch.lock().unwrap())
    }
}

impl Operation for DeleteBatchOp {
    type Output = ();
    type Reason = DeleteCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([self.identity.to_string()])
    }

    fn execute(&self) -> BoxFut<'_, Result<(), DeleteCancelReason>> {
        Box::pin(async move {
            let store = &self.ctx.store;
            let identity = self.identity.clone();

            let info = store
                .get_owned_identity(identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(DeleteCancelReason::IdentityNotFound)?;

            let token = store
                .get_server_session_token(identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(DeleteCancelReason::InvalidServerSession(None))?;

            let batch = self.pending.drain(&identity, self.max_batch_size);
            if batch.is_empty() {
                return Ok(());
            }
            *self.batch.lock().unwrap() = batch.clone();

            tracing::debug!(?identity, count = batch.len(), "deleting batch");

            match self
                .ctx
                .server
                .delete_messages(
                    identity.clone(),
                    token.clone(),
                    info.device_uid,
                    batch.clone(),
                )
                .await
            {
                Ok(()) => (),
                Err(ServerError::InvalidSession) => {
                    return Err(DeleteCancelReason::InvalidServerSession(
                        Some(token),
                    ))
                }
                Err(err) => return Err(err.into()),
            }

            let (listed, deleted): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|(_, listed_only)| *listed_only);
            if !listed.is_empty() {
                store
                    .mark_messages_listed_on_server(
                        identity.clone(),
                        listed.into_iter().map(|(uid, _)| uid).collect(),
                    )
                    .await
                    .map_err(store_err)?;
            }
            if !deleted.is_empty() {
                store
                    .delete_inbox_messages(
                        identity,
                        deleted.into_iter().map(|(uid, _)| uid).collect(),
                    )
                    .await
                    .map_err(store_err)?;
            }

            // sent: nothing to restore anymore
            self.batch.lock().unwrap().clear();
            Ok(())
        })
    }
}

struct Inner {
    ctx: Context,
    config: DeleteConfig,
    queue: OperationQueue<DeleteBatchOp>,
    backoff: BackoffScheduler,
    session: DynCreateServerSessionDelegate,
    pending: Arc<PendingItems>,
    awaiting_session: WaitingSet<OwnedIdentity, ()>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeleteInner")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Inner {
    fn queue_batch(&self, identity: OwnedIdentity) -> bool {
        self.queue.queue(DeleteBatchOp {
            ctx: self.ctx.clone(),
            identity,
            max_batch_size: self.config.max_batch_size.max(1) as usize,
            pending: self.pending.clone(),
            batch: Mutex::new(Vec::new()),
        })
    }
}

/// Deletes consumed messages from the server, in batches.
#[derive(Debug)]
pub struct DeleteCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl DeleteCoordinator {
    /// Construct a new DeleteCoordinator.
    pub fn create(
        ctx: Context,
        config: DeleteConfig,
        backoff: BackoffConfig,
        session: DynCreateServerSessionDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new("delete", 1, true);
        let inner = Arc::new(Inner {
            ctx,
            config,
            queue,
            backoff: BackoffScheduler::new("delete", backoff),
            session,
            pending: Arc::new(PendingItems::default()),
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "delete-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let session_created = inner.ctx.bus.subscribe(
            NotificationKind::ServerSessionCreated,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerSessionCreated { identity } = n
                    {
                        if !inner.awaiting_session.take(identity).is_empty() {
                            inner.queue_batch(identity.clone());
                        }
                    }
                }
            },
        );

        Arc::new(Self {
            inner,
            _outcome_task,
            _subscriptions: vec![session_created],
        })
    }

    /// Number of requests waiting to be sent for an identity.
    pub fn pending_count(&self, identity: &OwnedIdentity) -> usize {
        self.inner.pending.len(identity)
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

impl DeleteMessageDelegate for DeleteCoordinator {
    fn delete_message(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        mark_as_listed_only: bool,
    ) {
        tracing::trace!(?identity, ?uid, mark_as_listed_only, "delete message");
        self.inner
            .pending
            .push(identity.clone(), (uid, mark_as_listed_only));
        self.inner.queue_batch(identity);
    }
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<DeleteBatchOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let batch = op.take_batch();
        match outcome {
            Outcome::Finished(()) => {
                inner.backoff.clear_failed_count(&key);
                // the key is free again: anything appended while the batch
                // was in flight needs a follow-up
                if inner.pending.len(&identity) > 0 {
                    inner.queue_batch(identity);
                }
            }
            Outcome::Cancelled(Some(
                DeleteCancelReason::InvalidServerSession(token),
            )) => {
                inner.pending.restore_front(identity.clone(), batch);
                inner.awaiting_session.park(identity.clone(), ());
                inner.session.create_server_session(identity, token);
            }
            Outcome::Cancelled(Some(DeleteCancelReason::IdentityNotFound)) => {
                inner.backoff.clear_failed_count(&key);
                let dropped = inner.pending.forget(&identity) + batch.len();
                tracing::warn!(
                    ?identity,
                    dropped,
                    "dropping deletions of unknown identity"
                );
            }
            Outcome::Cancelled(
                reason @ (Some(
                    DeleteCancelReason::NetworkError
                    | DeleteCancelReason::ServerError(_)
                    | DeleteCancelReason::StoreError,
                )
                | None),
            ) => {
                inner.pending.restore_front(identity.clone(), batch);
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "delete-batch", {
                    let identity = identity.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_batch(identity);
                        }
                    }
                });
                tracing::warn!(
                    ?identity,
                    ?reason,
                    ?delay,
                    "deletion failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
