//! Download of user-data files (profile pictures and the like) referenced
//! by label.

use crate::context::Context;
use crate::framework::*;
use base64::prelude::*;
use bytes::Bytes;
use netfetch_api::{notification::*, server::*, *};
use std::sync::Arc;

/// Why a user-data download was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum UserDataCancelReason {
    /// The identity is gone.
    IdentityNotFound,
    /// The identity is inactive.
    IdentityIsInactive,
    /// The server no longer has the file.
    DeletedFromServer,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for UserDataCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::Deleted | ServerError::NotFound => {
                Self::DeletedFromServer
            }
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> UserDataCancelReason {
    tracing::warn!(?err, "store error");
    UserDataCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) struct UserDataOp {
    ctx: Context,
    identity: OwnedIdentity,
    label: Bytes,
}

impl Operation for UserDataOp {
    type Output = ();
    type Reason = UserDataCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([
            self.identity.to_string(),
            BASE64_URL_SAFE_NO_PAD.encode(&self.label),
        ])
    }

    fn execute(&self) -> BoxFut<'_, Result<(), UserDataCancelReason>> {
        use UserDataCancelReason as R;
        Box::pin(async move {
            let store = &self.ctx.store;
            let info = store
                .get_owned_identity(self.identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::IdentityNotFound)?;
            if !info.active {
                return Err(R::IdentityIsInactive);
            }

            let data = self
                .ctx
                .server
                .download_user_data(self.identity.clone(), self.label.clone())
                .await?;
            store
                .save_user_data(self.identity.clone(), self.label.clone(), data)
                .await
                .map_err(store_err)
        })
    }
}

struct Inner {
    ctx: Context,
    queue: OperationQueue<UserDataOp>,
    backoff: BackoffScheduler,
    awaiting_active: WaitingSet<OwnedIdentity, Bytes>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataInner")
            .field("queue", &self.queue)
            .field("awaiting_active", &self.awaiting_active.len())
            .finish()
    }
}

impl Inner {
    fn queue_download(&self, identity: OwnedIdentity, label: Bytes) -> bool {
        self.queue.queue(UserDataOp {
            ctx: self.ctx.clone(),
            identity,
            label,
        })
    }
}

/// Downloads user-data files.
#[derive(Debug)]
pub struct UserDataCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl UserDataCoordinator {
    /// Construct a new UserDataCoordinator.
    pub fn create(ctx: Context, backoff: BackoffConfig) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new("user-data", 2, true);
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("user-data", backoff),
            awaiting_active: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "user-data-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let activated = inner.ctx.bus.subscribe(
            NotificationKind::OwnedIdentityActiveStatusChanged,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::OwnedIdentityActiveStatusChanged {
                        identity,
                        active: true,
                    } = n
                    {
                        for label in inner.awaiting_active.take(identity) {
                            inner.queue_download(identity.clone(), label);
                        }
                    }
                }
            },
        );

        Arc::new(Self {
            inner,
            _outcome_task,
            _subscriptions: vec![activated],
        })
    }

    /// Download the user-data file with this label.
    pub fn download_user_data(&self, identity: OwnedIdentity, label: Bytes) {
        self.inner.queue_download(identity, label);
    }

    /// Queue every user-data file whose local copy is missing.
    pub async fn resume_on_startup(&self) -> NfResult<()> {
        for u in self.inner.ctx.store.get_user_data_to_download().await? {
            self.inner.queue_download(u.identity, u.label);
        }
        Ok(())
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

async fn outcome_task(inner: Arc<Inner>, mut outcomes: OutcomeRecv<UserDataOp>) {
    use UserDataCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let label = op.label.clone();
        match outcome {
            Outcome::Finished(()) => {
                inner.backoff.clear_failed_count(&key);
                inner
                    .ctx
                    .bus
                    .post(Notification::UserDataDownloaded { identity, label });
            }
            Outcome::Cancelled(Some(R::IdentityIsInactive)) => {
                inner.awaiting_active.park(identity.clone(), label);
                if inner.ctx.is_active(&identity).await {
                    for label in inner.awaiting_active.take(&identity) {
                        inner.queue_download(identity.clone(), label);
                    }
                }
            }
            Outcome::Cancelled(Some(R::IdentityNotFound)) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(
                    ?identity,
                    "dropping user data of unknown identity"
                );
            }
            Outcome::Cancelled(Some(R::DeletedFromServer)) => {
                inner.backoff.clear_failed_count(&key);
                tracing::info!(?identity, "user data deleted from server");
                if let Err(err) =
                    inner.ctx.store.delete_user_data(identity, label).await
                {
                    tracing::warn!(?err, "cannot delete user data");
                }
            }
            Outcome::Cancelled(
                reason @ (Some(
                    R::NetworkError | R::ServerError(_) | R::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "user-data", {
                    let identity = identity.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_download(identity, label);
                        }
                    }
                });
                tracing::warn!(
                    ?identity,
                    ?reason,
                    ?delay,
                    "user data download failed, will retry"
                );
            }
        }
    }
}
