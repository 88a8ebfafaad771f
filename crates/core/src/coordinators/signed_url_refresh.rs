//! Refresh of expired attachment chunk urls.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, server::*, *,
};
use std::sync::Arc;

/// Module name of the [SignedUrlRefreshConfig].
pub const MOD_NAME: &str = "SignedUrlRefresh";

/// Configuration parameters for [SignedUrlRefreshCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignedUrlRefreshConfig {
    /// How many refreshes may run concurrently.
    ///
    /// Default: 2.
    pub worker_count: u32,
}

impl Default for SignedUrlRefreshConfig {
    fn default() -> Self {
        Self { worker_count: 2 }
    }
}

impl ModConfig for SignedUrlRefreshConfig {}

/// Why a signed url refresh was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum SignedUrlRefreshCancelReason {
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The message is gone from the server.
    DeletedFromServer,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for SignedUrlRefreshCancelReason {
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

fn store_err(err: NfError) -> SignedUrlRefreshCancelReason {
    tracing::warn!(?err, "store error");
    SignedUrlRefreshCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) struct RefreshSignedUrlOp {
    ctx: Context,
    identity: OwnedIdentity,
    uid: MessageUid,
    number: u32,
}

impl Operation for RefreshSignedUrlOp {
    type Output = ();
    type Reason = SignedUrlRefreshCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([
            self.identity.to_string(),
            self.uid.to_string(),
            self.number.to_string(),
        ])
    }

    fn execute(&self) -> BoxFut<'_, Result<(), SignedUrlRefreshCancelReason>> {
        Box::pin(async move {
            let token = self
                .ctx
                .store
                .get_server_session_token(self.identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(SignedUrlRefreshCancelReason::InvalidServerSession(
                    None,
                ))?;

            let urls = match self
                .ctx
                .server
                .refresh_signed_urls(
                    self.identity.clone(),
                    token.clone(),
                    self.uid.clone(),
                )
                .await
            {
                Ok(urls) => urls,
                Err(ServerError::InvalidSession) => {
                    return Err(
                        SignedUrlRefreshCancelReason::InvalidServerSession(
                            Some(token),
                        ),
                    )
                }
                Err(err) => return Err(err.into()),
            };

            self.ctx
                .store
                .update_attachment_urls(
                    self.identity.clone(),
                    self.uid.clone(),
                    urls,
                )
                .await
                .map_err(store_err)
        })
    }
}

struct Inner {
    ctx: Context,
    queue: OperationQueue<RefreshSignedUrlOp>,
    backoff: BackoffScheduler,
    session: DynCreateServerSessionDelegate,
    delete: DynDeleteMessageDelegate,
    awaiting_session: WaitingSet<OwnedIdentity, (MessageUid, u32)>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedUrlRefreshInner")
            .field("queue", &self.queue)
            .field("awaiting_session", &self.awaiting_session.len())
            .finish()
    }
}

impl Inner {
    fn queue_refresh(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> bool {
        self.queue.queue(RefreshSignedUrlOp {
            ctx: self.ctx.clone(),
            identity,
            uid,
            number,
        })
    }
}

/// Refreshes signed urls on behalf of the attachment downloads.
#[derive(Debug)]
pub struct SignedUrlRefreshCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl SignedUrlRefreshCoordinator {
    /// Construct a new SignedUrlRefreshCoordinator.
    pub fn create(
        ctx: Context,
        config: SignedUrlRefreshConfig,
        backoff: BackoffConfig,
        session: DynCreateServerSessionDelegate,
        delete: DynDeleteMessageDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new(
            "signed-url-refresh",
            config.worker_count as usize,
            true,
        );
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("signed-url-refresh", backoff),
            session,
            delete,
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "signed-url-refresh-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let session_created = inner.ctx.bus.subscribe(
            NotificationKind::ServerSessionCreated,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerSessionCreated { identity } = n
                    {
                        for (uid, number) in
                            inner.awaiting_session.take(identity)
                        {
                            inner.queue_refresh(identity.clone(), uid, number);
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

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

impl RefreshSignedUrlDelegate for SignedUrlRefreshCoordinator {
    fn refresh_signed_urls(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) {
        tracing::debug!(?identity, ?uid, number, "refresh signed urls");
        self.inner.queue_refresh(identity, uid, number);
    }
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<RefreshSignedUrlOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let uid = op.uid.clone();
        let number = op.number;
        match outcome {
            Outcome::Finished(()) => {
                inner.backoff.clear_failed_count(&key);
                inner.ctx.bus.post(Notification::SignedUrlRefreshed {
                    identity,
                    uid,
                    number,
                });
            }
            Outcome::Cancelled(Some(
                SignedUrlRefreshCancelReason::InvalidServerSession(token),
            )) => {
                inner
                    .awaiting_session
                    .park(identity.clone(), (uid, number));
                inner.session.create_server_session(identity, token);
            }
            Outcome::Cancelled(Some(
                SignedUrlRefreshCancelReason::DeletedFromServer,
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::info!(
                    ?identity,
                    ?uid,
                    number,
                    "attachment deleted from server"
                );
                match inner
                    .ctx
                    .store
                    .mark_attachment_for_deletion(
                        identity.clone(),
                        uid.clone(),
                        number,
                    )
                    .await
                {
                    Ok(true) => inner.delete.delete_message(
                        identity.clone(),
                        uid.clone(),
                        false,
                    ),
                    Ok(false) => (),
                    Err(err) => {
                        tracing::warn!(
                            ?err,
                            "cannot mark attachment for deletion"
                        )
                    }
                }
                inner.ctx.bus.post(Notification::AttachmentDownloadFailed {
                    identity,
                    uid,
                    number,
                    failure: AttachmentFailure::DeletedFromServer,
                });
            }
            Outcome::Cancelled(
                reason @ (Some(
                    SignedUrlRefreshCancelReason::NetworkError
                    | SignedUrlRefreshCancelReason::ServerError(_)
                    | SignedUrlRefreshCancelReason::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(
                    key,
                    "refresh-signed-urls",
                    {
                        let identity = identity.clone();
                        let uid = uid.clone();
                        move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.queue_refresh(identity, uid, number);
                            }
                        }
                    },
                );
                tracing::warn!(
                    ?identity,
                    ?uid,
                    number,
                    ?reason,
                    ?delay,
                    "signed url refresh failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
