//! Download of the extended payload of inbox messages.
//!
//! An extended payload is optional: any failure other than a transient one
//! clears it and the message is shown without it.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{delegate::*, notification::*, server::*, *};
use std::sync::Arc;

/// Why an extended payload download was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedPayloadCancelReason {
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The message is gone, or has no extended payload.
    MessageNotFound,
    /// The decryption key of the payload is not known yet.
    KeyNotAvailable,
    /// The server no longer has the payload.
    DeletedFromServer,
    /// The payload could not be decrypted.
    DecryptionError,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for ExtendedPayloadCancelReason {
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

fn store_err(err: NfError) -> ExtendedPayloadCancelReason {
    tracing::warn!(?err, "store error");
    ExtendedPayloadCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) struct ExtendedPayloadOp {
    ctx: Context,
    identity: OwnedIdentity,
    uid: MessageUid,
}

impl Operation for ExtendedPayloadOp {
    type Output = Bytes;
    type Reason = ExtendedPayloadCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([self.identity.to_string(), self.uid.to_string()])
    }

    fn execute(&self) -> BoxFut<'_, Result<Bytes, ExtendedPayloadCancelReason>> {
        use ExtendedPayloadCancelReason as R;
        Box::pin(async move {
            let store = &self.ctx.store;

            let message = store
                .get_inbox_message(self.identity.clone(), self.uid.clone())
                .await
                .map_err(store_err)?
                .filter(|m| m.has_extended_payload)
                .ok_or(R::MessageNotFound)?;
            let key =
                message.extended_payload_key.ok_or(R::KeyNotAvailable)?;

            let token = store
                .get_server_session_token(self.identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::InvalidServerSession(None))?;

            let encrypted = match self
                .ctx
                .server
                .download_extended_payload(
                    self.identity.clone(),
                    token.clone(),
                    self.uid.clone(),
                )
                .await
            {
                Ok(encrypted) => encrypted,
                Err(ServerError::InvalidSession) => {
                    return Err(R::InvalidServerSession(Some(token)))
                }
                Err(err) => return Err(err.into()),
            };

            let payload = self
                .ctx
                .crypto
                .decrypt_extended_payload(key, encrypted)
                .map_err(|err| {
                    tracing::warn!(?err, "cannot decrypt extended payload");
                    R::DecryptionError
                })?;

            store
                .set_extended_payload(
                    self.identity.clone(),
                    self.uid.clone(),
                    payload.clone(),
                )
                .await
                .map_err(store_err)?;
            Ok(payload)
        })
    }
}

struct Inner {
    ctx: Context,
    queue: OperationQueue<ExtendedPayloadOp>,
    backoff: BackoffScheduler,
    session: DynCreateServerSessionDelegate,
    awaiting_session: WaitingSet<OwnedIdentity, MessageUid>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedPayloadInner")
            .field("queue", &self.queue)
            .field("awaiting_session", &self.awaiting_session.len())
            .finish()
    }
}

impl Inner {
    fn queue_download(&self, identity: OwnedIdentity, uid: MessageUid) -> bool {
        self.queue.queue(ExtendedPayloadOp {
            ctx: self.ctx.clone(),
            identity,
            uid,
        })
    }
}

/// Downloads and decrypts extended payloads.
#[derive(Debug)]
pub struct ExtendedPayloadCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl ExtendedPayloadCoordinator {
    /// Construct a new ExtendedPayloadCoordinator.
    pub fn create(
        ctx: Context,
        backoff: BackoffConfig,
        session: DynCreateServerSessionDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) =
            OperationQueue::new("extended-payload", 2, true);
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("extended-payload", backoff),
            session,
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "extended-payload-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let session_created = inner.ctx.bus.subscribe(
            NotificationKind::ServerSessionCreated,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerSessionCreated { identity } = n
                    {
                        for uid in inner.awaiting_session.take(identity) {
                            inner.queue_download(identity.clone(), uid);
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

    /// Download the extended payload of a message.
    pub fn download_extended_payload(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) {
        self.inner.queue_download(identity, uid);
    }

    /// Queue every extended payload whose key is known but whose content
    /// was never downloaded.
    pub async fn resume_on_startup(&self) -> NfResult<()> {
        for m in self.inner.ctx.store.get_inbox_messages().await? {
            if m.has_extended_payload
                && m.extended_payload_key.is_some()
                && m.extended_payload.is_none()
            {
                self.inner.queue_download(m.identity, m.uid);
            }
        }
        Ok(())
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<ExtendedPayloadOp>,
) {
    use ExtendedPayloadCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let uid = op.uid.clone();
        match outcome {
            Outcome::Finished(payload) => {
                inner.backoff.clear_failed_count(&key);
                inner
                    .ctx
                    .bus
                    .post(Notification::MessageExtendedPayloadDownloaded {
                        identity,
                        uid,
                        payload,
                    });
            }
            Outcome::Cancelled(Some(R::InvalidServerSession(token))) => {
                inner.awaiting_session.park(identity.clone(), uid);
                inner.session.create_server_session(identity, token);
            }
            Outcome::Cancelled(Some(
                reason @ (R::MessageNotFound | R::KeyNotAvailable),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(
                    ?identity,
                    ?uid,
                    ?reason,
                    "dropping extended payload download"
                );
            }
            Outcome::Cancelled(Some(
                reason @ (R::DeletedFromServer | R::DecryptionError),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(
                    ?identity,
                    ?uid,
                    ?reason,
                    "extended payload lost"
                );
                if let Err(err) =
                    inner.ctx.store.clear_extended_payload(identity, uid).await
                {
                    tracing::warn!(?err, "cannot clear extended payload");
                }
            }
            Outcome::Cancelled(
                reason @ (Some(
                    R::NetworkError | R::ServerError(_) | R::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "extended-payload", {
                    let identity = identity.clone();
                    let uid = uid.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_download(identity, uid);
                        }
                    }
                });
                tracing::warn!(
                    ?identity,
                    ?uid,
                    ?reason,
                    ?delay,
                    "extended payload download failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
