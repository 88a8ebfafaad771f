//! Free-trial queries and starts, and in-app purchase receipt
//! verification.
//!
//! The three requests share one queue. Each needs a session; a failure
//! other than a transient one is reported through its failure
//! notification.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{delegate::*, notification::*, record::*, server::*, *};
use std::sync::Arc;

/// A request handled by the [FreeTrialCoordinator].
#[derive(Debug, Clone, PartialEq)]
pub enum FreeTrialRequest {
    /// Ask whether a free trial is available.
    Query,
    /// Start the free trial.
    Start,
    /// Verify an in-app purchase receipt.
    VerifyReceipt {
        /// The store transaction.
        store_token: String,
    },
}

/// Why a free-trial or receipt request was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum FreeTrialCancelReason {
    /// The identity is gone.
    IdentityNotFound,
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for FreeTrialCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> FreeTrialCancelReason {
    tracing::warn!(?err, "store error");
    FreeTrialCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) enum FreeTrialAnswer {
    Availability(bool),
    Status(ApiKeyStatus),
}

#[derive(Debug)]
pub(crate) struct FreeTrialOp {
    ctx: Context,
    identity: OwnedIdentity,
    request: FreeTrialRequest,
}

impl Operation for FreeTrialOp {
    type Output = FreeTrialAnswer;
    type Reason = FreeTrialCancelReason;

    fn key(&self) -> OperationKey {
        let identity = self.identity.to_string();
        match &self.request {
            FreeTrialRequest::Query => {
                OperationKey::from_parts([identity.as_str(), "query"])
            }
            FreeTrialRequest::Start => {
                OperationKey::from_parts([identity.as_str(), "start"])
            }
            FreeTrialRequest::VerifyReceipt { store_token } => {
                OperationKey::from_parts([
                    identity.as_str(),
                    "receipt",
                    store_token.as_str(),
                ])
            }
        }
    }

    fn execute(&self) -> BoxFut<'_, Result<FreeTrialAnswer, FreeTrialCancelReason>> {
        use FreeTrialCancelReason as R;
        Box::pin(async move {
            let store = &self.ctx.store;
            store
                .get_owned_identity(self.identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::IdentityNotFound)?;
            let token = store
                .get_server_session_token(self.identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::InvalidServerSession(None))?;

            let server = &self.ctx.server;
            let identity = self.identity.clone();
            let res = match &self.request {
                FreeTrialRequest::Query => server
                    .query_free_trial(identity, token.clone())
                    .await
                    .map(|a| FreeTrialAnswer::Availability(a.available)),
                FreeTrialRequest::Start => server
                    .start_free_trial(identity, token.clone())
                    .await
                    .map(FreeTrialAnswer::Status),
                FreeTrialRequest::VerifyReceipt { store_token } => server
                    .verify_receipt(identity, token.clone(), store_token.clone())
                    .await
                    .map(FreeTrialAnswer::Status),
            };
            match res {
                Ok(answer) => Ok(answer),
                Err(ServerError::InvalidSession) => {
                    Err(R::InvalidServerSession(Some(token)))
                }
                Err(err) => Err(err.into()),
            }
        })
    }
}

struct Inner {
    ctx: Context,
    queue: OperationQueue<FreeTrialOp>,
    backoff: BackoffScheduler,
    session: DynCreateServerSessionDelegate,
    awaiting_session: WaitingSet<OwnedIdentity, FreeTrialRequest>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeTrialInner")
            .field("queue", &self.queue)
            .field("awaiting_session", &self.awaiting_session.len())
            .finish()
    }
}

impl Inner {
    fn queue_request(
        &self,
        identity: OwnedIdentity,
        request: FreeTrialRequest,
    ) -> bool {
        self.queue.queue(FreeTrialOp {
            ctx: self.ctx.clone(),
            identity,
            request,
        })
    }

    fn failed(&self, identity: OwnedIdentity, request: FreeTrialRequest) {
        self.ctx.bus.post(match request {
            FreeTrialRequest::Query => {
                Notification::FreeTrialQueryFailed { identity }
            }
            FreeTrialRequest::Start => {
                Notification::FreeTrialStartFailed { identity }
            }
            FreeTrialRequest::VerifyReceipt { store_token } => {
                Notification::ReceiptVerificationFailed {
                    identity,
                    store_token,
                }
            }
        });
    }
}

/// Free-trial and receipt-verification requests.
#[derive(Debug)]
pub struct FreeTrialCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl FreeTrialCoordinator {
    /// Construct a new FreeTrialCoordinator.
    pub fn create(
        ctx: Context,
        backoff: BackoffConfig,
        session: DynCreateServerSessionDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new("free-trial", 1, true);
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("free-trial", backoff),
            session,
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "free-trial-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let session_created = inner.ctx.bus.subscribe(
            NotificationKind::ServerSessionCreated,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerSessionCreated { identity } = n
                    {
                        for request in inner.awaiting_session.take(identity) {
                            inner.queue_request(identity.clone(), request);
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

    /// Ask whether a free trial is available.
    pub fn query_free_trial(&self, identity: OwnedIdentity) {
        self.inner.queue_request(identity, FreeTrialRequest::Query);
    }

    /// Start the free trial.
    pub fn start_free_trial(&self, identity: OwnedIdentity) {
        self.inner.queue_request(identity, FreeTrialRequest::Start);
    }

    /// Verify an in-app purchase receipt.
    pub fn verify_receipt(&self, identity: OwnedIdentity, store_token: String) {
        self.inner.queue_request(
            identity,
            FreeTrialRequest::VerifyReceipt { store_token },
        );
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

async fn outcome_task(inner: Arc<Inner>, mut outcomes: OutcomeRecv<FreeTrialOp>) {
    use FreeTrialCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let request = op.request.clone();
        match outcome {
            Outcome::Finished(answer) => {
                inner.backoff.clear_failed_count(&key);
                let n = match (request, answer) {
                    (_, FreeTrialAnswer::Availability(available)) => {
                        Notification::FreeTrialQuerySuccess {
                            identity,
                            available,
                        }
                    }
                    (
                        FreeTrialRequest::VerifyReceipt { store_token },
                        FreeTrialAnswer::Status(status),
                    ) => Notification::ReceiptVerificationSuccess {
                        identity,
                        store_token,
                        status,
                    },
                    (_, FreeTrialAnswer::Status(status)) => {
                        Notification::FreeTrialStartSuccess { identity, status }
                    }
                };
                inner.ctx.bus.post(n);
            }
            Outcome::Cancelled(Some(R::InvalidServerSession(token))) => {
                inner.awaiting_session.park(identity.clone(), request);
                inner.session.create_server_session(identity, token);
            }
            Outcome::Cancelled(Some(R::IdentityNotFound)) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(
                    ?identity,
                    ?request,
                    "dropping request of unknown identity"
                );
            }
            Outcome::Cancelled(Some(R::ServerError(err))) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(
                    ?identity,
                    ?request,
                    ?err,
                    "free trial request refused"
                );
                inner.failed(identity, request);
            }
            Outcome::Cancelled(
                reason @ (Some(R::NetworkError | R::StoreError) | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "free-trial", {
                    let identity = identity.clone();
                    let request = request.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_request(identity, request);
                        }
                    }
                });
                tracing::warn!(
                    ?identity,
                    ?request,
                    ?reason,
                    ?delay,
                    "free trial request failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
