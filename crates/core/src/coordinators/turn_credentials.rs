//! TURN credentials for outgoing and incoming calls.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{delegate::*, notification::*, record::*, server::*, *};
use std::sync::Arc;

/// Why a TURN credentials request was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnCredentialsCancelReason {
    /// The identity is gone.
    IdentityNotFound,
    /// The identity is inactive.
    IdentityIsInactive,
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The TURN urls of the server are not cached yet.
    WellKnownNotCached,
    /// The api key does not allow calls.
    PermissionDenied,
    /// The server does not support calls.
    CallsNotSupported,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for TurnCredentialsCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::PermissionDenied => Self::PermissionDenied,
            ServerError::NotSupported => Self::CallsNotSupported,
            ServerError::IdentityInactive => Self::IdentityIsInactive,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> TurnCredentialsCancelReason {
    tracing::warn!(?err, "store error");
    TurnCredentialsCancelReason::StoreError
}

/// A request for the credentials of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    /// The identity placing or receiving the call.
    pub identity: OwnedIdentity,
    /// The call.
    pub call_uuid: String,
    /// Username wanted for the caller.
    pub caller_username: String,
    /// Username wanted for the callee.
    pub callee_username: String,
}

#[derive(Debug)]
pub(crate) struct TurnCredentialsOp {
    ctx: Context,
    well_known: DynWellKnownCacheDelegate,
    request: TurnRequest,
}

impl Operation for TurnCredentialsOp {
    type Output = (TurnCredentials, Vec<String>);
    type Reason = TurnCredentialsCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([
            self.request.identity.to_string(),
            self.request.call_uuid.clone(),
        ])
    }

    fn execute(
        &self,
    ) -> BoxFut<'_, Result<Self::Output, TurnCredentialsCancelReason>> {
        use TurnCredentialsCancelReason as R;
        Box::pin(async move {
            let store = &self.ctx.store;
            let identity = &self.request.identity;

            let info = store
                .get_owned_identity(identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::IdentityNotFound)?;
            if !info.active {
                return Err(R::IdentityIsInactive);
            }

            let turn_servers =
                self.well_known.get_turn_urls(info.server).map_err(|err| {
                    if !err.is_not_cached_yet() {
                        tracing::warn!(?err, "cannot read turn urls");
                    }
                    R::WellKnownNotCached
                })?;

            let token = store
                .get_server_session_token(identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::InvalidServerSession(None))?;

            match self
                .ctx
                .server
                .get_turn_credentials(
                    identity.clone(),
                    token.clone(),
                    self.request.caller_username.clone(),
                    self.request.callee_username.clone(),
                )
                .await
            {
                Ok(credentials) => Ok((credentials, turn_servers)),
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
    queue: OperationQueue<TurnCredentialsOp>,
    backoff: BackoffScheduler,
    well_known: DynWellKnownCacheDelegate,
    session: DynCreateServerSessionDelegate,
    awaiting_session: WaitingSet<OwnedIdentity, TurnRequest>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentialsInner")
            .field("queue", &self.queue)
            .field("awaiting_session", &self.awaiting_session.len())
            .finish()
    }
}

impl Inner {
    fn queue_request(&self, request: TurnRequest) -> bool {
        self.queue.queue(TurnCredentialsOp {
            ctx: self.ctx.clone(),
            well_known: self.well_known.clone(),
            request,
        })
    }
}

/// Fetches TURN credentials.
#[derive(Debug)]
pub struct TurnCredentialsCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl TurnCredentialsCoordinator {
    /// Construct a new TurnCredentialsCoordinator.
    pub fn create(
        ctx: Context,
        backoff: BackoffConfig,
        well_known: DynWellKnownCacheDelegate,
        session: DynCreateServerSessionDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new("turn-credentials", 2, true);
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("turn-credentials", backoff),
            well_known,
            session,
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "turn-credentials-outcomes",
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
                            inner.queue_request(request);
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

    /// Get TURN credentials for a call. The answer is posted as
    /// [Notification::TurnCredentialsReceived] or
    /// [Notification::TurnCredentialsFailed].
    pub fn get_turn_credentials(&self, request: TurnRequest) {
        self.inner.queue_request(request);
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<TurnCredentialsOp>,
) {
    use TurnCredentialsCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let request = op.request.clone();
        let failed = |failure| Notification::TurnCredentialsFailed {
            identity: request.identity.clone(),
            call_uuid: request.call_uuid.clone(),
            failure,
        };
        match outcome {
            Outcome::Finished((credentials, turn_servers)) => {
                inner.backoff.clear_failed_count(&key);
                inner.ctx.bus.post(Notification::TurnCredentialsReceived {
                    identity: request.identity.clone(),
                    call_uuid: request.call_uuid.clone(),
                    credentials,
                    turn_servers,
                });
            }
            Outcome::Cancelled(Some(R::InvalidServerSession(token))) => {
                inner
                    .awaiting_session
                    .park(request.identity.clone(), request.clone());
                inner
                    .session
                    .create_server_session(request.identity.clone(), token);
            }
            Outcome::Cancelled(Some(R::IdentityIsInactive)) => {
                inner.backoff.clear_failed_count(&key);
                inner
                    .ctx
                    .bus
                    .post(failed(TurnCredentialsFailure::IdentityInactive));
            }
            Outcome::Cancelled(Some(R::PermissionDenied)) => {
                inner.backoff.clear_failed_count(&key);
                inner
                    .ctx
                    .bus
                    .post(failed(TurnCredentialsFailure::PermissionDenied));
            }
            Outcome::Cancelled(Some(R::CallsNotSupported)) => {
                inner.backoff.clear_failed_count(&key);
                inner
                    .ctx
                    .bus
                    .post(failed(TurnCredentialsFailure::CallsNotSupported));
            }
            Outcome::Cancelled(Some(R::IdentityNotFound)) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(
                    identity = ?request.identity,
                    "dropping turn request of unknown identity"
                );
            }
            Outcome::Cancelled(
                reason @ (Some(
                    R::WellKnownNotCached
                    | R::NetworkError
                    | R::ServerError(_)
                    | R::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "turn-credentials", {
                    let request = request.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_request(request);
                        }
                    }
                });
                tracing::warn!(
                    call_uuid = %request.call_uuid,
                    ?reason,
                    ?delay,
                    "turn credentials failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
