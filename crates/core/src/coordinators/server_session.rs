//! Server session creation and api key status queries.
//!
//! A session is created by signing a server challenge with the identity's
//! key and exchanging the signature for a token. Workflows that hit an
//! invalid session call [CreateServerSessionDelegate::create_server_session]
//! with the token that was refused, and wait for
//! [Notification::ServerSessionCreated].
//!
//! If the stored token no longer equals the refused token, another
//! workflow already refreshed the session: the new session is announced
//! right away without a server round trip.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, record::*, server::*, *,
};
use std::sync::Arc;

/// Module name of the [ServerSessionConfig].
pub const MOD_NAME: &str = "ServerSession";

/// Configuration parameters for [ServerSessionCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSessionConfig {
    /// How many sessions may be created concurrently.
    ///
    /// Default: 2.
    pub worker_count: u32,
}

impl Default for ServerSessionConfig {
    fn default() -> Self {
        Self { worker_count: 2 }
    }
}

impl ModConfig for ServerSessionConfig {}

/// Why a session operation was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerSessionCancelReason {
    /// The owned identity no longer exists.
    IdentityNotFound,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// The challenge could not be signed.
    CryptoError,
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for ServerSessionCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::NotFound => Self::IdentityNotFound,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> ServerSessionCancelReason {
    tracing::warn!(?err, "store error");
    ServerSessionCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) struct CreateServerSessionOp {
    ctx: Context,
    identity: OwnedIdentity,
    invalid_token: Option<Bytes>,
}

impl Operation for CreateServerSessionOp {
    /// True if an existing session was kept.
    type Output = bool;
    type Reason = ServerSessionCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([
            "session".to_string(),
            self.identity.to_string(),
        ])
    }

    fn execute(&self) -> BoxFut<'_, Result<bool, ServerSessionCancelReason>> {
        Box::pin(async move {
            let store = &self.ctx.store;
            let identity = self.identity.clone();

            if let Some(invalid) = self.invalid_token.clone() {
                store
                    .delete_server_session_if_token(identity.clone(), invalid)
                    .await
                    .map_err(store_err)?;
            }

            if store
                .get_server_session_token(identity.clone())
                .await
                .map_err(store_err)?
                .is_some()
            {
                return Ok(true);
            }

            if store
                .get_owned_identity(identity.clone())
                .await
                .map_err(store_err)?
                .is_none()
            {
                return Err(ServerSessionCancelReason::IdentityNotFound);
            }

            let SessionChallenge { challenge, nonce } =
                self.ctx.server.request_challenge(identity.clone()).await?;

            let signature = self
                .ctx
                .crypto
                .solve_challenge(identity.clone(), challenge, nonce.clone())
                .map_err(|err| {
                    tracing::warn!(?err, "cannot solve challenge");
                    ServerSessionCancelReason::CryptoError
                })?;

            let (token, api_key_status) = self
                .ctx
                .server
                .get_token(identity.clone(), nonce, signature)
                .await?;

            store
                .save_server_session(ServerSession {
                    identity,
                    token,
                    api_key_status,
                })
                .await
                .map_err(store_err)?;

            Ok(false)
        })
    }
}

#[derive(Debug)]
pub(crate) struct QueryApiKeyStatusOp {
    ctx: Context,
    identity: OwnedIdentity,
    api_key: String,
}

impl Operation for QueryApiKeyStatusOp {
    type Output = ApiKeyStatus;
    type Reason = ServerSessionCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([
            "api-key".to_string(),
            self.identity.to_string(),
            self.api_key.clone(),
        ])
    }

    fn execute(
        &self,
    ) -> BoxFut<'_, Result<ApiKeyStatus, ServerSessionCancelReason>> {
        Box::pin(async move {
            Ok(self
                .ctx
                .server
                .query_api_key_status(
                    self.identity.clone(),
                    self.api_key.clone(),
                )
                .await?)
        })
    }
}

struct Inner {
    ctx: Context,
    sessions: OperationQueue<CreateServerSessionOp>,
    api_keys: OperationQueue<QueryApiKeyStatusOp>,
    backoff: BackoffScheduler,
}

impl Inner {
    fn queue_session(
        &self,
        identity: OwnedIdentity,
        invalid_token: Option<Bytes>,
    ) -> bool {
        self.sessions.queue(CreateServerSessionOp {
            ctx: self.ctx.clone(),
            identity,
            invalid_token,
        })
    }

    fn queue_api_key(&self, identity: OwnedIdentity, api_key: String) -> bool {
        self.api_keys.queue(QueryApiKeyStatusOp {
            ctx: self.ctx.clone(),
            identity,
            api_key,
        })
    }
}

/// Creates and refreshes server sessions.
#[derive(Debug)]
pub struct ServerSessionCoordinator {
    inner: Arc<Inner>,
    _session_task: DropAbortHandle,
    _api_key_task: DropAbortHandle,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSessionInner")
            .field("sessions", &self.sessions)
            .field("api_keys", &self.api_keys)
            .finish()
    }
}

impl ServerSessionCoordinator {
    /// Construct a new ServerSessionCoordinator.
    pub fn create(
        ctx: Context,
        config: ServerSessionConfig,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        let (sessions, session_outcomes) = OperationQueue::new(
            "server-session",
            config.worker_count as usize,
            true,
        );
        let (api_keys, api_key_outcomes) =
            OperationQueue::new("api-key-status", 1, true);

        let inner = Arc::new(Inner {
            ctx,
            sessions,
            api_keys,
            backoff: BackoffScheduler::new("server-session", backoff),
        });

        let _session_task = DropAbortHandle::spawn(
            "server-session-outcomes",
            session_outcome_task(inner.clone(), session_outcomes),
        );
        let _api_key_task = DropAbortHandle::spawn(
            "api-key-status-outcomes",
            api_key_outcome_task(inner.clone(), api_key_outcomes),
        );

        Arc::new(Self {
            inner,
            _session_task,
            _api_key_task,
        })
    }

    /// Query the status of an api key. The answer is posted as
    /// [Notification::ApiKeyStatusQuerySuccess] or
    /// [Notification::ApiKeyStatusQueryFailed].
    pub fn query_api_key_status(
        &self,
        identity: OwnedIdentity,
        api_key: String,
    ) {
        self.inner.queue_api_key(identity, api_key);
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

impl CreateServerSessionDelegate for ServerSessionCoordinator {
    fn create_server_session(
        &self,
        identity: OwnedIdentity,
        invalid_token: Option<Bytes>,
    ) {
        tracing::debug!(
            ?identity,
            has_invalid_token = invalid_token.is_some(),
            "create server session"
        );
        self.inner.queue_session(identity, invalid_token);
    }
}

async fn session_outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<CreateServerSessionOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        match outcome {
            Outcome::Finished(reused) => {
                tracing::info!(
                    identity = ?op.identity,
                    reused,
                    "server session ready"
                );
                inner.backoff.clear_failed_count(&key);
                inner.ctx.bus.post(Notification::ServerSessionCreated {
                    identity: op.identity.clone(),
                });
            }
            Outcome::Cancelled(Some(
                ServerSessionCancelReason::IdentityNotFound,
            )) => {
                tracing::warn!(
                    identity = ?op.identity,
                    "dropping session creation for unknown identity"
                );
                inner.backoff.clear_failed_count(&key);
            }
            Outcome::Cancelled(
                reason @ (Some(
                    ServerSessionCancelReason::NetworkError
                    | ServerSessionCancelReason::ServerError(_)
                    | ServerSessionCancelReason::CryptoError
                    | ServerSessionCancelReason::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let identity = op.identity.clone();
                let invalid_token = op.invalid_token.clone();
                let delay =
                    inner.backoff.schedule(key, "create-session", move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_session(identity, invalid_token);
                        }
                    });
                tracing::warn!(
                    identity = ?op.identity,
                    ?reason,
                    ?delay,
                    "session creation failed, will retry"
                );
            }
        }
    }
}

async fn api_key_outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<QueryApiKeyStatusOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        match outcome {
            Outcome::Finished(status) => {
                inner.backoff.clear_failed_count(&key);
                inner.ctx.bus.post(Notification::ApiKeyStatusQuerySuccess {
                    identity: op.identity.clone(),
                    api_key: op.api_key.clone(),
                    status,
                });
            }
            Outcome::Cancelled(
                reason @ (Some(ServerSessionCancelReason::NetworkError)
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let identity = op.identity.clone();
                let api_key = op.api_key.clone();
                let delay =
                    inner.backoff.schedule(key, "api-key-status", move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_api_key(identity, api_key);
                        }
                    });
                tracing::warn!(
                    identity = ?op.identity,
                    ?reason,
                    ?delay,
                    "api key status query failed, will retry"
                );
            }
            Outcome::Cancelled(Some(
                reason @ (ServerSessionCancelReason::IdentityNotFound
                | ServerSessionCancelReason::ServerError(_)
                | ServerSessionCancelReason::CryptoError
                | ServerSessionCancelReason::StoreError),
            )) => {
                tracing::warn!(
                    identity = ?op.identity,
                    ?reason,
                    "api key status query failed"
                );
                inner.backoff.clear_failed_count(&key);
                inner.ctx.bus.post(Notification::ApiKeyStatusQueryFailed {
                    identity: op.identity.clone(),
                    api_key: op.api_key.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod test;
