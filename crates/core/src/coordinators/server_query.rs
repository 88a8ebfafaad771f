//! Pending server queries made by protocol instances.
//!
//! A query is saved by the channel layer, then posted here by uid. Signed
//! queries are executed through the server api. Transfer queries go
//! through the [TransferRelay]. Either way the answer, or a null answer
//! failing the protocol instance, is handed back to the channel layer and
//! the pending query is deleted.

use super::transfer_relay::*;
use crate::context::Context;
use crate::framework::*;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, record::*, server::*, *,
};
use std::sync::Arc;

/// Module name of the [ServerQueryConfig].
pub const MOD_NAME: &str = "ServerQuery";

/// Configuration parameters for [ServerQueryCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerQueryConfig {
    /// Relayed transfer payloads are split in fragments of at most this
    /// many bytes.
    ///
    /// Default: 10000.
    pub transfer_fragment_size: usize,

    /// Transfer requests run concurrently, one per protocol instance at a
    /// time. A waiting request holds its worker.
    ///
    /// Default: 4.
    pub transfer_worker_count: usize,
}

impl Default for ServerQueryConfig {
    fn default() -> Self {
        Self {
            transfer_fragment_size: 10_000,
            transfer_worker_count: 4,
        }
    }
}

impl ModConfig for ServerQueryConfig {}

/// Why a server query was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerQueryCancelReason {
    /// The query is no longer pending.
    QueryNotFound,
    /// The identity is inactive.
    IdentityIsInactive,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the query.
    ServerError(ServerError),
    /// The transfer failed.
    TransferFailed(TransferFailure),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for ServerQueryCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> ServerQueryCancelReason {
    tracing::warn!(?err, "store error");
    ServerQueryCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) struct ServerQueryOp {
    ctx: Context,
    relay: Arc<TransferRelay>,
    uid: QueryUid,
}

impl Operation for ServerQueryOp {
    type Output = (PendingServerQuery, ServerResponse);
    type Reason = ServerQueryCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([self.uid.to_string()])
    }

    fn execute(
        &self,
    ) -> BoxFut<'_, Result<Self::Output, ServerQueryCancelReason>> {
        use ServerQueryCancelReason as R;
        Box::pin(async move {
            let store = &self.ctx.store;
            let query = store
                .get_pending_server_query(self.uid.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::QueryNotFound)?;

            let response = match &query.kind {
                ServerQueryKind::Signed { method, body } => {
                    let active = store
                        .get_owned_identity(query.identity.clone())
                        .await
                        .map_err(store_err)?
                        .map(|i| i.active)
                        .unwrap_or(false);
                    if !active {
                        return Err(R::IdentityIsInactive);
                    }
                    ServerResponse::Signed(
                        self.ctx
                            .server
                            .execute_query(
                                query.identity.clone(),
                                method.clone(),
                                body.clone(),
                            )
                            .await?,
                    )
                }
                ServerQueryKind::Transfer {
                    protocol_instance,
                    request,
                } => self
                    .relay
                    .execute(&query.uid, &query.server, protocol_instance, request)
                    .await
                    .map_err(R::TransferFailed)?,
            };
            Ok((query, response))
        })
    }
}

struct Inner {
    ctx: Context,
    relay: Arc<TransferRelay>,
    signed: OperationQueue<ServerQueryOp>,
    transfer: OperationQueue<ServerQueryOp>,
    backoff: BackoffScheduler,
    awaiting_active: WaitingSet<OwnedIdentity, QueryUid>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerQueryInner")
            .field("signed", &self.signed)
            .field("transfer", &self.transfer)
            .field("relay", &self.relay)
            .finish()
    }
}

impl Inner {
    fn op(&self, uid: QueryUid) -> ServerQueryOp {
        ServerQueryOp {
            ctx: self.ctx.clone(),
            relay: self.relay.clone(),
            uid,
        }
    }

    async fn queue_query(&self, uid: QueryUid) -> NfResult<bool> {
        let Some(query) =
            self.ctx.store.get_pending_server_query(uid.clone()).await?
        else {
            tracing::debug!(?uid, "posted query is not pending");
            return Ok(false);
        };
        Ok(match query.kind {
            ServerQueryKind::Signed { .. } => self.signed.queue(self.op(uid)),
            ServerQueryKind::Transfer { .. } => {
                self.transfer.queue(self.op(uid))
            }
        })
    }

    async fn respond(
        &self,
        query: PendingServerQuery,
        response: Option<ServerResponse>,
    ) {
        let uid = query.uid.clone();
        if let Err(err) = self
            .ctx
            .channel
            .post(ChannelMessage::ServerQueryResponse { query, response })
            .await
        {
            // the query stays pending and is answered again on startup
            tracing::warn!(?err, ?uid, "cannot hand server query response");
            return;
        }
        if let Err(err) =
            self.ctx.store.delete_pending_server_query(uid).await
        {
            tracing::warn!(?err, "cannot delete answered server query");
        }
    }

    async fn fail(&self, uid: QueryUid) {
        match self.ctx.store.get_pending_server_query(uid.clone()).await {
            Ok(Some(query)) => self.respond(query, None).await,
            Ok(None) => (),
            Err(err) => tracing::warn!(?err, ?uid, "cannot read failed query"),
        }
    }
}

/// Executes pending server queries and answers them through the channel
/// layer.
#[derive(Debug)]
pub struct ServerQueryCoordinator {
    inner: Arc<Inner>,
    _outcome_tasks: [DropAbortHandle; 2],
    _subscriptions: Vec<Subscription>,
}

impl ServerQueryCoordinator {
    /// Construct a new ServerQueryCoordinator.
    pub fn create(
        ctx: Context,
        config: ServerQueryConfig,
        backoff: BackoffConfig,
        well_known: DynWellKnownCacheDelegate,
    ) -> Arc<Self> {
        let (signed, signed_outcomes) =
            OperationQueue::new("server-query", 1, true);
        let (transfer, transfer_outcomes) = OperationQueue::new(
            "transfer-query",
            config.transfer_worker_count.max(1),
            true,
        );
        let relay = Arc::new(TransferRelay::new(
            ctx.clone(),
            well_known,
            config.transfer_fragment_size,
        ));
        let inner = Arc::new(Inner {
            ctx,
            relay,
            signed,
            transfer,
            backoff: BackoffScheduler::new("server-query", backoff),
            awaiting_active: WaitingSet::default(),
        });

        let _outcome_tasks = [
            DropAbortHandle::spawn(
                "server-query-outcomes",
                outcome_task(inner.clone(), signed_outcomes),
            ),
            DropAbortHandle::spawn(
                "transfer-query-outcomes",
                outcome_task(inner.clone(), transfer_outcomes),
            ),
        ];

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
                        for uid in inner.awaiting_active.take(identity) {
                            inner.signed.queue(inner.op(uid));
                        }
                    }
                }
            },
        );

        Arc::new(Self {
            inner,
            _outcome_tasks,
            _subscriptions: vec![activated],
        })
    }

    /// Execute a pending server query saved in storage.
    pub async fn post_server_query(&self, uid: QueryUid) -> NfResult<()> {
        self.inner.queue_query(uid).await.map(|_| ())
    }

    /// Queue the pending signed queries, and fail the pending transfer
    /// queries since their sockets did not survive.
    pub async fn resume_on_startup(&self) -> NfResult<()> {
        for query in self.inner.ctx.store.get_pending_server_queries().await?
        {
            match query.kind {
                ServerQueryKind::Signed { .. } => {
                    self.inner.signed.queue(self.inner.op(query.uid));
                }
                ServerQueryKind::Transfer { .. } => {
                    self.inner.respond(query, None).await;
                }
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
    mut outcomes: OutcomeRecv<ServerQueryOp>,
) {
    use ServerQueryCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let uid = op.uid.clone();
        match outcome {
            Outcome::Finished((query, response)) => {
                inner.backoff.clear_failed_count(&key);
                inner.respond(query, Some(response)).await;
            }
            Outcome::Cancelled(Some(R::QueryNotFound)) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(?uid, "server query vanished");
            }
            Outcome::Cancelled(Some(R::IdentityIsInactive)) => {
                match inner.ctx.store.get_pending_server_query(uid.clone()).await
                {
                    Ok(Some(query)) => {
                        let identity = query.identity;
                        inner.awaiting_active.park(identity.clone(), uid);
                        if inner.ctx.is_active(&identity).await {
                            for uid in inner.awaiting_active.take(&identity) {
                                inner.signed.queue(inner.op(uid));
                            }
                        }
                    }
                    Ok(None) => (),
                    Err(err) => tracing::warn!(
                        ?err,
                        "cannot read server query"
                    ),
                }
            }
            Outcome::Cancelled(Some(
                reason @ (R::ServerError(_) | R::TransferFailed(_)),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(?uid, ?reason, "server query failed");
                inner.fail(uid).await;
            }
            Outcome::Cancelled(
                reason @ (Some(R::NetworkError | R::StoreError) | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "server-query", {
                    let uid = uid.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            tokio::task::spawn(async move {
                                if let Err(err) = inner.queue_query(uid).await {
                                    tracing::warn!(
                                        ?err,
                                        "cannot requeue server query"
                                    );
                                }
                            });
                        }
                    }
                });
                tracing::warn!(
                    ?uid,
                    ?reason,
                    ?delay,
                    "server query failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
