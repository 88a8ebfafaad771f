//! Inbox listing and hand-off of downloaded messages to the channel layer.
//!
//! A listing saves the messages that are new to us and asks the channel
//! layer to process each one. A truncated listing is followed by another
//! one after a short fixed delay, until the server has nothing more.
//! Messages pushed inline over the websocket take the same path without a
//! listing round trip.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, record::*, server::*, *,
};
use std::sync::Arc;
use std::time::Duration;

/// Module name of the [DownloadMessagesConfig].
pub const MOD_NAME: &str = "DownloadMessages";

/// Configuration parameters for [DownloadMessagesCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadMessagesConfig {
    /// How many listings may run concurrently.
    ///
    /// Default: 2.
    pub worker_count: u32,

    /// Delay before listing again after a truncated listing.
    ///
    /// Default: 500 ms.
    pub relist_delay_ms: u32,

    /// Messages still waiting for a contact are deleted at startup once
    /// they are older than this.
    ///
    /// Default: 15 days.
    pub awaiting_contact_retention_days: u32,
}

impl Default for DownloadMessagesConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            relist_delay_ms: 500,
            awaiting_contact_retention_days: 15,
        }
    }
}

impl ModConfig for DownloadMessagesConfig {}

/// Why a listing was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadMessagesCancelReason {
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The owned identity no longer exists.
    IdentityNotFound,
    /// The identity is inactive.
    IdentityInactive,
    /// The server does not know this device.
    DeviceNotRegistered,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for DownloadMessagesCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::IdentityInactive => Self::IdentityInactive,
            ServerError::DeviceNotRegistered => Self::DeviceNotRegistered,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> DownloadMessagesCancelReason {
    tracing::warn!(?err, "store error");
    DownloadMessagesCancelReason::StoreError
}

#[derive(Debug, Clone)]
enum Task {
    List { device_uid: DeviceUid },
    ProcessPushed { message: ListedMessage },
}

#[derive(Debug)]
pub(crate) struct DownloadMessagesOp {
    ctx: Context,
    identity: OwnedIdentity,
    task: Task,
}

impl DownloadMessagesOp {
    async fn save_and_process(
        &self,
        messages: Vec<ListedMessage>,
    ) -> Result<(), DownloadMessagesCancelReason> {
        let new = self
            .ctx
            .store
            .save_listed_messages(self.identity.clone(), messages)
            .await
            .map_err(store_err)?;

        tracing::debug!(
            identity = ?self.identity,
            new = new.len(),
            "saved listed messages"
        );

        for uid in new {
            // a failure here is retried by the startup rescan
            if let Err(err) = self
                .ctx
                .channel
                .process_message(self.identity.clone(), uid.clone())
                .await
            {
                tracing::warn!(?uid, ?err, "message processing failed");
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        device_uid: &DeviceUid,
    ) -> Result<bool, DownloadMessagesCancelReason> {
        let store = &self.ctx.store;
        let identity = self.identity.clone();

        let info = store
            .get_owned_identity(identity.clone())
            .await
            .map_err(store_err)?
            .ok_or(DownloadMessagesCancelReason::IdentityNotFound)?;
        if !info.active {
            return Err(DownloadMessagesCancelReason::IdentityInactive);
        }

        let token = store
            .get_server_session_token(identity.clone())
            .await
            .map_err(store_err)?
            .ok_or(DownloadMessagesCancelReason::InvalidServerSession(None))?;

        let listing = match self
            .ctx
            .server
            .list_messages(identity.clone(), token.clone(), device_uid.clone())
            .await
        {
            Ok(listing) => listing,
            Err(ServerError::InvalidSession) => {
                return Err(
                    DownloadMessagesCancelReason::InvalidServerSession(Some(
                        token,
                    )),
                )
            }
            Err(err) => return Err(err.into()),
        };

        let truncated = listing.truncated;
        self.save_and_process(listing.messages).await?;

        if !truncated {
            store
                .mark_listing_up_to_date(identity)
                .await
                .map_err(store_err)?;
        }

        Ok(truncated)
    }
}

impl Operation for DownloadMessagesOp {
    /// True if the listing was truncated.
    type Output = bool;
    type Reason = DownloadMessagesCancelReason;

    fn key(&self) -> OperationKey {
        match &self.task {
            Task::List { device_uid } => OperationKey::from_parts([
                "list".to_string(),
                self.identity.to_string(),
                device_uid.to_string(),
            ]),
            Task::ProcessPushed { message } => OperationKey::from_parts([
                "pushed".to_string(),
                self.identity.to_string(),
                message.uid.to_string(),
            ]),
        }
    }

    fn execute(
        &self,
    ) -> BoxFut<'_, Result<bool, DownloadMessagesCancelReason>> {
        Box::pin(async move {
            match &self.task {
                Task::List { device_uid } => self.list(device_uid).await,
                Task::ProcessPushed { message } => {
                    self.save_and_process(vec![message.clone()]).await?;
                    Ok(false)
                }
            }
        })
    }
}

struct Inner {
    ctx: Context,
    config: DownloadMessagesConfig,
    queue: OperationQueue<DownloadMessagesOp>,
    backoff: BackoffScheduler,
    session: DynCreateServerSessionDelegate,
    push: DynRegisterPushDelegate,
    delete: DynDeleteMessageDelegate,
    awaiting_session: WaitingSet<OwnedIdentity, DeviceUid>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadMessagesInner")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Inner {
    fn queue_list(
        &self,
        identity: OwnedIdentity,
        device_uid: DeviceUid,
    ) -> bool {
        self.queue.queue(DownloadMessagesOp {
            ctx: self.ctx.clone(),
            identity,
            task: Task::List { device_uid },
        })
    }

    fn queue_pushed(&self, identity: OwnedIdentity, message: ListedMessage) {
        self.queue.queue(DownloadMessagesOp {
            ctx: self.ctx.clone(),
            identity,
            task: Task::ProcessPushed { message },
        });
    }

    /// List the current device of an identity, looked up in the store.
    fn spawn_list_current_device(self: &Arc<Self>, identity: OwnedIdentity) {
        let inner = self.clone();
        tokio::task::spawn(async move {
            match inner.ctx.store.get_owned_identity(identity.clone()).await {
                Ok(Some(info)) => {
                    inner.queue_list(info.identity, info.device_uid);
                }
                Ok(None) => {
                    tracing::debug!(
                        ?identity,
                        "poll requested for unknown identity"
                    )
                }
                Err(err) => tracing::warn!(?err, "cannot read owned identity"),
            }
        });
    }

    fn poll_completed(&self, identity: OwnedIdentity, success: bool) {
        self.ctx
            .bus
            .post(Notification::ServerPollCompleted { identity, success });
    }
}

/// Lists inboxes and hands new messages to the channel layer.
#[derive(Debug)]
pub struct DownloadMessagesCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl DownloadMessagesCoordinator {
    /// Construct a new DownloadMessagesCoordinator.
    pub fn create(
        ctx: Context,
        config: DownloadMessagesConfig,
        backoff: BackoffConfig,
        session: DynCreateServerSessionDelegate,
        push: DynRegisterPushDelegate,
        delete: DynDeleteMessageDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new(
            "download-messages",
            config.worker_count as usize,
            true,
        );
        let inner = Arc::new(Inner {
            ctx,
            config,
            queue,
            backoff: BackoffScheduler::new("download-messages", backoff),
            session,
            push,
            delete,
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "download-messages-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let bus = inner.ctx.bus.clone();
        let _subscriptions = vec![
            bus.subscribe(NotificationKind::ServerSessionCreated, {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerSessionCreated { identity } = n
                    {
                        for device_uid in inner.awaiting_session.take(identity)
                        {
                            inner.queue_list(identity.clone(), device_uid);
                        }
                    }
                }
            }),
            bus.subscribe(NotificationKind::ServerPollRequested, {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerPollRequested { identity } = n {
                        inner.spawn_list_current_device(identity.clone());
                    }
                }
            }),
            bus.subscribe(NotificationKind::PushNotificationRegistered, {
                let inner = inner.clone();
                move |n| {
                    if let Notification::PushNotificationRegistered {
                        identity,
                    } = n
                    {
                        inner.spawn_list_current_device(identity.clone());
                    }
                }
            }),
        ];

        Arc::new(Self {
            inner,
            _outcome_task,
            _subscriptions,
        })
    }

    /// Resume what a previous run left unfinished, then list the inbox of
    /// every active identity.
    pub async fn rescan_on_startup(&self) -> NfResult<()> {
        let inner = &self.inner;
        let store = &inner.ctx.store;
        let retention = Duration::from_secs(
            inner.config.awaiting_contact_retention_days as u64 * 24 * 60 * 60,
        );

        let mut processed = 0;
        let mut expired = 0;
        for message in store.get_inbox_messages().await? {
            let InboxMessage {
                identity,
                uid,
                status,
                server_timestamp,
                awaiting_contact,
                ..
            } = message;
            match status {
                InboxMessageStatus::Unprocessed if awaiting_contact => {
                    if server_timestamp.is_older_than(retention) {
                        expired += 1;
                        inner.delete.delete_message(identity, uid, false);
                    }
                }
                InboxMessageStatus::Unprocessed => {
                    processed += 1;
                    if let Err(err) = inner
                        .ctx
                        .channel
                        .process_message(identity, uid.clone())
                        .await
                    {
                        tracing::warn!(?uid, ?err, "message processing failed");
                    }
                }
                InboxMessageStatus::Decrypted => {
                    inner
                        .ctx
                        .bus
                        .post(Notification::InboxMessageDecrypted { identity, uid });
                }
                // picked up below once its attachments are resolved
                InboxMessageStatus::MarkedForDeletion => (),
            }
        }

        let ready = store.get_messages_ready_for_deletion().await?;
        let ready_count = ready.len();
        for (identity, uid) in ready {
            inner.delete.delete_message(identity, uid, false);
        }

        tracing::info!(
            processed,
            expired,
            ready_for_deletion = ready_count,
            "inbox rescanned"
        );

        for info in store.get_owned_identities().await? {
            if info.active {
                inner.queue_list(info.identity, info.device_uid);
            }
        }

        Ok(())
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

impl DownloadListDelegate for DownloadMessagesCoordinator {
    fn download_messages_and_list_attachments(
        &self,
        identity: OwnedIdentity,
        device_uid: DeviceUid,
    ) {
        tracing::debug!(?identity, "list messages");
        self.inner.queue_list(identity, device_uid);
    }

    fn process_pushed_message(
        &self,
        identity: OwnedIdentity,
        message: ListedMessage,
    ) {
        tracing::debug!(?identity, uid = ?message.uid, "pushed message");
        self.inner.queue_pushed(identity, message);
    }
}

fn requeue(
    inner: &Arc<Inner>,
    op: &DownloadMessagesOp,
) -> impl FnOnce() + Send + 'static {
    let weak = Arc::downgrade(inner);
    let identity = op.identity.clone();
    let task = op.task.clone();
    move || {
        if let Some(inner) = weak.upgrade() {
            inner.queue.queue(DownloadMessagesOp {
                ctx: inner.ctx.clone(),
                identity,
                task,
            });
        }
    }
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<DownloadMessagesOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let is_list = matches!(op.task, Task::List { .. });
        match outcome {
            Outcome::Finished(truncated) => {
                inner.backoff.clear_failed_count(&key);
                if truncated {
                    inner.backoff.schedule_with_initial_delay(
                        key,
                        "relist",
                        Duration::from_millis(
                            inner.config.relist_delay_ms as u64,
                        ),
                        requeue(&inner, &op),
                    );
                } else if is_list {
                    inner.poll_completed(identity, true);
                }
            }
            Outcome::Cancelled(Some(
                DownloadMessagesCancelReason::InvalidServerSession(token),
            )) => {
                if let Task::List { device_uid } = &op.task {
                    inner
                        .awaiting_session
                        .park(identity.clone(), device_uid.clone());
                    inner.session.create_server_session(identity, token);
                }
            }
            Outcome::Cancelled(Some(
                DownloadMessagesCancelReason::DeviceNotRegistered,
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(
                    ?identity,
                    "device not registered, re-registering"
                );
                inner.push.reregister_push_notification(identity.clone());
                inner.poll_completed(identity, false);
            }
            Outcome::Cancelled(Some(
                reason @ (DownloadMessagesCancelReason::IdentityInactive
                | DownloadMessagesCancelReason::IdentityNotFound),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(?identity, ?reason, "not listing");
            }
            Outcome::Cancelled(
                reason @ (Some(
                    DownloadMessagesCancelReason::NetworkError
                    | DownloadMessagesCancelReason::ServerError(_)
                    | DownloadMessagesCancelReason::StoreError,
                )
                | None),
            ) => {
                let delay =
                    inner.backoff.schedule(key, "list", requeue(&inner, &op));
                tracing::warn!(
                    ?identity,
                    ?reason,
                    ?delay,
                    "listing failed, will retry"
                );
                if is_list {
                    inner.poll_completed(identity, false);
                }
            }
        }
    }
}
