//! Attachment downloads.
//!
//! Downloads run in one of two independent [PriorityOperationQueue]s,
//! selected by [PriorityCategory]. A more urgent request preempts the least
//! urgent executing download of its category once all slots are busy. The
//! preempted download is re-queued right away at its own priority.
//!
//! A download that cannot proceed is parked until the event that unblocks
//! it: fresh signed urls ([Notification::SignedUrlRefreshed]) or the
//! reactivation of its identity
//! ([Notification::OwnedIdentityActiveStatusChanged]). Content errors are
//! terminal: the attachment is marked for deletion and
//! [Notification::AttachmentDownloadFailed] is posted.

use crate::context::Context;
use crate::framework::*;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, server::*, *,
};
use std::sync::Arc;

/// Module name of the [DownloadAttachmentConfig].
pub const MOD_NAME: &str = "DownloadAttachment";

/// Independent priority spaces of attachment downloads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PriorityCategory {
    /// Small attachments, ordered by a caller-provided weight.
    Weight,
    /// Large attachments, ordered by a timestamp.
    Timestamp,
}

/// Configuration parameters for [DownloadAttachmentCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadAttachmentConfig {
    /// Concurrent downloads of the weight category.
    ///
    /// Default: 4.
    pub weight_worker_count: u32,

    /// Concurrent downloads of the timestamp category.
    ///
    /// Default: 4.
    pub timestamp_worker_count: u32,

    /// Urgency of weight priorities.
    ///
    /// Default: lower is more urgent.
    pub weight_order: PriorityOrder,

    /// Urgency of timestamp priorities.
    ///
    /// Default: lower is more urgent.
    pub timestamp_order: PriorityOrder,

    /// How many times one download may be preempted before it becomes
    /// non-preemptible until it completes.
    ///
    /// Default: 3.
    pub max_preemptions: u32,
}

impl Default for DownloadAttachmentConfig {
    fn default() -> Self {
        Self {
            weight_worker_count: 4,
            timestamp_worker_count: 4,
            weight_order: PriorityOrder::LowerIsMoreUrgent,
            timestamp_order: PriorityOrder::LowerIsMoreUrgent,
            max_preemptions: 3,
        }
    }
}

impl ModConfig for DownloadAttachmentConfig {}

/// Why an attachment download was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadAttachmentCancelReason {
    /// The attachment does not exist locally.
    AttachmentNotFound,
    /// The attachment was already marked for deletion.
    MarkedForDeletion,
    /// The application did not ask for this attachment.
    FetchNotRequested,
    /// Every chunk was already received.
    AlreadyDownloaded,
    /// The owning identity is inactive.
    IdentityIsInactive,
    /// The signed urls are missing or expired.
    InvalidSignedUrl,
    /// A more urgent download took the slot.
    Preempted,
    /// The application paused the download.
    Paused,
    /// A chunk could not be decrypted.
    DecryptionError,
    /// A chunk was not what was expected.
    InvalidChunk,
    /// The sender cancelled the upload.
    DeletedFromServer,
    /// A decrypted chunk could not be written.
    CannotWriteFile,
    /// The server could not be reached.
    NetworkError,
    /// The attachment is not uploaded completely yet.
    NotYetAvailable,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for DownloadAttachmentCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::SignedUrlExpired | ServerError::NotFound => {
                Self::InvalidSignedUrl
            }
            ServerError::Deleted => Self::DeletedFromServer,
            ServerError::NotYetAvailable => Self::NotYetAvailable,
            ServerError::Malformed(_) => Self::InvalidChunk,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> DownloadAttachmentCancelReason {
    tracing::warn!(?err, "store error");
    DownloadAttachmentCancelReason::StoreError
}

fn attachment_key(
    identity: &OwnedIdentity,
    uid: &MessageUid,
    number: u32,
) -> OperationKey {
    OperationKey::from_parts([
        identity.to_string(),
        uid.to_string(),
        number.to_string(),
    ])
}

#[derive(Debug, Clone)]
pub(crate) struct DownloadAttachmentOp {
    ctx: Context,
    identity: OwnedIdentity,
    uid: MessageUid,
    number: u32,
    category: PriorityCategory,
    priority: i64,
}

impl Operation for DownloadAttachmentOp {
    type Output = ();
    type Reason = DownloadAttachmentCancelReason;

    fn key(&self) -> OperationKey {
        attachment_key(&self.identity, &self.uid, self.number)
    }

    fn execute(
        &self,
    ) -> BoxFut<'_, Result<(), DownloadAttachmentCancelReason>> {
        use DownloadAttachmentCancelReason as R;
        Box::pin(async move {
            let store = &self.ctx.store;

            let att = store
                .get_inbox_attachment(
                    self.identity.clone(),
                    self.uid.clone(),
                    self.number,
                )
                .await
                .map_err(store_err)?
                .ok_or(R::AttachmentNotFound)?;
            if att.marked_for_deletion {
                return Err(R::MarkedForDeletion);
            }
            if !att.download_requested {
                return Err(R::FetchNotRequested);
            }
            if att.is_downloaded() {
                return Err(R::AlreadyDownloaded);
            }

            let info = store
                .get_owned_identity(self.identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(R::AttachmentNotFound)?;
            if !info.active {
                return Err(R::IdentityIsInactive);
            }

            if att.chunk_download_urls.is_empty() {
                return Err(R::InvalidSignedUrl);
            }

            let count = att.chunk_count();
            for index in att.received_chunk_count..count {
                let url = att.chunk_download_urls[index as usize].clone();
                let encrypted = self.ctx.server.download_chunk(url).await?;
                if encrypted.is_empty() {
                    return Err(R::InvalidChunk);
                }

                let data = self
                    .ctx
                    .crypto
                    .decrypt_attachment_chunk(
                        self.identity.clone(),
                        self.uid.clone(),
                        self.number,
                        index,
                        encrypted,
                    )
                    .map_err(|err| {
                        tracing::warn!(?err, index, "cannot decrypt chunk");
                        R::DecryptionError
                    })?;

                let received = store
                    .write_attachment_chunk(
                        self.identity.clone(),
                        self.uid.clone(),
                        self.number,
                        index,
                        data,
                    )
                    .await
                    .map_err(|err| {
                        tracing::warn!(?err, index, "cannot write chunk");
                        R::CannotWriteFile
                    })?;

                self.ctx
                    .bus
                    .post(Notification::AttachmentDownloadProgress {
                        identity: self.identity.clone(),
                        uid: self.uid.clone(),
                        number: self.number,
                        progress: received as f32 / count as f32,
                    });
            }

            Ok(())
        })
    }
}

impl PrioritizedOperation for DownloadAttachmentOp {
    fn priority(&self) -> i64 {
        self.priority
    }

    fn preempted_reason() -> DownloadAttachmentCancelReason {
        DownloadAttachmentCancelReason::Preempted
    }
}

type AttachmentId = (OwnedIdentity, MessageUid, u32);

struct Inner {
    ctx: Context,
    weight: PriorityOperationQueue<DownloadAttachmentOp>,
    timestamp: PriorityOperationQueue<DownloadAttachmentOp>,
    backoff: BackoffScheduler,
    refresh: DynRefreshSignedUrlDelegate,
    delete: DynDeleteMessageDelegate,
    awaiting_url: WaitingSet<AttachmentId, DownloadAttachmentOp>,
    awaiting_active: WaitingSet<OwnedIdentity, DownloadAttachmentOp>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadAttachmentInner")
            .field("weight", &self.weight)
            .field("timestamp", &self.timestamp)
            .field("awaiting_url", &self.awaiting_url.len())
            .field("awaiting_active", &self.awaiting_active.len())
            .finish()
    }
}

impl Inner {
    fn queue_of(
        &self,
        category: PriorityCategory,
    ) -> &PriorityOperationQueue<DownloadAttachmentOp> {
        match category {
            PriorityCategory::Weight => &self.weight,
            PriorityCategory::Timestamp => &self.timestamp,
        }
    }

    /// Queue a download unless the attachment is already in flight in
    /// either category.
    fn queue_download(&self, op: DownloadAttachmentOp) -> bool {
        let other = match op.category {
            PriorityCategory::Weight => PriorityCategory::Timestamp,
            PriorityCategory::Timestamp => PriorityCategory::Weight,
        };
        if self.queue_of(other).state_of(&op.key()).is_some() {
            tracing::debug!(
                key = %op.key(),
                "already downloading in the other category"
            );
            return false;
        }
        self.queue_of(op.category).queue(op)
    }

    async fn fail(
        &self,
        op: &DownloadAttachmentOp,
        failure: AttachmentFailure,
    ) {
        let identity = op.identity.clone();
        let uid = op.uid.clone();
        match self
            .ctx
            .store
            .mark_attachment_for_deletion(identity.clone(), uid.clone(), op.number)
            .await
        {
            Ok(true) => {
                self.delete
                    .delete_message(identity.clone(), uid.clone(), false)
            }
            Ok(false) => (),
            Err(err) => {
                tracing::warn!(?err, "cannot mark attachment for deletion")
            }
        }
        self.ctx.bus.post(Notification::AttachmentDownloadFailed {
            identity,
            uid,
            number: op.number,
            failure,
        });
    }
}

/// Downloads attachment chunks under two priority regimes.
#[derive(Debug)]
pub struct DownloadAttachmentCoordinator {
    inner: Arc<Inner>,
    _weight_outcomes: DropAbortHandle,
    _timestamp_outcomes: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl DownloadAttachmentCoordinator {
    /// Construct a new DownloadAttachmentCoordinator.
    pub fn create(
        ctx: Context,
        config: DownloadAttachmentConfig,
        backoff: BackoffConfig,
        refresh: DynRefreshSignedUrlDelegate,
        delete: DynDeleteMessageDelegate,
    ) -> Arc<Self> {
        let (weight, weight_outcomes) = PriorityOperationQueue::new(
            "download-attachment-weight",
            config.weight_worker_count as usize,
            config.weight_order,
            config.max_preemptions,
        );
        let (timestamp, timestamp_outcomes) = PriorityOperationQueue::new(
            "download-attachment-timestamp",
            config.timestamp_worker_count as usize,
            config.timestamp_order,
            config.max_preemptions,
        );
        let inner = Arc::new(Inner {
            ctx,
            weight,
            timestamp,
            backoff: BackoffScheduler::new("download-attachment", backoff),
            refresh,
            delete,
            awaiting_url: WaitingSet::default(),
            awaiting_active: WaitingSet::default(),
        });

        let _weight_outcomes = DropAbortHandle::spawn(
            "download-attachment-weight-outcomes",
            outcome_task(inner.clone(), weight_outcomes),
        );
        let _timestamp_outcomes = DropAbortHandle::spawn(
            "download-attachment-timestamp-outcomes",
            outcome_task(inner.clone(), timestamp_outcomes),
        );

        let url_refreshed = inner.ctx.bus.subscribe(
            NotificationKind::SignedUrlRefreshed,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::SignedUrlRefreshed {
                        identity,
                        uid,
                        number,
                    } = n
                    {
                        let id = (identity.clone(), uid.clone(), *number);
                        for op in inner.awaiting_url.take(&id) {
                            inner.queue_download(op);
                        }
                    }
                }
            },
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
                        for op in inner.awaiting_active.take(identity) {
                            inner.queue_download(op);
                        }
                    }
                }
            },
        );

        // the refresh may find the message deleted, nothing to resume then
        let failed = inner.ctx.bus.subscribe(
            NotificationKind::AttachmentDownloadFailed,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::AttachmentDownloadFailed {
                        identity,
                        uid,
                        number,
                        ..
                    } = n
                    {
                        inner.awaiting_url.take(&(
                            identity.clone(),
                            uid.clone(),
                            *number,
                        ));
                    }
                }
            },
        );

        Arc::new(Self {
            inner,
            _weight_outcomes,
            _timestamp_outcomes,
            _subscriptions: vec![url_refreshed, activated, failed],
        })
    }

    /// Mark an attachment as requested and queue its download.
    pub async fn request_download(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
        category: PriorityCategory,
        priority: i64,
    ) -> NfResult<()> {
        self.inner
            .ctx
            .store
            .set_attachment_download_requested(
                identity.clone(),
                uid.clone(),
                number,
                true,
            )
            .await?;
        tracing::debug!(
            ?identity,
            ?uid,
            number,
            ?category,
            priority,
            "download requested"
        );
        self.inner.queue_download(DownloadAttachmentOp {
            ctx: self.inner.ctx.clone(),
            identity,
            uid,
            number,
            category,
            priority,
        });
        Ok(())
    }

    /// Stop downloading an attachment. Chunks already received are kept,
    /// a later [Self::request_download] resumes after them.
    pub async fn pause_attachment_download(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> NfResult<()> {
        self.inner
            .ctx
            .store
            .set_attachment_download_requested(
                identity.clone(),
                uid.clone(),
                number,
                false,
            )
            .await?;

        let key = attachment_key(&identity, &uid, number);
        let weight = self
            .inner
            .weight
            .cancel(&key, DownloadAttachmentCancelReason::Paused);
        let timestamp = self
            .inner
            .timestamp
            .cancel(&key, DownloadAttachmentCancelReason::Paused);

        // a cancelled entry announces the pause from the outcome task, a
        // run already stopping for a preemption never will
        if !weight && !timestamp {
            self.inner.ctx.bus.post(Notification::AttachmentDownloadPaused {
                identity,
                uid,
                number,
            });
        }
        Ok(())
    }

    /// Queue every requested attachment that is not downloaded yet, oldest
    /// first.
    pub async fn resume_downloads_on_startup(&self) -> NfResult<()> {
        let attachments =
            self.inner.ctx.store.get_attachments_to_download().await?;
        tracing::info!(
            count = attachments.len(),
            "resuming attachment downloads"
        );
        for att in attachments {
            self.inner.queue_download(DownloadAttachmentOp {
                ctx: self.inner.ctx.clone(),
                identity: att.identity,
                uid: att.uid,
                number: att.number,
                category: PriorityCategory::Timestamp,
                priority: att.server_timestamp.as_micros(),
            });
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
    mut outcomes: OutcomeRecv<DownloadAttachmentOp>,
) {
    use DownloadAttachmentCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        let uid = op.uid.clone();
        let number = op.number;
        match outcome {
            Outcome::Finished(()) => {
                inner.backoff.clear_failed_count(&key);
                tracing::info!(
                    ?identity,
                    ?uid,
                    number,
                    "attachment downloaded"
                );
                inner.ctx.bus.post(Notification::AttachmentDownloadFinished {
                    identity,
                    uid,
                    number,
                });
            }
            Outcome::Cancelled(Some(R::Preempted)) => {
                tracing::debug!(%key, "preempted, re-queuing");
                inner.queue_download(op.as_ref().clone());
            }
            Outcome::Cancelled(Some(R::InvalidSignedUrl)) => {
                inner.awaiting_url.park(
                    (identity.clone(), uid.clone(), number),
                    op.as_ref().clone(),
                );
                inner.refresh.refresh_signed_urls(identity, uid, number);
            }
            Outcome::Cancelled(Some(R::IdentityIsInactive)) => {
                tracing::debug!(
                    ?identity,
                    "waiting for identity to be active"
                );
                inner
                    .awaiting_active
                    .park(identity.clone(), op.as_ref().clone());
                // it may have been activated before the park
                if inner.ctx.is_active(&identity).await {
                    for op in inner.awaiting_active.take(&identity) {
                        inner.queue_download(op);
                    }
                }
            }
            Outcome::Cancelled(Some(R::Paused)) => {
                inner.backoff.clear_failed_count(&key);
                inner.ctx.bus.post(Notification::AttachmentDownloadPaused {
                    identity,
                    uid,
                    number,
                });
            }
            Outcome::Cancelled(Some(
                reason @ (R::DecryptionError
                | R::InvalidChunk
                | R::DeletedFromServer
                | R::CannotWriteFile),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(
                    ?identity,
                    ?uid,
                    number,
                    ?reason,
                    "attachment download failed"
                );
                let failure = match reason {
                    R::DecryptionError => AttachmentFailure::DecryptionError,
                    R::DeletedFromServer => {
                        AttachmentFailure::DeletedFromServer
                    }
                    R::CannotWriteFile => AttachmentFailure::CannotWriteFile,
                    _ => AttachmentFailure::InvalidChunk,
                };
                inner.fail(&op, failure).await;
            }
            Outcome::Cancelled(Some(
                reason @ (R::AttachmentNotFound
                | R::MarkedForDeletion
                | R::FetchNotRequested
                | R::AlreadyDownloaded),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(%key, ?reason, "dropping attachment download");
            }
            Outcome::Cancelled(
                reason @ (Some(
                    R::NetworkError
                    | R::NotYetAvailable
                    | R::ServerError(_)
                    | R::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "download-attachment", {
                    let op = op.as_ref().clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_download(op);
                        }
                    }
                });
                tracing::warn!(
                    ?identity,
                    ?uid,
                    number,
                    ?reason,
                    ?delay,
                    "attachment download failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
