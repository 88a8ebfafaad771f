//! Registration of the current device for push delivery.
//!
//! The configuration to register is always read from storage when the
//! operation executes, so a re-registration after a server complaint uses
//! whatever was saved last.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{delegate::*, notification::*, record::*, server::*, *};
use std::sync::Arc;

/// Why a push registration was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum PushRegistrationCancelReason {
    /// No session, or the session was refused. Holds the refused token.
    InvalidServerSession(Option<Bytes>),
    /// The owned identity no longer exists.
    IdentityNotFound,
    /// Nothing was saved to register.
    ConfigurationNotFound,
    /// Another device holds the registration of this identity.
    AnotherDeviceIsAlreadyRegistered,
    /// The server refused the configuration.
    InvalidConfiguration,
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// Storage failed.
    StoreError,
}

impl From<ServerError> for PushRegistrationCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::AnotherDeviceIsAlreadyRegistered => {
                Self::AnotherDeviceIsAlreadyRegistered
            }
            ServerError::Malformed(_) => Self::InvalidConfiguration,
            oth => Self::ServerError(oth),
        }
    }
}

fn store_err(err: NfError) -> PushRegistrationCancelReason {
    tracing::warn!(?err, "store error");
    PushRegistrationCancelReason::StoreError
}

#[derive(Debug)]
pub(crate) struct RegisterPushOp {
    ctx: Context,
    identity: OwnedIdentity,
}

impl Operation for RegisterPushOp {
    type Output = PushNotificationConfiguration;
    type Reason = PushRegistrationCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([self.identity.to_string()])
    }

    fn execute(
        &self,
    ) -> BoxFut<
        '_,
        Result<PushNotificationConfiguration, PushRegistrationCancelReason>,
    > {
        Box::pin(async move {
            let store = &self.ctx.store;
            let identity = self.identity.clone();

            store
                .get_owned_identity(identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(PushRegistrationCancelReason::IdentityNotFound)?;

            let config = store
                .get_push_configuration(identity.clone())
                .await
                .map_err(store_err)?
                .ok_or(PushRegistrationCancelReason::ConfigurationNotFound)?;

            // inactive identities register too: that is how they reactivate
            let token = store
                .get_server_session_token(identity)
                .await
                .map_err(store_err)?
                .ok_or(PushRegistrationCancelReason::InvalidServerSession(
                    None,
                ))?;

            match self
                .ctx
                .server
                .register_push(token.clone(), config.clone())
                .await
            {
                Ok(()) => Ok(config),
                Err(ServerError::InvalidSession) => Err(
                    PushRegistrationCancelReason::InvalidServerSession(Some(
                        token,
                    )),
                ),
                Err(err) => Err(err.into()),
            }
        })
    }
}

struct Inner {
    ctx: Context,
    queue: OperationQueue<RegisterPushOp>,
    backoff: BackoffScheduler,
    session: DynCreateServerSessionDelegate,
    awaiting_session: WaitingSet<OwnedIdentity, ()>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRegistrationInner")
            .field("queue", &self.queue)
            .finish()
    }
}

impl Inner {
    fn queue_register(&self, identity: OwnedIdentity) -> bool {
        self.queue.queue(RegisterPushOp {
            ctx: self.ctx.clone(),
            identity,
        })
    }

    async fn set_active(&self, identity: &OwnedIdentity, active: bool) {
        let was_active = match self
            .ctx
            .store
            .get_owned_identity(identity.clone())
            .await
        {
            Ok(Some(info)) => info.active,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(?err, "cannot read owned identity");
                return;
            }
        };
        if was_active == active {
            return;
        }
        if let Err(err) = self
            .ctx
            .store
            .set_owned_identity_active(identity.clone(), active)
            .await
        {
            tracing::warn!(?err, "cannot change identity active status");
            return;
        }
        tracing::info!(
            ?identity,
            active,
            "owned identity active status changed"
        );
        self.ctx
            .bus
            .post(Notification::OwnedIdentityActiveStatusChanged {
                identity: identity.clone(),
                active,
            });
    }
}

/// Registers devices for push delivery.
#[derive(Debug)]
pub struct PushRegistrationCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl PushRegistrationCoordinator {
    /// Construct a new PushRegistrationCoordinator.
    pub fn create(
        ctx: Context,
        backoff: BackoffConfig,
        session: DynCreateServerSessionDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) =
            OperationQueue::new("push-registration", 1, true);
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("push-registration", backoff),
            session,
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "push-registration-outcomes",
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
                            inner.queue_register(identity.clone());
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

    /// Save a push configuration and register it.
    pub async fn register_push_notification(
        &self,
        config: PushNotificationConfiguration,
    ) -> NfResult<()> {
        let identity = config.identity.clone();
        self.inner.ctx.store.save_push_configuration(config).await?;
        self.inner.queue_register(identity);
        Ok(())
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

impl RegisterPushDelegate for PushRegistrationCoordinator {
    fn reregister_push_notification(&self, identity: OwnedIdentity) {
        tracing::debug!(?identity, "re-register push notification");
        self.inner.queue_register(identity);
    }
}

async fn registered(inner: &Inner, config: PushNotificationConfiguration) {
    let identity = config.identity.clone();
    if config.reactivate_current_device {
        inner.set_active(&identity, true).await;
        if let Err(err) = inner
            .ctx
            .protocol_starter
            .start_owned_device_discovery(identity.clone())
        {
            tracing::warn!(?err, "cannot start owned device discovery");
        }
        // reactivate once only
        let config = PushNotificationConfiguration {
            reactivate_current_device: false,
            ..config
        };
        if let Err(err) = inner.ctx.store.save_push_configuration(config).await
        {
            tracing::warn!(?err, "cannot save push configuration");
        }
    }
    tracing::info!(?identity, "push notification registered");
    inner
        .ctx
        .bus
        .post(Notification::PushNotificationRegistered { identity });
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<RegisterPushOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let identity = op.identity.clone();
        match outcome {
            Outcome::Finished(config) => {
                inner.backoff.clear_failed_count(&key);
                registered(&inner, config).await;
            }
            Outcome::Cancelled(Some(
                PushRegistrationCancelReason::InvalidServerSession(token),
            )) => {
                inner.awaiting_session.park(identity.clone(), ());
                inner.session.create_server_session(identity, token);
            }
            Outcome::Cancelled(Some(
                reason @ (PushRegistrationCancelReason::IdentityNotFound
                | PushRegistrationCancelReason::ConfigurationNotFound),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(
                    ?identity,
                    ?reason,
                    "dropping push registration"
                );
            }
            Outcome::Cancelled(Some(
                PushRegistrationCancelReason::AnotherDeviceIsAlreadyRegistered,
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(?identity, "another device is registered");
                inner.set_active(&identity, false).await;
                inner.ctx.bus.post(Notification::PushRegisterFailed {
                    identity,
                    failure: PushRegisterFailure::AnotherDeviceIsAlreadyRegistered,
                });
            }
            Outcome::Cancelled(Some(
                PushRegistrationCancelReason::InvalidConfiguration,
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::warn!(?identity, "push configuration refused");
                inner.ctx.bus.post(Notification::PushRegisterFailed {
                    identity,
                    failure: PushRegisterFailure::InvalidConfiguration,
                });
            }
            Outcome::Cancelled(
                reason @ (Some(
                    PushRegistrationCancelReason::NetworkError
                    | PushRegistrationCancelReason::ServerError(_)
                    | PushRegistrationCancelReason::StoreError,
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "register-push", {
                    let identity = identity.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_register(identity);
                        }
                    }
                });
                tracing::warn!(
                    ?identity,
                    ?reason,
                    ?delay,
                    "push registration failed, will retry"
                );
            }
        }
    }
}
