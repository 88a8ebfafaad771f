//! The fetch manager: every coordinator of one engine instance, wired
//! together on a shared bus.

use crate::context::Context;
use crate::coordinators::*;
use crate::framework::*;
use netfetch_api::{
    builder::Builder, config::Config, delegate::*, notification::*, *,
};
use std::sync::Arc;

/// Module name of the [BackoffConfig] shared by every coordinator.
pub const BACKOFF_MOD_NAME: &str = "Backoff";

/// Add the default config of every module to `config`.
pub fn set_default_config(config: &mut Config) -> NfResult<()> {
    config.add_default_module_config::<BackoffConfig>(
        BACKOFF_MOD_NAME.into(),
    )?;
    config.add_default_module_config::<server_session::ServerSessionConfig>(
        server_session::MOD_NAME.into(),
    )?;
    config.add_default_module_config::<well_known::WellKnownConfig>(
        well_known::MOD_NAME.into(),
    )?;
    config.add_default_module_config::<delete::DeleteConfig>(
        delete::MOD_NAME.into(),
    )?;
    config
        .add_default_module_config::<signed_url_refresh::SignedUrlRefreshConfig>(
            signed_url_refresh::MOD_NAME.into(),
        )?;
    config
        .add_default_module_config::<download_messages::DownloadMessagesConfig>(
            download_messages::MOD_NAME.into(),
        )?;
    config.add_default_module_config::<
        download_attachment::DownloadAttachmentConfig,
    >(download_attachment::MOD_NAME.into())?;
    config.add_default_module_config::<web_socket::WebSocketConfig>(
        web_socket::MOD_NAME.into(),
    )?;
    config.add_default_module_config::<server_query::ServerQueryConfig>(
        server_query::MOD_NAME.into(),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
struct Coordinators {
    session: Arc<server_session::ServerSessionCoordinator>,
    well_known: Arc<well_known::WellKnownCoordinator>,
    delete: Arc<delete::DeleteCoordinator>,
    signed_url_refresh: Arc<signed_url_refresh::SignedUrlRefreshCoordinator>,
    push_registration: Arc<push_registration::PushRegistrationCoordinator>,
    download_messages: Arc<download_messages::DownloadMessagesCoordinator>,
    download_attachment:
        Arc<download_attachment::DownloadAttachmentCoordinator>,
    extended_payload: Arc<extended_payload::ExtendedPayloadCoordinator>,
    web_socket: Arc<web_socket::WebSocketCoordinator>,
    server_query: Arc<server_query::ServerQueryCoordinator>,
    user_data: Arc<user_data::UserDataCoordinator>,
    turn_credentials: Arc<turn_credentials::TurnCredentialsCoordinator>,
    free_trial: Arc<free_trial::FreeTrialCoordinator>,
}

impl Coordinators {
    fn retry_all_scheduled(&self) {
        tracing::info!("retrying every scheduled operation");
        self.session.retry_scheduled();
        self.well_known.retry_scheduled();
        self.delete.retry_scheduled();
        self.signed_url_refresh.retry_scheduled();
        self.push_registration.retry_scheduled();
        self.download_messages.retry_scheduled();
        self.download_attachment.retry_scheduled();
        self.extended_payload.retry_scheduled();
        self.web_socket.retry_scheduled();
        self.server_query.retry_scheduled();
        self.user_data.retry_scheduled();
        self.turn_credentials.retry_scheduled();
        self.free_trial.retry_scheduled();
    }
}

/// Every coordinator of one engine instance.
///
/// The coordinators reach each other only through the narrow delegates
/// and the bus. Dropping the manager stops every queue and task.
#[derive(Debug)]
pub struct FetchManager {
    bus: NotificationBus,
    c: Coordinators,
    _subscriptions: Vec<Subscription>,
}

impl FetchManager {
    /// Construct every coordinator from the config and delegates of a
    /// builder. Must be called within a tokio runtime.
    pub fn create(builder: &Builder) -> NfResult<Self> {
        let config = &builder.config;
        let backoff: BackoffConfig =
            config.get_module_config(BACKOFF_MOD_NAME)?;
        let bus = NotificationBus::create();
        let ctx = Context::from_builder(builder, bus.clone());

        let session = server_session::ServerSessionCoordinator::create(
            ctx.clone(),
            config.get_module_config(server_session::MOD_NAME)?,
            backoff.clone(),
        );
        let session_dyn: DynCreateServerSessionDelegate = session.clone();

        let well_known = well_known::WellKnownCoordinator::create(
            ctx.clone(),
            config.get_module_config(well_known::MOD_NAME)?,
            backoff.clone(),
        );
        let well_known_dyn: DynWellKnownCacheDelegate = well_known.clone();

        let delete = delete::DeleteCoordinator::create(
            ctx.clone(),
            config.get_module_config(delete::MOD_NAME)?,
            backoff.clone(),
            session_dyn.clone(),
        );
        let delete_dyn: DynDeleteMessageDelegate = delete.clone();

        let signed_url_refresh =
            signed_url_refresh::SignedUrlRefreshCoordinator::create(
                ctx.clone(),
                config.get_module_config(signed_url_refresh::MOD_NAME)?,
                backoff.clone(),
                session_dyn.clone(),
                delete_dyn.clone(),
            );

        let push_registration =
            push_registration::PushRegistrationCoordinator::create(
                ctx.clone(),
                backoff.clone(),
                session_dyn.clone(),
            );

        let download_messages =
            download_messages::DownloadMessagesCoordinator::create(
                ctx.clone(),
                config.get_module_config(download_messages::MOD_NAME)?,
                backoff.clone(),
                session_dyn.clone(),
                push_registration.clone(),
                delete_dyn.clone(),
            );

        let download_attachment =
            download_attachment::DownloadAttachmentCoordinator::create(
                ctx.clone(),
                config.get_module_config(download_attachment::MOD_NAME)?,
                backoff.clone(),
                signed_url_refresh.clone(),
                delete_dyn.clone(),
            );

        let extended_payload =
            extended_payload::ExtendedPayloadCoordinator::create(
                ctx.clone(),
                backoff.clone(),
                session_dyn.clone(),
            );

        let web_socket = web_socket::WebSocketCoordinator::create(
            ctx.clone(),
            config.get_module_config(web_socket::MOD_NAME)?,
            backoff.clone(),
            well_known_dyn.clone(),
            session_dyn.clone(),
            download_messages.clone(),
        );

        let server_query = server_query::ServerQueryCoordinator::create(
            ctx.clone(),
            config.get_module_config(server_query::MOD_NAME)?,
            backoff.clone(),
            well_known_dyn.clone(),
        );

        let user_data =
            user_data::UserDataCoordinator::create(ctx.clone(), backoff.clone());

        let turn_credentials =
            turn_credentials::TurnCredentialsCoordinator::create(
                ctx.clone(),
                backoff.clone(),
                well_known_dyn,
                session_dyn.clone(),
            );

        let free_trial =
            free_trial::FreeTrialCoordinator::create(ctx, backoff, session_dyn);

        let c = Coordinators {
            session,
            well_known,
            delete,
            signed_url_refresh,
            push_registration,
            download_messages,
            download_attachment,
            extended_payload,
            web_socket,
            server_query,
            user_data,
            turn_credentials,
            free_trial,
        };

        let connected = bus.subscribe(
            NotificationKind::WebSocketConnectionStateChanged,
            {
                let c = c.clone();
                move |n| {
                    if let Notification::WebSocketConnectionStateChanged {
                        state: WebSocketState::Connected,
                        ..
                    } = n
                    {
                        c.retry_all_scheduled();
                    }
                }
            },
        );

        Ok(Self {
            bus,
            c,
            _subscriptions: vec![connected],
        })
    }

    /// Resume the work a previous run left unfinished, then start listing
    /// and open the websockets.
    pub async fn start(&self) -> NfResult<()> {
        let c = &self.c;
        c.well_known.load_from_store_and_refresh().await?;
        c.download_messages.rescan_on_startup().await?;
        c.download_attachment.resume_downloads_on_startup().await?;
        c.extended_payload.resume_on_startup().await?;
        c.server_query.resume_on_startup().await?;
        c.user_data.resume_on_startup().await?;
        c.web_socket.connect_all().await?;
        tracing::info!("fetch manager started");
        Ok(())
    }

    /// Run every scheduled retry of every coordinator now, e.g. because
    /// the network came back.
    pub fn retry_all_scheduled(&self) {
        self.c.retry_all_scheduled();
    }

    /// The bus every coordinator posts to.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Server sessions.
    pub fn session(&self) -> &Arc<server_session::ServerSessionCoordinator> {
        &self.c.session
    }

    /// Well-known cache.
    pub fn well_known(&self) -> &Arc<well_known::WellKnownCoordinator> {
        &self.c.well_known
    }

    /// Server-side deletion.
    pub fn delete(&self) -> &Arc<delete::DeleteCoordinator> {
        &self.c.delete
    }

    /// Signed-url refresh.
    pub fn signed_url_refresh(
        &self,
    ) -> &Arc<signed_url_refresh::SignedUrlRefreshCoordinator> {
        &self.c.signed_url_refresh
    }

    /// Push registration.
    pub fn push_registration(
        &self,
    ) -> &Arc<push_registration::PushRegistrationCoordinator> {
        &self.c.push_registration
    }

    /// Inbox listing.
    pub fn download_messages(
        &self,
    ) -> &Arc<download_messages::DownloadMessagesCoordinator> {
        &self.c.download_messages
    }

    /// Attachment downloads.
    pub fn download_attachment(
        &self,
    ) -> &Arc<download_attachment::DownloadAttachmentCoordinator> {
        &self.c.download_attachment
    }

    /// Extended payloads.
    pub fn extended_payload(
        &self,
    ) -> &Arc<extended_payload::ExtendedPayloadCoordinator> {
        &self.c.extended_payload
    }

    /// Push websockets.
    pub fn web_socket(&self) -> &Arc<web_socket::WebSocketCoordinator> {
        &self.c.web_socket
    }

    /// Server queries and device transfer.
    pub fn server_query(&self) -> &Arc<server_query::ServerQueryCoordinator> {
        &self.c.server_query
    }

    /// User data.
    pub fn user_data(&self) -> &Arc<user_data::UserDataCoordinator> {
        &self.c.user_data
    }

    /// TURN credentials.
    pub fn turn_credentials(
        &self,
    ) -> &Arc<turn_credentials::TurnCredentialsCoordinator> {
        &self.c.turn_credentials
    }

    /// Free trial and receipts.
    pub fn free_trial(&self) -> &Arc<free_trial::FreeTrialCoordinator> {
        &self.c.free_trial
    }
}
