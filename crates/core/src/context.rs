//! The delegates shared by every coordinator.

use crate::framework::NotificationBus;
use netfetch_api::{
    builder::Builder, delegate::*, server::*, store::*, websocket::*, *,
};

/// Shared access to the external collaborators and the bus.
#[derive(Debug, Clone)]
pub struct Context {
    /// Storage.
    pub store: DynFetchStore,
    /// Server calls.
    pub server: DynServerApi,
    /// Cryptographic engine.
    pub crypto: DynCryptoDelegate,
    /// Channel layer.
    pub channel: DynChannelDelegate,
    /// Protocol state machines.
    pub protocol_starter: DynProtocolStarterDelegate,
    /// Websocket connector.
    pub ws_connector: DynWsConnector,
    /// Notification bus.
    pub bus: NotificationBus,
}

impl Context {
    /// Build a context from the delegates of a [Builder] and a bus.
    pub fn from_builder(builder: &Builder, bus: NotificationBus) -> Self {
        Self {
            store: builder.store.clone(),
            server: builder.server.clone(),
            crypto: builder.crypto.clone(),
            channel: builder.channel.clone(),
            protocol_starter: builder.protocol_starter.clone(),
            ws_connector: builder.ws_connector.clone(),
            bus,
        }
    }

    /// True if the identity exists and is active. A store error reads as
    /// inactive.
    pub async fn is_active(&self, identity: &OwnedIdentity) -> bool {
        match self.store.get_owned_identity(identity.clone()).await {
            Ok(info) => info.is_some_and(|i| i.active),
            Err(err) => {
                tracing::warn!(?err, "cannot read owned identity");
                false
            }
        }
    }
}
