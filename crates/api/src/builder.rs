//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The netfetch builder.
///
/// This contains the configuration and the external delegates that the
/// coordinators are constructed with.
#[derive(Debug)]
pub struct Builder {
    /// The module configuration to be used when building coordinators.
    /// This can be loaded from disk or modified before freezing the builder.
    pub config: config::Config,

    /// Durable state.
    pub store: store::DynFetchStore,

    /// Server calls.
    pub server: server::DynServerApi,

    /// Cryptographic engine.
    pub crypto: delegate::DynCryptoDelegate,

    /// Channel layer.
    pub channel: delegate::DynChannelDelegate,

    /// Protocol starter.
    pub protocol_starter: delegate::DynProtocolStarterDelegate,

    /// Websocket connector.
    pub ws_connector: websocket::DynWsConnector,
}

impl Builder {
    /// Freeze the builder.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}
