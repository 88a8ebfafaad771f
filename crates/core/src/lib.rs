#![deny(missing_docs)]
//! Network-fetch scheduling and coordination for an end-to-end encrypted
//! messaging engine.
//!
//! Every network workflow (sessions, listing, attachment downloads,
//! deletion, websockets, server queries...) is a coordinator running its
//! operations on the queues of [framework]. The [FetchManager] builds and
//! wires all of them from a [Builder].

use netfetch_api::{
    builder::Builder, config::Config, delegate::*, server::*, store::*, *,
};

/// Construct a builder with the default config of every module and the
/// tokio-tungstenite websocket connector.
pub fn default_builder(
    store: DynFetchStore,
    server: DynServerApi,
    crypto: DynCryptoDelegate,
    channel: DynChannelDelegate,
    protocol_starter: DynProtocolStarterDelegate,
) -> NfResult<Builder> {
    let mut config = Config::default();
    set_default_config(&mut config)?;
    Ok(Builder {
        config,
        store,
        server,
        crypto,
        channel,
        protocol_starter,
        ws_connector: tungstenite::TungsteniteConnector::create(),
    })
}

pub mod context;
pub mod coordinators;
pub mod framework;
pub mod mem_store;
pub mod mem_ws;
pub mod tungstenite;

mod manager;
pub use manager::*;

#[cfg(test)]
mod test_support;
