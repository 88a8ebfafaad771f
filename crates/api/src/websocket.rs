//! Websocket connector used by the websocket coordinator and the
//! transfer relay.

use crate::*;
use std::sync::Arc;

/// An event received on an open websocket.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// A text frame.
    Text(String),
    /// The socket closed. `abnormal` is false only for a normal close
    /// handshake.
    Closed {
        /// Not a normal close.
        abnormal: bool,
        /// Close reason, if any.
        reason: Option<String>,
    },
    /// The socket failed.
    Error(String),
}

/// An open text websocket.
///
/// Dropping `send` closes the socket.
#[derive(Debug)]
pub struct WsConnection {
    /// Outgoing text frames.
    pub send: tokio::sync::mpsc::UnboundedSender<String>,
    /// Incoming events. The receiver ends after a `Closed` or `Error`.
    pub recv: tokio::sync::mpsc::UnboundedReceiver<WsEvent>,
}

/// Opens websockets.
pub trait WsConnector: 'static + Send + Sync + std::fmt::Debug {
    /// Connect to `url`.
    fn connect(&self, url: String) -> BoxFut<'_, NfResult<WsConnection>>;
}

/// Trait-object [WsConnector].
pub type DynWsConnector = Arc<dyn WsConnector>;
