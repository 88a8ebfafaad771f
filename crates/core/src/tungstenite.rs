//! The production websocket connector, based on tokio-tungstenite.

use futures::{SinkExt, StreamExt};
use netfetch_api::{websocket::*, *};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{
    frame::coding::CloseCode, Message as WsMessage,
};

/// A [WsConnector] opening real websockets.
#[derive(Debug, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Construct a new TungsteniteConnector.
    pub fn create() -> DynWsConnector {
        let out: DynWsConnector = Arc::new(TungsteniteConnector);
        out
    }
}

impl WsConnector for TungsteniteConnector {
    fn connect(&self, url: String) -> BoxFut<'_, NfResult<WsConnection>> {
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| NfError::other_src(format!("connect {url}"), e))?;

            tracing::debug!(%url, "websocket connected");

            let (mut write, mut read) = ws_stream.split();
            let (send, mut out_recv) = mpsc::unbounded_channel::<String>();
            let (event_send, recv) = mpsc::unbounded_channel::<WsEvent>();

            // writer: ends when the connection owner drops its sender
            tokio::task::spawn(async move {
                while let Some(text) = out_recv.recv().await {
                    if let Err(err) = write.send(WsMessage::Text(text)).await {
                        tracing::debug!(?err, "websocket write failed");
                        break;
                    }
                }
                let _ = write.close().await;
            });

            // reader: ends on close, error, or when nobody listens anymore
            tokio::task::spawn(async move {
                while let Some(msg) = read.next().await {
                    let event = match msg {
                        Ok(WsMessage::Text(text)) => WsEvent::Text(text),
                        Ok(WsMessage::Close(frame)) => {
                            let abnormal = frame
                                .as_ref()
                                .map(|f| f.code != CloseCode::Normal)
                                .unwrap_or(true);
                            let reason =
                                frame.map(|f| f.reason.to_string());
                            let _ = event_send
                                .send(WsEvent::Closed { abnormal, reason });
                            return;
                        }
                        // pings are answered by tungstenite
                        Ok(_) => continue,
                        Err(err) => {
                            let _ = event_send.send(WsEvent::Error(err.to_string()));
                            return;
                        }
                    };
                    if event_send.send(event).is_err() {
                        return;
                    }
                }
                let _ = event_send.send(WsEvent::Closed {
                    abnormal: true,
                    reason: None,
                });
            });

            Ok(WsConnection { send, recv })
        })
    }
}
