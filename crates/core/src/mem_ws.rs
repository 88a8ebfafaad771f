//! The in-memory websocket connector.
//!
//! This is NOT a production module. It is for testing only. Every
//! "connection" it opens is handed to the test as a [MemWsPeer], the
//! server end of the socket.

use netfetch_api::{websocket::*, *};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The server end of an in-memory websocket.
#[derive(Debug)]
pub struct MemWsPeer {
    /// The url the client connected to.
    pub url: String,
    /// Frames sent by the client.
    pub recv: mpsc::UnboundedReceiver<String>,
    /// Events delivered to the client.
    pub send: mpsc::UnboundedSender<WsEvent>,
}

impl MemWsPeer {
    /// Send a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.send.send(WsEvent::Text(text.into()));
    }

    /// Close the socket.
    pub fn close(&self, abnormal: bool) {
        let _ = self.send.send(WsEvent::Closed {
            abnormal,
            reason: None,
        });
    }

    /// Receive the next frame sent by the client, parsed as json.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

#[derive(Debug)]
struct State {
    failing: u32,
    accept_send: mpsc::UnboundedSender<MemWsPeer>,
    accept_recv: Option<mpsc::UnboundedReceiver<MemWsPeer>>,
}

/// A [WsConnector] connecting to the test itself.
#[derive(Debug)]
pub struct MemWsConnector(Mutex<State>);

impl MemWsConnector {
    /// Construct a new MemWsConnector.
    pub fn create() -> Arc<Self> {
        let (accept_send, accept_recv) = mpsc::unbounded_channel();
        Arc::new(Self(Mutex::new(State {
            failing: 0,
            accept_send,
            accept_recv: Some(accept_recv),
        })))
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.0.lock().unwrap().failing = count;
    }

    /// Take the receiver of accepted connections. Returns `None` after
    /// the first call.
    pub fn take_acceptor(&self) -> Option<mpsc::UnboundedReceiver<MemWsPeer>> {
        self.0.lock().unwrap().accept_recv.take()
    }
}

impl WsConnector for MemWsConnector {
    fn connect(&self, url: String) -> BoxFut<'_, NfResult<WsConnection>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            if lock.failing > 0 {
                lock.failing -= 1;
                return Err(NfError::other(format!("refused: {url}")));
            }

            let (client_send, server_recv) = mpsc::unbounded_channel();
            let (server_send, client_recv) = mpsc::unbounded_channel();
            lock.accept_send
                .send(MemWsPeer {
                    url,
                    recv: server_recv,
                    send: server_send,
                })
                .map_err(|_| NfError::other("acceptor dropped"))?;

            Ok(WsConnection {
                send: client_send,
                recv: client_recv,
            })
        })
    }
}
