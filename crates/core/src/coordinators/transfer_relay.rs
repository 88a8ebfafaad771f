//! Device-transfer relay over a dedicated websocket per protocol instance.
//!
//! The transfer protocol runs between two devices that cannot reach each
//! other directly. Each side opens a socket to its server: the source
//! obtains a session number, the target connects with that number, then
//! both relay opaque payloads tagged with the other end's connection id.
//!
//! Relayed payloads larger than the fragment size are split in fragments
//! carrying their index and the fragment count, and reassembled on
//! receipt.
//!
//! A protocol instance makes one request at a time. A new request while a
//! previous one still waits for its response, or a socket that fails,
//! fails the whole instance.

use crate::context::Context;
use crate::framework::DropAbortHandle;
use bytes::{Bytes, BytesMut};
use netfetch_api::{delegate::*, record::*, websocket::*, *};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// Split a payload in fragments of at most `fragment_size` bytes.
///
/// Returns `(index, count, data)` triples. An empty payload yields one
/// empty fragment.
pub fn fragment(payload: &Bytes, fragment_size: usize) -> Vec<(u32, u32, Bytes)> {
    let size = fragment_size.max(1);
    if payload.is_empty() {
        return vec![(0, 1, Bytes::new())];
    }
    let count = payload.len().div_ceil(size) as u32;
    (0..count)
        .map(|index| {
            let start = index as usize * size;
            let end = (start + size).min(payload.len());
            (index, count, payload.slice(start..end))
        })
        .collect()
}

#[derive(Debug)]
struct Partial {
    parts: Vec<Option<Bytes>>,
    missing: usize,
}

/// Reassembles fragmented payloads, per connection id.
#[derive(Debug, Default)]
pub struct Reassembler {
    partials: HashMap<String, Partial>,
}

impl Reassembler {
    /// Add one fragment. Returns the whole payload when this fragment was
    /// the last one missing, `None` otherwise.
    ///
    /// Duplicate fragments are ignored. A single-fragment payload passes
    /// through without touching the pending one. A fragment announcing a
    /// different count than the pending ones restarts the payload.
    pub fn push(
        &mut self,
        connection_id: &str,
        index: u32,
        count: u32,
        data: Bytes,
    ) -> Option<Bytes> {
        if index >= count {
            tracing::warn!(
                connection_id,
                index,
                count,
                "fragment out of range"
            );
            return None;
        }
        if count == 1 {
            return Some(data);
        }

        let partial = self
            .partials
            .entry(connection_id.to_string())
            .or_insert_with(|| Partial {
                parts: vec![None; count as usize],
                missing: count as usize,
            });
        if partial.parts.len() != count as usize {
            tracing::warn!(
                connection_id,
                dropped = partial.parts.len() - partial.missing,
                "fragment count changed, discarding partial payload"
            );
            *partial = Partial {
                parts: vec![None; count as usize],
                missing: count as usize,
            };
        }

        let slot = &mut partial.parts[index as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(data);
        partial.missing -= 1;
        if partial.missing > 0 {
            return None;
        }

        let partial = self.partials.remove(connection_id)?;
        let mut out = BytesMut::new();
        for part in partial.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Some(out.freeze())
    }

    /// Number of payloads still missing fragments.
    pub fn pending_count(&self) -> usize {
        self.partials.len()
    }
}

fn one() -> u32 {
    1
}

#[derive(Debug, serde::Serialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
enum ClientFrame {
    Source,
    Target {
        session_number: u64,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        payload: Bytes,
    },
    Relay {
        connection_id: String,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        payload: Bytes,
        fragment_index: u32,
        fragment_count: u32,
    },
    Close {
        abort: bool,
    },
}

#[derive(Debug, serde::Deserialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
enum ServerFrame {
    SessionNumber {
        session_number: u64,
    },
    Relay {
        connection_id: String,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        payload: Bytes,
        #[serde(default)]
        fragment_index: u32,
        #[serde(default = "one")]
        fragment_count: u32,
    },
    Error {
        error: String,
    },
}

/// Why a transfer request failed. Every failure fails the protocol
/// instance.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferFailure {
    /// The websocket url of the server is unknown.
    NoWebSocketUrl,
    /// The socket could not be opened.
    ConnectionFailed,
    /// The protocol instance has no open transfer socket.
    NoTransferSession,
    /// The socket closed or failed while a response was expected.
    SocketClosed,
    /// A request was made while a previous one was still waiting.
    OrderingViolation,
}

#[derive(Debug)]
enum Incoming {
    SessionNumber(u64),
    Message { connection_id: String, payload: Bytes },
}

struct TransferSession {
    id: u64,
    send: Mutex<Option<mpsc::UnboundedSender<String>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    outstanding: Mutex<Option<QueryUid>>,
    reader: Mutex<Option<DropAbortHandle>>,
}

impl TransferSession {
    fn send(&self, frame: &ClientFrame) -> Result<(), TransferFailure> {
        // serializing plain strings and integers cannot fail
        let text = serde_json::to_string(frame).unwrap_or_default();
        match &*self.send.lock().unwrap() {
            Some(send) => send
                .send(text)
                .map_err(|_| TransferFailure::SocketClosed),
            None => Err(TransferFailure::SocketClosed),
        }
    }

    fn begin(&self, uid: &QueryUid) -> Result<(), TransferFailure> {
        let mut lock = self.outstanding.lock().unwrap();
        if let Some(prior) = &*lock {
            tracing::warn!(
                ?prior,
                ?uid,
                "transfer request while another is outstanding"
            );
            return Err(TransferFailure::OrderingViolation);
        }
        *lock = Some(uid.clone());
        Ok(())
    }

    fn end(&self) {
        *self.outstanding.lock().unwrap() = None;
    }

    async fn next(&self) -> Result<Incoming, TransferFailure> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransferFailure::SocketClosed)
    }

    fn close(&self) {
        self.send.lock().unwrap().take();
        self.reader.lock().unwrap().take();
    }
}

async fn reader_task(
    session: Weak<TransferSession>,
    mut recv: mpsc::UnboundedReceiver<WsEvent>,
    forward: mpsc::UnboundedSender<Incoming>,
) {
    let mut reassembler = Reassembler::default();
    while let Some(event) = recv.recv().await {
        match event {
            WsEvent::Text(text) => match serde_json::from_str(&text) {
                Ok(ServerFrame::SessionNumber { session_number }) => {
                    let _ = forward.send(Incoming::SessionNumber(session_number));
                }
                Ok(ServerFrame::Relay {
                    connection_id,
                    payload,
                    fragment_index,
                    fragment_count,
                }) => {
                    if let Some(payload) = reassembler.push(
                        &connection_id,
                        fragment_index,
                        fragment_count,
                        payload,
                    ) {
                        let _ = forward.send(Incoming::Message {
                            connection_id,
                            payload,
                        });
                    }
                }
                Ok(ServerFrame::Error { error }) => {
                    tracing::warn!(%error, "transfer refused by server");
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        %text,
                        "ignoring unreadable transfer frame"
                    );
                }
            },
            WsEvent::Closed { abnormal, reason } => {
                tracing::info!(abnormal, ?reason, "transfer socket closed");
                break;
            }
            WsEvent::Error(err) => {
                tracing::warn!(%err, "transfer socket failed");
                break;
            }
        }
    }

    // outgoing frames now fail, and dropping `forward` wakes any waiter
    if let Some(session) = session.upgrade() {
        session.send.lock().unwrap().take();
    }
}

/// The transfer sockets of the protocol instances.
pub struct TransferRelay {
    ctx: Context,
    well_known: DynWellKnownCacheDelegate,
    fragment_size: usize,
    sessions: Mutex<HashMap<ProtocolInstanceUid, Arc<TransferSession>>>,
    next_id: Mutex<u64>,
}

impl std::fmt::Debug for TransferRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRelay")
            .field("fragment_size", &self.fragment_size)
            .field("sessions", &self.sessions.lock().unwrap().len())
            .finish()
    }
}

impl TransferRelay {
    /// Construct a new TransferRelay.
    pub fn new(
        ctx: Context,
        well_known: DynWellKnownCacheDelegate,
        fragment_size: usize,
    ) -> Self {
        Self {
            ctx,
            well_known,
            fragment_size,
            sessions: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// True if the protocol instance has an open transfer socket.
    pub fn has_session(&self, protocol_instance: &ProtocolInstanceUid) -> bool {
        self.sessions.lock().unwrap().contains_key(protocol_instance)
    }

    fn session_of(
        &self,
        protocol_instance: &ProtocolInstanceUid,
    ) -> Result<Arc<TransferSession>, TransferFailure> {
        self.sessions
            .lock()
            .unwrap()
            .get(protocol_instance)
            .cloned()
            .ok_or(TransferFailure::NoTransferSession)
    }

    fn remove(&self, protocol_instance: &ProtocolInstanceUid) {
        let removed = self.sessions.lock().unwrap().remove(protocol_instance);
        if let Some(session) = removed {
            session.close();
        }
    }

    async fn open(
        &self,
        protocol_instance: &ProtocolInstanceUid,
        server: &ServerUrl,
    ) -> Result<Arc<TransferSession>, TransferFailure> {
        self.remove(protocol_instance);

        let url = self
            .well_known
            .get_web_socket_url(server.clone())
            .map_err(|err| {
                tracing::warn!(?err, %server, "no websocket url for transfer");
                TransferFailure::NoWebSocketUrl
            })?;
        let WsConnection { send, recv } =
            self.ctx.ws_connector.connect(url).await.map_err(|err| {
                tracing::warn!(?err, %server, "cannot open transfer socket");
                TransferFailure::ConnectionFailed
            })?;

        let id = {
            let mut lock = self.next_id.lock().unwrap();
            *lock += 1;
            *lock
        };
        let (forward, incoming) = mpsc::unbounded_channel();
        let session = Arc::new(TransferSession {
            id,
            send: Mutex::new(Some(send)),
            incoming: tokio::sync::Mutex::new(incoming),
            outstanding: Mutex::new(None),
            reader: Mutex::new(None),
        });
        *session.reader.lock().unwrap() = Some(DropAbortHandle::spawn(
            format!("transfer-reader-{protocol_instance}"),
            reader_task(Arc::downgrade(&session), recv, forward),
        ));
        tracing::debug!(?protocol_instance, id, "transfer socket open");

        self.sessions
            .lock()
            .unwrap()
            .insert(protocol_instance.clone(), session.clone());
        Ok(session)
    }

    /// Run one transfer request of a protocol instance.
    pub async fn execute(
        &self,
        uid: &QueryUid,
        server: &ServerUrl,
        protocol_instance: &ProtocolInstanceUid,
        request: &TransferRequest,
    ) -> Result<ServerResponse, TransferFailure> {
        if let TransferRequest::Close { abort } = request {
            if let Ok(session) = self.session_of(protocol_instance) {
                let _ = session.send(&ClientFrame::Close { abort: *abort });
            }
            self.remove(protocol_instance);
            return Ok(ServerResponse::TransferClosed);
        }

        let session = match request {
            TransferRequest::Source | TransferRequest::Target { .. } => {
                self.open(protocol_instance, server).await?
            }
            _ => self.session_of(protocol_instance)?,
        };

        if let Err(err) = session.begin(uid) {
            self.remove(protocol_instance);
            return Err(err);
        }
        let res = self.run(&session, request).await;
        session.end();

        if res.is_err() {
            let mut lock = self.sessions.lock().unwrap();
            if lock.get(protocol_instance).map(|s| s.id) == Some(session.id) {
                lock.remove(protocol_instance);
            }
            drop(lock);
            session.close();
        }
        res
    }

    async fn run(
        &self,
        session: &TransferSession,
        request: &TransferRequest,
    ) -> Result<ServerResponse, TransferFailure> {
        match request {
            TransferRequest::Source => {
                session.send(&ClientFrame::Source)?;
                loop {
                    match session.next().await? {
                        Incoming::SessionNumber(n) => {
                            return Ok(ServerResponse::TransferSessionNumber(n))
                        }
                        Incoming::Message { connection_id, .. } => {
                            tracing::debug!(
                                %connection_id,
                                "relay before session number"
                            );
                        }
                    }
                }
            }
            TransferRequest::Target {
                session_number,
                payload,
            } => {
                session.send(&ClientFrame::Target {
                    session_number: *session_number,
                    payload: payload.clone(),
                })?;
                next_message(session).await
            }
            TransferRequest::Relay {
                connection_id,
                payload,
                wait_for_response,
            } => {
                for (index, count, data) in fragment(payload, self.fragment_size)
                {
                    session.send(&ClientFrame::Relay {
                        connection_id: connection_id.clone(),
                        payload: data,
                        fragment_index: index,
                        fragment_count: count,
                    })?;
                }
                if *wait_for_response {
                    next_message(session).await
                } else {
                    Ok(ServerResponse::TransferRelayed)
                }
            }
            TransferRequest::Wait => next_message(session).await,
            TransferRequest::Close { .. } => Ok(ServerResponse::TransferClosed),
        }
    }
}

async fn next_message(
    session: &TransferSession,
) -> Result<ServerResponse, TransferFailure> {
    loop {
        match session.next().await? {
            Incoming::Message {
                connection_id,
                payload,
            } => {
                return Ok(ServerResponse::TransferMessage {
                    connection_id,
                    payload,
                })
            }
            Incoming::SessionNumber(n) => {
                tracing::debug!(n, "ignoring late session number");
            }
        }
    }
}
