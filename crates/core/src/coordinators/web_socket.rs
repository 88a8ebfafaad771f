//! The push websocket shared by the active identities of a server.
//!
//! One socket is opened per server. Once open, every active identity of
//! that server registers on it with its session token. The server then
//! pushes message notices, return receipts and topic updates. A ping is
//! sent periodically. A closed socket is reopened through the backoff
//! scheduler.
//!
//! Frames are json objects tagged by `action`. Byte fields are url-safe
//! base64 strings.

use crate::context::Context;
use crate::framework::*;
use bytes::Bytes;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, record::*, websocket::*,
    *,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Module name of the [WebSocketConfig].
pub const MOD_NAME: &str = "WebSocket";

/// Configuration parameters for [WebSocketCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSocketConfig {
    /// Interval between two pings.
    ///
    /// Default: 20 s.
    pub ping_interval_ms: u64,

    /// A ping still unanswered after this long is reported lost when the
    /// next ping is due.
    ///
    /// Default: 15 s.
    pub ping_lost_threshold_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000 * 20,
            ping_lost_threshold_ms: 1000 * 15,
        }
    }
}

impl ModConfig for WebSocketConfig {}

#[derive(Debug, serde::Serialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
enum ClientFrame {
    Register {
        identity: OwnedIdentity,
        device_uid: DeviceUid,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        token: Bytes,
    },
    Ping {
        ping_time: i64,
    },
    DeleteReturnReceipt {
        identity: OwnedIdentity,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        server_uid: Bytes,
    },
}

#[derive(Debug, serde::Deserialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
enum ServerFrame {
    Register {
        identity: OwnedIdentity,
    },
    Message {
        identity: OwnedIdentity,
        #[serde(default)]
        message: Option<ListedMessage>,
    },
    ReturnReceipt {
        identity: OwnedIdentity,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        server_uid: Bytes,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        nonce: Bytes,
        #[serde(with = "netfetch_api::serde_bytes_base64")]
        encrypted_payload: Bytes,
        timestamp: Timestamp,
    },
    PushTopic {
        topic: String,
    },
    Pong {
        ping_time: i64,
    },
    Error {
        #[serde(default)]
        identity: Option<OwnedIdentity>,
        error: String,
    },
}

const INVALID_SESSION: &str = "invalid session";

fn encode(frame: &ClientFrame) -> String {
    // serializing plain structs of strings and integers cannot fail
    serde_json::to_string(frame).unwrap_or_default()
}

/// Why a websocket connection attempt was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum WebSocketCancelReason {
    /// No active identity uses this server.
    NoActiveIdentity,
    /// The websocket url of the server is not cached yet.
    WellKnownNotCached,
    /// The server publishes no websocket url.
    NoWebSocketUrl,
    /// The socket could not be opened.
    ConnectionFailed(String),
    /// Storage failed.
    StoreError,
}

fn store_err(err: NfError) -> WebSocketCancelReason {
    tracing::warn!(?err, "store error");
    WebSocketCancelReason::StoreError
}

async fn active_identities_of(
    ctx: &Context,
    server: &ServerUrl,
) -> NfResult<Vec<OwnedIdentityInfo>> {
    Ok(ctx
        .store
        .get_owned_identities()
        .await?
        .into_iter()
        .filter(|i| i.active && i.server == *server)
        .collect())
}

#[derive(Debug)]
pub(crate) struct ConnectOp {
    ctx: Context,
    well_known: DynWellKnownCacheDelegate,
    server: ServerUrl,
}

impl Operation for ConnectOp {
    type Output = WsConnection;
    type Reason = WebSocketCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([self.server.as_str()])
    }

    fn execute(&self) -> BoxFut<'_, Result<WsConnection, WebSocketCancelReason>> {
        use WebSocketCancelReason as R;
        Box::pin(async move {
            if active_identities_of(&self.ctx, &self.server)
                .await
                .map_err(store_err)?
                .is_empty()
            {
                return Err(R::NoActiveIdentity);
            }

            let url = self
                .well_known
                .get_web_socket_url(self.server.clone())
                .map_err(|err| {
                    if err.is_not_cached_yet() {
                        R::WellKnownNotCached
                    } else {
                        tracing::warn!(?err, "no websocket url");
                        R::NoWebSocketUrl
                    }
                })?;

            self.ctx
                .bus
                .post(Notification::WebSocketConnectionStateChanged {
                    server: self.server.clone(),
                    state: WebSocketState::Connecting,
                });
            self.ctx
                .ws_connector
                .connect(url)
                .await
                .map_err(|err| R::ConnectionFailed(err.to_string()))
        })
    }
}

struct Connection {
    id: u64,
    send: tokio::sync::mpsc::UnboundedSender<String>,
    registered: HashSet<OwnedIdentity>,
    _task: DropAbortHandle,
}

struct Inner {
    ctx: Context,
    config: WebSocketConfig,
    queue: OperationQueue<ConnectOp>,
    backoff: BackoffScheduler,
    well_known: DynWellKnownCacheDelegate,
    session: DynCreateServerSessionDelegate,
    list: DynDownloadListDelegate,
    connections: Mutex<HashMap<ServerUrl, Connection>>,
    next_connection_id: Mutex<u64>,
    awaiting_well_known: WaitingSet<ServerUrl, ()>,
    awaiting_session: WaitingSet<OwnedIdentity, ()>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketInner")
            .field("queue", &self.queue)
            .field(
                "connections",
                &self.connections.lock().unwrap().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Inner {
    fn queue_connect(&self, server: ServerUrl) -> bool {
        if self.connections.lock().unwrap().contains_key(&server) {
            return false;
        }
        self.queue.queue(ConnectOp {
            ctx: self.ctx.clone(),
            well_known: self.well_known.clone(),
            server,
        })
    }

    fn send(&self, server: &ServerUrl, frame: &ClientFrame) -> bool {
        let send = match self.connections.lock().unwrap().get(server) {
            Some(c) => c.send.clone(),
            None => return false,
        };
        send.send(encode(frame)).is_ok()
    }

    async fn register(&self, info: &OwnedIdentityInfo) {
        let token = match self
            .ctx
            .store
            .get_server_session_token(info.identity.clone())
            .await
        {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(?err, "cannot read session token");
                return;
            }
        };
        match token {
            Some(token) => {
                tracing::debug!(
                    identity = ?info.identity,
                    "registering on websocket"
                );
                let sent = self.send(
                    &info.server,
                    &ClientFrame::Register {
                        identity: info.identity.clone(),
                        device_uid: info.device_uid.clone(),
                        token,
                    },
                );
                if sent {
                    if let Some(c) =
                        self.connections.lock().unwrap().get_mut(&info.server)
                    {
                        c.registered.insert(info.identity.clone());
                    }
                }
            }
            None => {
                self.awaiting_session.park(info.identity.clone(), ());
                self.session
                    .create_server_session(info.identity.clone(), None);
            }
        }
    }

    async fn register_all(&self, server: &ServerUrl) {
        match active_identities_of(&self.ctx, server).await {
            Ok(identities) => {
                for info in identities {
                    self.register(&info).await;
                }
            }
            Err(err) => tracing::warn!(?err, "cannot list owned identities"),
        }
    }

    async fn register_identity(&self, identity: &OwnedIdentity) {
        match self.ctx.store.get_owned_identity(identity.clone()).await {
            Ok(Some(info)) if info.active => {
                if self.connections.lock().unwrap().contains_key(&info.server)
                {
                    self.register(&info).await;
                } else {
                    self.queue_connect(info.server);
                }
            }
            Ok(_) => (),
            Err(err) => tracing::warn!(?err, "cannot read owned identity"),
        }
    }

    /// Register the active identities not registered yet, opening the
    /// sockets of their servers when needed.
    async fn register_new_identities(&self) {
        let identities = match self.ctx.store.get_owned_identities().await {
            Ok(identities) => identities,
            Err(err) => {
                tracing::warn!(?err, "cannot list owned identities");
                return;
            }
        };
        for info in identities.into_iter().filter(|i| i.active) {
            let registered = self
                .connections
                .lock()
                .unwrap()
                .get(&info.server)
                .map(|c| c.registered.contains(&info.identity));
            match registered {
                Some(true) => (),
                Some(false) => self.register(&info).await,
                None => {
                    self.queue_connect(info.server);
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        server: &ServerUrl,
        text: &str,
        outstanding_ping: &mut Option<(i64, Instant)>,
    ) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(
                    ?err,
                    %text,
                    "ignoring unreadable websocket frame"
                );
                return;
            }
        };
        match frame {
            ServerFrame::Register { identity } => {
                tracing::debug!(?identity, %server, "registered on websocket");
            }
            ServerFrame::Message {
                identity,
                message: Some(message),
            } => {
                self.list.process_pushed_message(identity, message);
            }
            ServerFrame::Message {
                identity,
                message: None,
            } => {
                match self.ctx.store.get_owned_identity(identity.clone()).await
                {
                    Ok(Some(info)) => {
                        self.list.download_messages_and_list_attachments(
                            identity,
                            info.device_uid,
                        )
                    }
                    Ok(None) => {
                        tracing::warn!(
                            ?identity,
                            "message notice for unknown identity"
                        )
                    }
                    Err(err) => tracing::warn!(
                        ?err,
                        "cannot read owned identity"
                    ),
                }
            }
            ServerFrame::ReturnReceipt {
                identity,
                server_uid,
                nonce,
                encrypted_payload,
                timestamp,
            } => {
                self.ctx.bus.post(Notification::ReturnReceiptReceived {
                    server: server.clone(),
                    identity,
                    server_uid,
                    nonce,
                    encrypted_payload,
                    timestamp,
                });
            }
            ServerFrame::PushTopic { topic } => {
                self.ctx.bus.post(Notification::PushTopicNotified { topic });
            }
            ServerFrame::Pong { ping_time } => match outstanding_ping.take() {
                Some((sent_time, sent)) if sent_time == ping_time => {
                    self.ctx.bus.post(Notification::PingReceived {
                        server: server.clone(),
                        delay: sent.elapsed(),
                    });
                }
                oth => {
                    tracing::debug!(ping_time, "ignoring stale pong");
                    *outstanding_ping = oth;
                }
            },
            ServerFrame::Error {
                identity: Some(identity),
                error,
            } if error == INVALID_SESSION => {
                tracing::info!(?identity, "websocket session refused");
                let token = match self
                    .ctx
                    .store
                    .get_server_session_token(identity.clone())
                    .await
                {
                    Ok(token) => token,
                    Err(err) => {
                        tracing::warn!(?err, "cannot read session token");
                        None
                    }
                };
                self.awaiting_session.park(identity.clone(), ());
                self.session.create_server_session(identity, token);
            }
            ServerFrame::Error { identity, error } => {
                tracing::warn!(
                    ?identity,
                    %error,
                    %server,
                    "websocket error frame"
                );
            }
        }
    }
}

async fn connection_task(
    inner: Weak<Inner>,
    server: ServerUrl,
    id: u64,
    send: tokio::sync::mpsc::UnboundedSender<String>,
    mut recv: tokio::sync::mpsc::UnboundedReceiver<WsEvent>,
    config: WebSocketConfig,
) {
    let interval = Duration::from_millis(config.ping_interval_ms.max(1));
    let threshold = Duration::from_millis(config.ping_lost_threshold_ms);
    let mut ping =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut outstanding_ping: Option<(i64, Instant)> = None;

    let abnormal = loop {
        tokio::select! {
            _ = ping.tick() => {
                let Some(strong) = inner.upgrade() else { return };
                if let Some((_, sent)) = outstanding_ping {
                    let elapsed = sent.elapsed();
                    if elapsed >= threshold {
                        strong.ctx.bus.post(Notification::PingLost {
                            server: server.clone(),
                            elapsed,
                        });
                    }
                }
                let ping_time = Timestamp::now().as_micros();
                if send.send(encode(&ClientFrame::Ping { ping_time })).is_err() {
                    break true;
                }
                outstanding_ping = Some((ping_time, Instant::now()));
            }
            event = recv.recv() => match event {
                Some(WsEvent::Text(text)) => {
                    let Some(strong) = inner.upgrade() else { return };
                    strong.handle_frame(&server, &text, &mut outstanding_ping).await;
                }
                Some(WsEvent::Closed { abnormal, reason }) => {
                    tracing::info!(
                        %server,
                        abnormal,
                        ?reason,
                        "websocket closed"
                    );
                    break abnormal;
                }
                Some(WsEvent::Error(err)) => {
                    tracing::warn!(%server, %err, "websocket failed");
                    break true;
                }
                None => break true,
            },
        }
    };

    let Some(inner) = inner.upgrade() else { return };
    disconnected(&inner, &server, id, abnormal);
}

// Must not await: removing the entry aborts this very task.
fn disconnected(inner: &Arc<Inner>, server: &ServerUrl, id: u64, abnormal: bool) {
    let removed = {
        let mut lock = inner.connections.lock().unwrap();
        match lock.get(server) {
            Some(c) if c.id == id => lock.remove(server),
            _ => None,
        }
    };

    inner
        .ctx
        .bus
        .post(Notification::WebSocketConnectionStateChanged {
            server: server.clone(),
            state: WebSocketState::Disconnected,
        });

    let weak = Arc::downgrade(inner);
    let delay = inner.backoff.schedule(
        OperationKey::from_parts([server.as_str()]),
        "reconnect-web-socket",
        {
            let server = server.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.queue_connect(server);
                }
            }
        },
    );
    tracing::info!(%server, abnormal, ?delay, "websocket will reconnect");

    drop(removed);
}

/// Maintains one push websocket per server.
#[derive(Debug)]
pub struct WebSocketCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _subscriptions: Vec<Subscription>,
}

impl WebSocketCoordinator {
    /// Construct a new WebSocketCoordinator.
    pub fn create(
        ctx: Context,
        config: WebSocketConfig,
        backoff: BackoffConfig,
        well_known: DynWellKnownCacheDelegate,
        session: DynCreateServerSessionDelegate,
        list: DynDownloadListDelegate,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new("web-socket", 1, true);
        let inner = Arc::new(Inner {
            ctx,
            config,
            queue,
            backoff: BackoffScheduler::new("web-socket", backoff),
            well_known,
            session,
            list,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: Mutex::new(0),
            awaiting_well_known: WaitingSet::default(),
            awaiting_session: WaitingSet::default(),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "web-socket-outcomes",
            outcome_task(inner.clone(), outcomes),
        );

        let well_known_updated = inner.ctx.bus.subscribe(
            NotificationKind::WellKnownCacheUpdated,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::WellKnownCacheUpdated {
                        server, ..
                    } = n
                    {
                        if !inner.awaiting_well_known.take(server).is_empty() {
                            inner.queue_connect(server.clone());
                        }
                    }
                }
            },
        );

        let session_created = inner.ctx.bus.subscribe(
            NotificationKind::ServerSessionCreated,
            {
                let inner = inner.clone();
                move |n| {
                    if let Notification::ServerSessionCreated { identity } = n
                    {
                        if !inner.awaiting_session.take(identity).is_empty() {
                            let inner = inner.clone();
                            let identity = identity.clone();
                            tokio::task::spawn(async move {
                                inner.register_identity(&identity).await;
                            });
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
                        let inner = inner.clone();
                        let identity = identity.clone();
                        tokio::task::spawn(async move {
                            inner.register_identity(&identity).await;
                        });
                    }
                }
            },
        );

        let identities_updated = inner.ctx.bus.subscribe(
            NotificationKind::OwnedIdentityListUpdated,
            {
                let inner = inner.clone();
                move |_| {
                    let inner = inner.clone();
                    tokio::task::spawn(async move {
                        inner.register_new_identities().await;
                    });
                }
            },
        );

        Arc::new(Self {
            inner,
            _outcome_task,
            _subscriptions: vec![
                well_known_updated,
                session_created,
                activated,
                identities_updated,
            ],
        })
    }

    /// Open a websocket to every server that has an active identity.
    pub async fn connect_all(&self) -> NfResult<()> {
        let servers = self
            .inner
            .ctx
            .store
            .get_owned_identities()
            .await?
            .into_iter()
            .filter(|i| i.active)
            .map(|i| i.server)
            .collect::<BTreeSet<_>>();
        for server in servers {
            self.inner.queue_connect(server);
        }
        Ok(())
    }

    /// Open the websocket of a server, if not open already.
    pub fn connect(&self, server: ServerUrl) {
        self.inner.queue_connect(server);
    }

    /// True if the websocket of this server is open.
    pub fn is_connected(&self, server: &ServerUrl) -> bool {
        self.inner.connections.lock().unwrap().contains_key(server)
    }

    /// Ask the server to delete a return receipt it pushed.
    pub fn delete_return_receipt(
        &self,
        server: ServerUrl,
        identity: OwnedIdentity,
        server_uid: Bytes,
    ) -> NfResult<()> {
        if self.inner.send(
            &server,
            &ClientFrame::DeleteReturnReceipt {
                identity,
                server_uid,
            },
        ) {
            Ok(())
        } else {
            Err(NfError::other(format!("websocket of {server} is not open")))
        }
    }

    /// Run every scheduled reconnection now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

async fn outcome_task(inner: Arc<Inner>, mut outcomes: OutcomeRecv<ConnectOp>) {
    use WebSocketCancelReason as R;
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let server = op.server.clone();
        match outcome {
            Outcome::Finished(WsConnection { send, recv }) => {
                inner.backoff.clear_failed_count(&key);
                {
                    let mut next_id = inner.next_connection_id.lock().unwrap();
                    *next_id += 1;
                    let id = *next_id;
                    let task = DropAbortHandle::spawn(
                        format!("web-socket-{server}"),
                        connection_task(
                            Arc::downgrade(&inner),
                            server.clone(),
                            id,
                            send.clone(),
                            recv,
                            inner.config.clone(),
                        ),
                    );
                    inner.connections.lock().unwrap().insert(
                        server.clone(),
                        Connection {
                            id,
                            send,
                            registered: HashSet::new(),
                            _task: task,
                        },
                    );
                }
                tracing::info!(%server, "websocket connected");
                inner
                    .ctx
                    .bus
                    .post(Notification::WebSocketConnectionStateChanged {
                        server: server.clone(),
                        state: WebSocketState::Connected,
                    });
                inner.register_all(&server).await;
            }
            Outcome::Cancelled(Some(R::WellKnownNotCached)) => {
                tracing::debug!(%server, "waiting for well-known data");
                inner.awaiting_well_known.park(server.clone(), ());
                // the cache may have been filled since the attempt
                if inner.well_known.get_web_socket_url(server.clone()).is_ok()
                    && !inner.awaiting_well_known.take(&server).is_empty()
                {
                    inner.queue_connect(server);
                }
            }
            Outcome::Cancelled(Some(
                reason @ (R::NoActiveIdentity | R::NoWebSocketUrl),
            )) => {
                inner.backoff.clear_failed_count(&key);
                tracing::debug!(%server, ?reason, "not connecting");
            }
            Outcome::Cancelled(
                reason @ (Some(R::ConnectionFailed(_) | R::StoreError) | None),
            ) => {
                inner
                    .ctx
                    .bus
                    .post(Notification::WebSocketConnectionStateChanged {
                        server: server.clone(),
                        state: WebSocketState::Disconnected,
                    });
                let weak = Arc::downgrade(&inner);
                let delay = inner.backoff.schedule(key, "connect-web-socket", {
                    let server = server.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_connect(server);
                        }
                    }
                });
                tracing::warn!(
                    %server,
                    ?reason,
                    ?delay,
                    "websocket connection failed, will retry"
                );
            }
        }
    }
}
