//! Shared setup for the coordinator tests.

use crate::context::Context;
use crate::framework::*;
use crate::mem_store::MemFetchStore;
use crate::mem_ws::MemWsConnector;
use bytes::Bytes;
use netfetch_api::{delegate::*, notification::*, record::*, store::*, *};
use netfetch_test_utils::{delegate::*, id::*, server::FakeServerApi};
use std::sync::{Arc, Mutex};

pub(crate) const TEST_SERVER: &str = "https://srv.example";

pub(crate) struct Harness {
    pub ctx: Context,
    pub store: Arc<MemFetchStore>,
    pub server: Arc<FakeServerApi>,
    pub crypto: Arc<PassThroughCrypto>,
    pub channel: Arc<RecordingChannel>,
    pub protocol_starter: Arc<RecordingProtocolStarter>,
    pub ws: Arc<MemWsConnector>,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemFetchStore::create();
        let server = FakeServerApi::create();
        let crypto = PassThroughCrypto::create();
        let channel = RecordingChannel::create();
        let protocol_starter = RecordingProtocolStarter::create();
        let ws = MemWsConnector::create();
        let ctx = Context {
            store: store.clone(),
            server: server.clone(),
            crypto: crypto.clone(),
            channel: channel.clone(),
            protocol_starter: protocol_starter.clone(),
            ws_connector: ws.clone(),
            bus: NotificationBus::create(),
        };
        Self {
            ctx,
            store,
            server,
            crypto,
            channel,
            protocol_starter,
            ws,
        }
    }

    pub fn add_identity(&self, active: bool) -> OwnedIdentityInfo {
        let info = OwnedIdentityInfo {
            identity: random_identity(),
            server: ServerUrl::from(TEST_SERVER),
            device_uid: random_device_uid(),
            active,
        };
        self.store.add_owned_identity(info.clone());
        info
    }

    pub async fn add_session(&self, identity: &OwnedIdentity) -> Bytes {
        let token = Bytes::from(format!("session-{identity}"));
        self.store
            .save_server_session(ServerSession {
                identity: identity.clone(),
                token: token.clone(),
                api_key_status: ApiKeyStatus::Valid,
            })
            .await
            .unwrap();
        token
    }

    /// Add an unprocessed message with one attachment per entry of
    /// `chunks`, each split in that many chunks.
    pub fn add_message(
        &self,
        identity: &OwnedIdentity,
        chunks: &[u32],
    ) -> MessageUid {
        let uid = random_message_uid();
        self.store.add_inbox_message(inbox_message(identity, &uid));
        for (number, count) in chunks.iter().enumerate() {
            self.store.add_inbox_attachment(inbox_attachment(
                identity,
                &uid,
                number as u32,
                *count,
            ));
        }
        uid
    }

    pub fn record(&self, kind: NotificationKind) -> Recorder {
        Recorder::new(&self.ctx.bus, kind)
    }

    pub fn post_session_created(&self, identity: &OwnedIdentity) {
        self.ctx.bus.post(Notification::ServerSessionCreated {
            identity: identity.clone(),
        });
    }
}

pub(crate) fn inbox_message(
    identity: &OwnedIdentity,
    uid: &MessageUid,
) -> InboxMessage {
    InboxMessage {
        identity: identity.clone(),
        uid: uid.clone(),
        status: InboxMessageStatus::Unprocessed,
        server_timestamp: Timestamp::now(),
        awaiting_contact: false,
        has_extended_payload: false,
        extended_payload_key: None,
        extended_payload: None,
    }
}

pub(crate) fn chunk_url(uid: &MessageUid, number: u32, index: u32) -> String {
    format!("https://cdn.example/{uid}/{number}/{index}")
}

pub(crate) fn inbox_attachment(
    identity: &OwnedIdentity,
    uid: &MessageUid,
    number: u32,
    chunks: u32,
) -> InboxAttachment {
    InboxAttachment {
        identity: identity.clone(),
        uid: uid.clone(),
        number,
        expected_length: chunks as u64 * 16,
        chunk_download_urls: (0..chunks)
            .map(|i| chunk_url(uid, number, i))
            .collect(),
        received_chunk_count: 0,
        download_requested: false,
        marked_for_deletion: false,
        server_timestamp: Timestamp::now(),
    }
}

/// Calls recorded by a mocked narrow delegate.
pub(crate) type Calls<T> = Arc<Mutex<Vec<T>>>;

pub(crate) fn mock_session_delegate() -> (
    DynCreateServerSessionDelegate,
    Calls<(OwnedIdentity, Option<Bytes>)>,
) {
    let calls: Calls<_> = Default::default();
    let mut mock = MockCreateServerSessionDelegate::new();
    mock.expect_create_server_session().returning({
        let calls = calls.clone();
        move |identity, token| calls.lock().unwrap().push((identity, token))
    });
    (Arc::new(mock), calls)
}

pub(crate) fn mock_delete_delegate(
) -> (DynDeleteMessageDelegate, Calls<(OwnedIdentity, MessageUid, bool)>) {
    let calls: Calls<_> = Default::default();
    let mut mock = MockDeleteMessageDelegate::new();
    mock.expect_delete_message().returning({
        let calls = calls.clone();
        move |identity, uid, listed_only| {
            calls.lock().unwrap().push((identity, uid, listed_only))
        }
    });
    (Arc::new(mock), calls)
}

pub(crate) fn mock_push_delegate(
) -> (DynRegisterPushDelegate, Calls<OwnedIdentity>) {
    let calls: Calls<_> = Default::default();
    let mut mock = MockRegisterPushDelegate::new();
    mock.expect_reregister_push_notification().returning({
        let calls = calls.clone();
        move |identity| calls.lock().unwrap().push(identity)
    });
    (Arc::new(mock), calls)
}

pub(crate) fn mock_refresh_delegate(
) -> (DynRefreshSignedUrlDelegate, Calls<(OwnedIdentity, MessageUid, u32)>) {
    let calls: Calls<_> = Default::default();
    let mut mock = MockRefreshSignedUrlDelegate::new();
    mock.expect_refresh_signed_urls().returning({
        let calls = calls.clone();
        move |identity, uid, number| {
            calls.lock().unwrap().push((identity, uid, number))
        }
    });
    (Arc::new(mock), calls)
}

pub(crate) fn mock_list_delegate(
) -> (DynDownloadListDelegate, Calls<(OwnedIdentity, DeviceUid)>) {
    let calls: Calls<_> = Default::default();
    let mut mock = MockDownloadListDelegate::new();
    mock.expect_download_messages_and_list_attachments().returning({
        let calls = calls.clone();
        move |identity, device| calls.lock().unwrap().push((identity, device))
    });
    mock.expect_process_pushed_message().returning(|_, _| ());
    (Arc::new(mock), calls)
}

pub(crate) fn len_of<T>(calls: &Calls<T>) -> usize {
    calls.lock().unwrap().len()
}

/// Collects the notifications of one kind.
pub(crate) struct Recorder {
    _sub: Subscription,
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl Recorder {
    pub fn new(bus: &NotificationBus, kind: NotificationKind) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = bus.subscribe(kind, {
            let seen = seen.clone();
            move |n| seen.lock().unwrap().push(n.clone())
        });
        Self { _sub, seen }
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

pub(crate) fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 10,
        max_delay_ms: 50,
        ..Default::default()
    }
}

pub(crate) fn slow_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        ..Default::default()
    }
}
