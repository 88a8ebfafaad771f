use super::*;
use crate::test_support::*;
use bytes::Bytes;
use netfetch_api::store::FetchStore;
use netfetch_test_utils::id::*;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};
use std::time::Duration;

#[derive(Debug)]
struct FixedWellKnown;

impl WellKnownCacheDelegate for FixedWellKnown {
    fn get_web_socket_url(&self, _server: ServerUrl) -> NfResult<String> {
        Ok("wss://ws.srv.example".to_string())
    }

    fn get_turn_urls(&self, server: ServerUrl) -> NfResult<Vec<String>> {
        Err(NfError::not_cached_yet(server))
    }
}

fn setup(h: &Harness) -> Arc<ServerQueryCoordinator> {
    ServerQueryCoordinator::create(
        h.ctx.clone(),
        ServerQueryConfig::default(),
        fast_backoff(),
        Arc::new(FixedWellKnown),
    )
}

fn add_query(
    h: &Harness,
    identity: &OwnedIdentity,
    kind: ServerQueryKind,
) -> QueryUid {
    let uid = random_query_uid();
    h.store.add_pending_server_query(PendingServerQuery {
        uid: uid.clone(),
        identity: identity.clone(),
        server: ServerUrl::from(TEST_SERVER),
        kind,
        created: Timestamp::now(),
    });
    uid
}

fn signed(body: &'static [u8]) -> ServerQueryKind {
    ServerQueryKind::Signed {
        method: "checkKeycloakRevocation".to_string(),
        body: Bytes::from_static(body),
    }
}

async fn is_pending(h: &Harness, uid: &QueryUid) -> bool {
    h.store
        .get_pending_server_query(uid.clone())
        .await
        .unwrap()
        .is_some()
}

#[tokio::test(flavor = "multi_thread")]
async fn signed_query_is_answered_then_deleted() {
    enable_tracing();
    let h = Harness::new();
    let info = h.add_identity(true);
    let uid = add_query(&h, &info.identity, signed(b"body"));
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(
            uid.clone(),
            Some(ServerResponse::Signed(Bytes::from_static(b"body")))
        )],
        h.channel.query_responses()
    );
    iter_check!({
        if !is_pending(&h, &uid).await {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_query_gets_a_null_response() {
    let h = Harness::new();
    let info = h.add_identity(true);
    let uid = add_query(&h, &info.identity, signed(b"body"));
    h.server.script_query(Err(ServerError::PermissionDenied));
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
    assert_eq!(vec![(uid.clone(), None)], h.channel.query_responses());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!is_pending(&h, &uid).await);
    assert_eq!(
        1,
        h.server.count_calls(|c| matches!(c, Call::ExecuteQuery(..)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn network_error_is_retried() {
    let h = Harness::new();
    let info = h.add_identity(true);
    let uid = add_query(&h, &info.identity, signed(b"body"));
    h.server
        .script_query(Err(ServerError::Network("unreachable".into())));
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(uid, Some(ServerResponse::Signed(Bytes::from_static(b"body"))))],
        h.channel.query_responses()
    );
    assert_eq!(
        2,
        h.server.count_calls(|c| matches!(c, Call::ExecuteQuery(..)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_identity_waits_for_activation() {
    let h = Harness::new();
    let mut info = h.add_identity(false);
    let uid = add_query(&h, &info.identity, signed(b"body"));
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.channel.query_responses().is_empty());
    assert_eq!(0, h.server.calls().len());

    info.active = true;
    h.store.add_owned_identity(info.clone());
    h.ctx.bus.post(Notification::OwnedIdentityActiveStatusChanged {
        identity: info.identity.clone(),
        active: true,
    });

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn activation_before_parking_is_not_missed() {
    let h = Harness::new();
    let info = h.add_identity(false);
    let uid = add_query(&h, &info.identity, signed(b"body"));
    h.store.activate_after_next_read(info.identity.clone());
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
    assert!(!c.inner.awaiting_active.contains(&info.identity));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_query_is_ignored() {
    let h = Harness::new();
    let c = setup(&h);

    c.post_server_query(random_query_uid()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.channel.query_responses().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_source_query_gets_a_session_number() {
    let h = Harness::new();
    let mut acceptor = h.ws.take_acceptor().unwrap();
    let info = h.add_identity(true);
    let instance = random_protocol_instance_uid();
    let uid = add_query(
        &h,
        &info.identity,
        ServerQueryKind::Transfer {
            protocol_instance: instance.clone(),
            request: TransferRequest::Source,
        },
    );
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();
    let mut peer = tokio::time::timeout(Duration::from_secs(5), acceptor.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("source", peer.recv_json().await.unwrap()["action"]);
    peer.send_text(r#"{"action":"session_number","sessionNumber":7}"#);

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(uid, Some(ServerResponse::TransferSessionNumber(7)))],
        h.channel.query_responses()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_error_frame_gets_a_null_response() {
    let h = Harness::new();
    let mut acceptor = h.ws.take_acceptor().unwrap();
    let info = h.add_identity(true);
    let uid = add_query(
        &h,
        &info.identity,
        ServerQueryKind::Transfer {
            protocol_instance: random_protocol_instance_uid(),
            request: TransferRequest::Target {
                session_number: 99,
                payload: Bytes::from_static(b"hello"),
            },
        },
    );
    let c = setup(&h);

    c.post_server_query(uid.clone()).await.unwrap();
    let peer = tokio::time::timeout(Duration::from_secs(5), acceptor.recv())
        .await
        .unwrap()
        .unwrap();
    peer.send_text(r#"{"action":"error","error":"unknown session number"}"#);

    iter_check!({
        if h.channel.query_responses().len() == 1 {
            break;
        }
    });
    assert_eq!(vec![(uid, None)], h.channel.query_responses());
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_requeues_signed_and_fails_transfers() {
    let h = Harness::new();
    let info = h.add_identity(true);
    let signed_uid = add_query(&h, &info.identity, signed(b"body"));
    let transfer_uid = add_query(
        &h,
        &info.identity,
        ServerQueryKind::Transfer {
            protocol_instance: random_protocol_instance_uid(),
            request: TransferRequest::Wait,
        },
    );
    let c = setup(&h);

    c.resume_on_startup().await.unwrap();

    iter_check!({
        if h.channel.query_responses().len() == 2 {
            break;
        }
    });
    let responses = h.channel.query_responses();
    assert!(responses.contains(&(transfer_uid.clone(), None)));
    assert!(responses.contains(&(
        signed_uid.clone(),
        Some(ServerResponse::Signed(Bytes::from_static(b"body")))
    )));
    iter_check!({
        if !is_pending(&h, &signed_uid).await
            && !is_pending(&h, &transfer_uid).await
        {
            break;
        }
    });
}
