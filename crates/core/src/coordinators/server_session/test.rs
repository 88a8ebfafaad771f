use super::*;
use crate::test_support::*;
use netfetch_api::store::FetchStore;
use netfetch_test_utils::{enable_tracing, id::random_identity, iter_check};
use netfetch_test_utils::server::Call;
use std::time::Duration;

fn setup(h: &Harness, backoff: BackoffConfig) -> Arc<ServerSessionCoordinator> {
    ServerSessionCoordinator::create(
        h.ctx.clone(),
        ServerSessionConfig::default(),
        backoff,
    )
}

fn server_calls(h: &Harness) -> usize {
    h.server.count_calls(|c| {
        matches!(c, Call::RequestChallenge(_) | Call::GetToken(_))
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn creates_session_and_announces_it() {
    enable_tracing();
    let h = Harness::new();
    let created = h.record(NotificationKind::ServerSessionCreated);
    let info = h.add_identity(true);
    let c = setup(&h, fast_backoff());

    c.create_server_session(info.identity.clone(), None);

    iter_check!({
        if created.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::ServerSessionCreated {
            identity: info.identity.clone()
        }],
        created.all()
    );
    assert_eq!(
        Some(Bytes::from_static(b"token-1")),
        h.store
            .get_server_session_token(info.identity.clone())
            .await
            .unwrap()
    );
    assert_eq!(2, server_calls(&h));
}

#[tokio::test(flavor = "multi_thread")]
async fn refreshed_session_is_not_refreshed_again() {
    enable_tracing();
    let h = Harness::new();
    let created = h.record(NotificationKind::ServerSessionCreated);
    let info = h.add_identity(true);
    let current = h.add_session(&info.identity).await;
    let c = setup(&h, fast_backoff());

    // another workflow already replaced the refused token
    c.create_server_session(
        info.identity.clone(),
        Some(Bytes::from_static(b"stale")),
    );

    iter_check!({
        if created.len() == 1 {
            break;
        }
    });
    assert_eq!(0, server_calls(&h));
    assert_eq!(
        Some(current),
        h.store
            .get_server_session_token(info.identity.clone())
            .await
            .unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_token_is_replaced() {
    enable_tracing();
    let h = Harness::new();
    let created = h.record(NotificationKind::ServerSessionCreated);
    let info = h.add_identity(true);
    let refused = h.add_session(&info.identity).await;
    let c = setup(&h, fast_backoff());

    c.create_server_session(info.identity.clone(), Some(refused.clone()));

    iter_check!({
        if created.len() == 1 {
            break;
        }
    });
    let token = h
        .store
        .get_server_session_token(info.identity.clone())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(refused, token);
    assert_eq!(2, server_calls(&h));
}

#[tokio::test(flavor = "multi_thread")]
async fn network_failure_is_retried() {
    enable_tracing();
    let h = Harness::new();
    let created = h.record(NotificationKind::ServerSessionCreated);
    let info = h.add_identity(true);
    h.server
        .script_challenge(Err(ServerError::Network("offline".into())));
    h.server
        .script_challenge(Err(ServerError::Network("offline".into())));
    let c = setup(&h, fast_backoff());

    c.create_server_session(info.identity.clone(), None);

    iter_check!(2000, {
        if created.len() == 1 {
            break;
        }
    });
    assert_eq!(
        3,
        h.server
            .count_calls(|c| matches!(c, Call::RequestChallenge(_)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_scheduled_runs_pending_retry_now() {
    let h = Harness::new();
    let created = h.record(NotificationKind::ServerSessionCreated);
    let info = h.add_identity(true);
    h.server
        .script_challenge(Err(ServerError::Network("offline".into())));
    let c = setup(&h, slow_backoff());

    c.create_server_session(info.identity.clone(), None);
    iter_check!({
        if c.inner.backoff.scheduled_count() == 1 {
            break;
        }
    });

    c.retry_scheduled();
    iter_check!({
        if created.len() == 1 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_identity_is_dropped() {
    let h = Harness::new();
    let created = h.record(NotificationKind::ServerSessionCreated);
    let c = setup(&h, fast_backoff());

    c.create_server_session(random_identity(), None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(0, created.len());
    assert_eq!(0, server_calls(&h));
    assert_eq!(0, c.inner.backoff.scheduled_count());
}

#[tokio::test(flavor = "multi_thread")]
async fn api_key_status_query() {
    enable_tracing();
    let h = Harness::new();
    let success = h.record(NotificationKind::ApiKeyStatusQuerySuccess);
    let failed = h.record(NotificationKind::ApiKeyStatusQueryFailed);
    let info = h.add_identity(true);
    let c = setup(&h, fast_backoff());

    h.server.script_api_key_status(Ok(ApiKeyStatus::Expired));
    c.query_api_key_status(info.identity.clone(), "key-1".into());
    iter_check!({
        if success.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::ApiKeyStatusQuerySuccess {
            identity: info.identity.clone(),
            api_key: "key-1".into(),
            status: ApiKeyStatus::Expired,
        }],
        success.all()
    );

    h.server
        .script_api_key_status(Err(ServerError::PermissionDenied));
    c.query_api_key_status(info.identity.clone(), "key-2".into());
    iter_check!({
        if failed.len() == 1 {
            break;
        }
    });
}
