use super::*;
use crate::test_support::*;
use netfetch_api::record::*;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};

struct Setup {
    h: Harness,
    c: Arc<SignedUrlRefreshCoordinator>,
    session_calls: Calls<(OwnedIdentity, Option<Bytes>)>,
    delete_calls: Calls<(OwnedIdentity, MessageUid, bool)>,
}

fn setup() -> Setup {
    let h = Harness::new();
    let (session, session_calls) = mock_session_delegate();
    let (delete, delete_calls) = mock_delete_delegate();
    let c = SignedUrlRefreshCoordinator::create(
        h.ctx.clone(),
        SignedUrlRefreshConfig::default(),
        fast_backoff(),
        session,
        delete,
    );
    Setup {
        h,
        c,
        session_calls,
        delete_calls,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_urls_are_saved_and_announced() {
    enable_tracing();
    let Setup { h, c, .. } = setup();
    let refreshed = h.record(NotificationKind::SignedUrlRefreshed);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uid = h.add_message(&info.identity, &[2]);
    h.server
        .script_refresh(Ok(vec![(0, vec!["new-0".into(), "new-1".into()])]));

    c.refresh_signed_urls(info.identity.clone(), uid.clone(), 0);

    iter_check!({
        if refreshed.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::SignedUrlRefreshed {
            identity: info.identity.clone(),
            uid: uid.clone(),
            number: 0,
        }],
        refreshed.all()
    );
    assert_eq!(
        vec!["new-0".to_string(), "new-1".to_string()],
        h.store
            .inbox_attachment(&info.identity, &uid, 0)
            .unwrap()
            .chunk_download_urls
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_session_waits_for_session() {
    enable_tracing();
    let Setup {
        h,
        c,
        session_calls,
        ..
    } = setup();
    let refreshed = h.record(NotificationKind::SignedUrlRefreshed);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[1]);

    c.refresh_signed_urls(info.identity.clone(), uid.clone(), 0);

    iter_check!({
        if len_of(&session_calls) == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(info.identity.clone(), None)],
        *session_calls.lock().unwrap()
    );
    assert_eq!(
        0,
        h.server
            .count_calls(|call| matches!(call, Call::RefreshSignedUrls(..)))
    );

    h.add_session(&info.identity).await;
    h.post_session_created(&info.identity);

    iter_check!({
        if refreshed.len() == 1 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_session_is_reported_with_its_token() {
    let Setup {
        h,
        c,
        session_calls,
        ..
    } = setup();
    let info = h.add_identity(true);
    let token = h.add_session(&info.identity).await;
    let uid = h.add_message(&info.identity, &[1]);
    h.server.script_refresh(Err(ServerError::InvalidSession));

    c.refresh_signed_urls(info.identity.clone(), uid, 0);

    iter_check!({
        if len_of(&session_calls) == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(info.identity.clone(), Some(token))],
        *session_calls.lock().unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_message_fails_the_attachment() {
    enable_tracing();
    let Setup {
        h,
        c,
        delete_calls,
        ..
    } = setup();
    let failed = h.record(NotificationKind::AttachmentDownloadFailed);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uid = h.add_message(&info.identity, &[1]);
    let mut message = h.store.inbox_message(&info.identity, &uid).unwrap();
    message.status = InboxMessageStatus::MarkedForDeletion;
    h.store.add_inbox_message(message);
    h.server.script_refresh(Err(ServerError::Deleted));

    c.refresh_signed_urls(info.identity.clone(), uid.clone(), 0);

    iter_check!({
        if failed.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::AttachmentDownloadFailed {
            identity: info.identity.clone(),
            uid: uid.clone(),
            number: 0,
            failure: AttachmentFailure::DeletedFromServer,
        }],
        failed.all()
    );
    assert!(
        h.store
            .inbox_attachment(&info.identity, &uid, 0)
            .unwrap()
            .marked_for_deletion
    );
    assert_eq!(
        vec![(info.identity.clone(), uid, false)],
        *delete_calls.lock().unwrap()
    );
}
