use super::*;
use crate::test_support::*;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};
use std::time::Duration;

fn setup(
    h: &Harness,
) -> (
    Arc<ExtendedPayloadCoordinator>,
    Calls<(OwnedIdentity, Option<Bytes>)>,
) {
    let (session, session_calls) = mock_session_delegate();
    let c = ExtendedPayloadCoordinator::create(
        h.ctx.clone(),
        fast_backoff(),
        session,
    );
    (c, session_calls)
}

fn add_message_with_payload(h: &Harness, identity: &OwnedIdentity) -> MessageUid {
    let uid = h.add_message(identity, &[]);
    let mut m = h.store.inbox_message(identity, &uid).unwrap();
    m.has_extended_payload = true;
    m.extended_payload_key = Some(Bytes::from_static(b"payload key"));
    h.store.add_inbox_message(m);
    uid
}

fn download_calls(h: &Harness) -> usize {
    h.server
        .count_calls(|c| matches!(c, Call::DownloadExtendedPayload(..)))
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_is_saved_and_announced() {
    enable_tracing();
    let h = Harness::new();
    let downloaded =
        h.record(NotificationKind::MessageExtendedPayloadDownloaded);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uid = add_message_with_payload(&h, &info.identity);
    let (c, _) = setup(&h);

    c.download_extended_payload(info.identity.clone(), uid.clone());

    iter_check!({
        if downloaded.len() == 1 {
            break;
        }
    });
    let payload = Bytes::from_static(b"extended payload");
    assert_eq!(
        vec![Notification::MessageExtendedPayloadDownloaded {
            identity: info.identity.clone(),
            uid: uid.clone(),
            payload: payload.clone(),
        }],
        downloaded.all()
    );
    assert_eq!(
        Some(payload),
        h.store
            .inbox_message(&info.identity, &uid)
            .unwrap()
            .extended_payload
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_payload_is_cleared() {
    let h = Harness::new();
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uid = add_message_with_payload(&h, &info.identity);
    h.server.script_extended_payload(Err(ServerError::Deleted));
    let (c, _) = setup(&h);

    c.download_extended_payload(info.identity.clone(), uid.clone());

    iter_check!({
        if !h
            .store
            .inbox_message(&info.identity, &uid)
            .unwrap()
            .has_extended_payload
        {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(1, download_calls(&h));
}

#[tokio::test(flavor = "multi_thread")]
async fn undecryptable_payload_is_cleared() {
    let h = Harness::new();
    let downloaded =
        h.record(NotificationKind::MessageExtendedPayloadDownloaded);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uid = add_message_with_payload(&h, &info.identity);
    h.crypto.fail_on(Bytes::from_static(b"extended payload"));
    let (c, _) = setup(&h);

    c.download_extended_payload(info.identity.clone(), uid.clone());

    iter_check!({
        if h.store
            .inbox_message(&info.identity, &uid)
            .unwrap()
            .extended_payload_key
            .is_none()
        {
            break;
        }
    });
    assert_eq!(0, downloaded.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_session_waits_for_session() {
    let h = Harness::new();
    let downloaded =
        h.record(NotificationKind::MessageExtendedPayloadDownloaded);
    let info = h.add_identity(true);
    let uid = add_message_with_payload(&h, &info.identity);
    let (c, session_calls) = setup(&h);

    c.download_extended_payload(info.identity.clone(), uid.clone());

    iter_check!({
        if len_of(&session_calls) == 1 {
            break;
        }
    });
    assert_eq!(0, download_calls(&h));

    h.add_session(&info.identity).await;
    h.post_session_created(&info.identity);

    iter_check!({
        if downloaded.len() == 1 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_queues_missing_payloads_only() {
    let h = Harness::new();
    let downloaded =
        h.record(NotificationKind::MessageExtendedPayloadDownloaded);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let missing = add_message_with_payload(&h, &info.identity);
    let present = add_message_with_payload(&h, &info.identity);
    let mut m = h.store.inbox_message(&info.identity, &present).unwrap();
    m.extended_payload = Some(Bytes::from_static(b"done"));
    h.store.add_inbox_message(m);
    h.add_message(&info.identity, &[]);
    let (c, _) = setup(&h);

    c.resume_on_startup().await.unwrap();

    iter_check!({
        if downloaded.len() == 1 {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        vec![Call::DownloadExtendedPayload(info.identity.clone(), missing)],
        h.server
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::DownloadExtendedPayload(..)))
            .collect::<Vec<_>>()
    );
}
