use super::*;
use crate::test_support::*;
use bytes::Bytes;
use netfetch_api::record::InboxMessageStatus;
use netfetch_api::store::FetchStore;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};
use std::time::Duration;

struct Setup {
    h: Harness,
    c: Arc<DownloadAttachmentCoordinator>,
    refresh_calls: Calls<(OwnedIdentity, MessageUid, u32)>,
    delete_calls: Calls<(OwnedIdentity, MessageUid, bool)>,
}

fn setup() -> Setup {
    let h = Harness::new();
    let (refresh, refresh_calls) = mock_refresh_delegate();
    let (delete, delete_calls) = mock_delete_delegate();
    let c = DownloadAttachmentCoordinator::create(
        h.ctx.clone(),
        DownloadAttachmentConfig::default(),
        fast_backoff(),
        refresh,
        delete,
    );
    Setup {
        h,
        c,
        refresh_calls,
        delete_calls,
    }
}

fn chunk_calls(h: &Harness) -> Vec<String> {
    h.server
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::DownloadChunk(url) => Some(url),
            _ => None,
        })
        .collect()
}

fn finished(
    identity: &OwnedIdentity,
    uid: &MessageUid,
    number: u32,
) -> Notification {
    Notification::AttachmentDownloadFinished {
        identity: identity.clone(),
        uid: uid.clone(),
        number,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn downloads_every_chunk_and_reports_progress() {
    enable_tracing();
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let progress = h.record(NotificationKind::AttachmentDownloadProgress);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[3]);

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert_eq!(vec![finished(&info.identity, &uid, 0)], done.all());
    assert_eq!(
        (0..3)
            .map(|i| Bytes::from(chunk_url(&uid, 0, i)))
            .collect::<Vec<_>>(),
        h.store.attachment_data(&info.identity, &uid, 0)
    );
    let fractions = progress
        .all()
        .into_iter()
        .filter_map(|n| match n {
            Notification::AttachmentDownloadProgress { progress, .. } => {
                Some(progress)
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(3, fractions.len());
    assert_eq!(1.0, fractions[2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn download_resumes_after_received_chunks() {
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[3]);
    h.store
        .write_attachment_chunk(
            info.identity.clone(),
            uid.clone(),
            0,
            0,
            Bytes::from_static(b"first"),
        )
        .await
        .unwrap();

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Timestamp,
        0,
    )
    .await
    .unwrap();

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![chunk_url(&uid, 0, 1), chunk_url(&uid, 0, 2)],
        chunk_calls(&h)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_url_waits_for_refresh() {
    enable_tracing();
    let Setup {
        h,
        c,
        refresh_calls,
        ..
    } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[1]);
    h.server.script_chunk(Err(ServerError::SignedUrlExpired));

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    iter_check!({
        if len_of(&refresh_calls) == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(info.identity.clone(), uid.clone(), 0)],
        *refresh_calls.lock().unwrap()
    );
    assert!(c
        .inner
        .awaiting_url
        .contains(&(info.identity.clone(), uid.clone(), 0)));
    assert_eq!(0, done.len());

    h.ctx.bus.post(Notification::SignedUrlRefreshed {
        identity: info.identity.clone(),
        uid: uid.clone(),
        number: 0,
    });

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert_eq!(2, chunk_calls(&h).len());
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_identity_resumes_on_activation() {
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(false);
    let uid = h.add_message(&info.identity, &[1]);

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    iter_check!({
        if c.inner.awaiting_active.contains(&info.identity) {
            break;
        }
    });
    assert!(chunk_calls(&h).is_empty());

    // a deactivation does not release anything
    h.ctx.bus.post(Notification::OwnedIdentityActiveStatusChanged {
        identity: info.identity.clone(),
        active: false,
    });
    h.store
        .set_owned_identity_active(info.identity.clone(), true)
        .await
        .unwrap();
    h.ctx.bus.post(Notification::OwnedIdentityActiveStatusChanged {
        identity: info.identity.clone(),
        active: true,
    });

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert!(!c.inner.awaiting_active.contains(&info.identity));
}

#[tokio::test(flavor = "multi_thread")]
async fn activation_before_parking_is_not_missed() {
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(false);
    let uid = h.add_message(&info.identity, &[1]);
    h.store.activate_after_next_read(info.identity.clone());

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert!(!c.inner.awaiting_active.contains(&info.identity));
    assert_eq!(1, chunk_calls(&h).len());
}

#[tokio::test(flavor = "multi_thread")]
async fn decryption_error_fails_and_deletes_consumed_message() {
    enable_tracing();
    let Setup {
        h,
        c,
        delete_calls,
        ..
    } = setup();
    let failed = h.record(NotificationKind::AttachmentDownloadFailed);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[2]);
    let mut m = h.store.inbox_message(&info.identity, &uid).unwrap();
    m.status = InboxMessageStatus::MarkedForDeletion;
    h.store.add_inbox_message(m);
    h.crypto.fail_on(Bytes::from(chunk_url(&uid, 0, 0)));

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

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
            failure: AttachmentFailure::DecryptionError,
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
        vec![(info.identity.clone(), uid.clone(), false)],
        *delete_calls.lock().unwrap()
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(1, chunk_calls(&h).len());
}

#[tokio::test(flavor = "multi_thread")]
async fn network_error_is_retried() {
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[1]);
    h.server
        .script_chunk(Err(ServerError::Network("offline".into())));

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert_eq!(2, chunk_calls(&h).len());
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_stops_an_executing_download() {
    enable_tracing();
    let Setup { h, c, .. } = setup();
    let paused = h.record(NotificationKind::AttachmentDownloadPaused);
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[1]);
    h.server.close_chunk_gate();

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    iter_check!({
        if chunk_calls(&h).len() == 1 {
            break;
        }
    });
    c.pause_attachment_download(info.identity.clone(), uid.clone(), 0)
        .await
        .unwrap();

    iter_check!({
        if paused.len() == 1 {
            break;
        }
    });
    assert!(
        !h.store
            .inbox_attachment(&info.identity, &uid, 0)
            .unwrap()
            .download_requested
    );

    h.server.open_chunk_gate();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(0, done.len());
    assert_eq!(1, paused.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_is_announced_once_whether_queued_or_not() {
    let Setup { h, c, .. } = setup();
    let paused = h.record(NotificationKind::AttachmentDownloadPaused);
    let info = h.add_identity(true);
    h.server.close_chunk_gate();

    // fill every weight worker
    for _ in 0..4 {
        let uid = h.add_message(&info.identity, &[1]);
        c.request_download(
            info.identity.clone(),
            uid,
            0,
            PriorityCategory::Weight,
            10,
        )
        .await
        .unwrap();
    }
    iter_check!({
        if chunk_calls(&h).len() == 4 {
            break;
        }
    });

    let waiting = h.add_message(&info.identity, &[1]);
    c.request_download(
        info.identity.clone(),
        waiting.clone(),
        0,
        PriorityCategory::Weight,
        50,
    )
    .await
    .unwrap();
    c.pause_attachment_download(info.identity.clone(), waiting.clone(), 0)
        .await
        .unwrap();

    let idle = h.add_message(&info.identity, &[1]);
    c.pause_attachment_download(info.identity.clone(), idle.clone(), 0)
        .await
        .unwrap();

    iter_check!({
        if paused.len() == 2 {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut announced = paused
        .all()
        .into_iter()
        .filter_map(|n| match n {
            Notification::AttachmentDownloadPaused { uid, .. } => Some(uid),
            _ => None,
        })
        .collect::<Vec<_>>();
    announced.sort();
    let mut expected = vec![waiting.clone(), idle];
    expected.sort();
    assert_eq!(expected, announced);
    assert!(!chunk_calls(&h).contains(&chunk_url(&waiting, 0, 0)));
}

#[tokio::test(flavor = "multi_thread")]
async fn attachment_is_downloaded_in_one_category_only() {
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let uid = h.add_message(&info.identity, &[1]);
    h.server.close_chunk_gate();

    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();
    c.request_download(
        info.identity.clone(),
        uid.clone(),
        0,
        PriorityCategory::Timestamp,
        10,
    )
    .await
    .unwrap();

    h.server.open_chunk_gate();
    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(1, chunk_calls(&h).len());
    assert_eq!(1, done.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn urgent_request_preempts_least_urgent_download() {
    enable_tracing();
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let id = &info.identity;
    h.server.close_chunk_gate();

    let running = [50, 80, 90, 100]
        .into_iter()
        .map(|priority| (h.add_message(id, &[1]), priority))
        .collect::<Vec<_>>();
    for (uid, priority) in running.iter() {
        c.request_download(
            id.clone(),
            uid.clone(),
            0,
            PriorityCategory::Weight,
            *priority,
        )
        .await
        .unwrap();
    }
    iter_check!({
        if chunk_calls(&h).len() == 4 {
            break;
        }
    });
    assert_eq!(4, c.inner.weight.executing_count());

    let urgent = h.add_message(id, &[1]);
    c.request_download(
        id.clone(),
        urgent.clone(),
        0,
        PriorityCategory::Weight,
        10,
    )
    .await
    .unwrap();

    let least_urgent = attachment_key(id, &running[3].0, 0);
    iter_check!({
        if chunk_calls(&h).contains(&chunk_url(&urgent, 0, 0))
            && c.inner.weight.state_of(&least_urgent)
                == Some(OperationState::Pending)
        {
            break;
        }
    });
    assert_eq!(4, c.inner.weight.executing_count());
    for (uid, _) in running.iter().take(3) {
        assert_eq!(
            Some(OperationState::Executing),
            c.inner.weight.state_of(&attachment_key(id, uid, 0))
        );
    }

    h.server.open_chunk_gate();
    iter_check!(2000, {
        if done.len() == 5 {
            break;
        }
    });
    // the preempted download started over once
    assert_eq!(
        2,
        chunk_calls(&h)
            .iter()
            .filter(|url| **url == chunk_url(&running[3].0, 0, 0))
            .count()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn requested_downloads_resume_on_startup() {
    let Setup { h, c, .. } = setup();
    let done = h.record(NotificationKind::AttachmentDownloadFinished);
    let info = h.add_identity(true);
    let requested = h.add_message(&info.identity, &[1]);
    let mut att = h
        .store
        .inbox_attachment(&info.identity, &requested, 0)
        .unwrap();
    att.download_requested = true;
    h.store.add_inbox_attachment(att);
    let _ignored = h.add_message(&info.identity, &[1]);

    c.resume_downloads_on_startup().await.unwrap();

    iter_check!({
        if done.len() == 1 {
            break;
        }
    });
    assert_eq!(vec![finished(&info.identity, &requested, 0)], done.all());
    assert_eq!(vec![chunk_url(&requested, 0, 0)], chunk_calls(&h));
}
