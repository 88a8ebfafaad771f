use super::*;
use crate::test_support::*;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};

fn setup(
    h: &Harness,
    max_batch_size: u32,
) -> (
    Arc<DeleteCoordinator>,
    Calls<(OwnedIdentity, Option<Bytes>)>,
) {
    let (session, session_calls) = mock_session_delegate();
    let c = DeleteCoordinator::create(
        h.ctx.clone(),
        DeleteConfig { max_batch_size },
        fast_backoff(),
        session,
    );
    (c, session_calls)
}

fn delete_batches(h: &Harness) -> Vec<Vec<(MessageUid, bool)>> {
    h.server
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::DeleteMessages(_, items) => Some(items),
            _ => None,
        })
        .collect()
}

// single threaded: every request is appended before the first batch runs
#[tokio::test(flavor = "current_thread")]
async fn batches_are_capped_and_followed_up() {
    enable_tracing();
    let h = Harness::new();
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uids = (0..5)
        .map(|_| h.add_message(&info.identity, &[]))
        .collect::<Vec<_>>();
    let (c, _) = setup(&h, 2);

    for uid in uids.iter() {
        c.delete_message(info.identity.clone(), uid.clone(), false);
    }

    iter_check!({
        if delete_batches(&h).len() == 3 && c.pending_count(&info.identity) == 0
        {
            break;
        }
    });
    let sizes = delete_batches(&h)
        .iter()
        .map(|b| b.len())
        .collect::<Vec<_>>();
    assert_eq!(vec![2, 2, 1], sizes);

    let sent = delete_batches(&h)
        .into_iter()
        .flatten()
        .map(|(uid, _)| uid)
        .collect::<Vec<_>>();
    assert_eq!(uids, sent);

    iter_check!({
        if uids
            .iter()
            .all(|uid| h.store.inbox_message(&info.identity, uid).is_none())
        {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn listed_only_messages_are_kept_locally() {
    let h = Harness::new();
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uid = h.add_message(&info.identity, &[]);
    let (c, _) = setup(&h, 50);

    c.delete_message(info.identity.clone(), uid.clone(), true);

    iter_check!({
        if h.store.is_listed_on_server(&info.identity, &uid) {
            break;
        }
    });
    assert!(h.store.inbox_message(&info.identity, &uid).is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn missing_session_parks_requests_until_session_created() {
    enable_tracing();
    let h = Harness::new();
    let info = h.add_identity(true);
    let uids = (0..3)
        .map(|_| h.add_message(&info.identity, &[]))
        .collect::<Vec<_>>();
    let (c, session_calls) = setup(&h, 50);

    for uid in uids.iter() {
        c.delete_message(info.identity.clone(), uid.clone(), false);
    }

    iter_check!({
        if len_of(&session_calls) == 1 {
            break;
        }
    });
    assert_eq!(3, c.pending_count(&info.identity));
    assert!(delete_batches(&h).is_empty());

    h.add_session(&info.identity).await;
    h.post_session_created(&info.identity);

    iter_check!({
        if delete_batches(&h).len() == 1 {
            break;
        }
    });
    assert_eq!(
        uids,
        delete_batches(&h)[0]
            .iter()
            .map(|(uid, _)| uid.clone())
            .collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "current_thread")]
async fn session_created_releases_only_that_identity() {
    let h = Harness::new();
    let a = h.add_identity(true);
    let b = h.add_identity(true);
    let uid_a = h.add_message(&a.identity, &[]);
    let uid_b = h.add_message(&b.identity, &[]);
    let (c, session_calls) = setup(&h, 50);

    c.delete_message(a.identity.clone(), uid_a.clone(), false);
    c.delete_message(b.identity.clone(), uid_b.clone(), false);
    iter_check!({
        if len_of(&session_calls) == 2 {
            break;
        }
    });

    h.add_session(&a.identity).await;
    h.add_session(&b.identity).await;
    h.post_session_created(&a.identity);

    iter_check!({
        if delete_batches(&h).len() == 1 {
            break;
        }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        vec![vec![(uid_a.clone(), false)]],
        delete_batches(&h)
    );
    assert_eq!(0, c.pending_count(&a.identity));
    assert_eq!(1, c.pending_count(&b.identity));

    h.post_session_created(&b.identity);
    iter_check!({
        if delete_batches(&h).len() == 2 {
            break;
        }
    });
    assert_eq!(vec![(uid_b, false)], delete_batches(&h)[1]);
}

#[tokio::test(flavor = "current_thread")]
async fn failed_batch_is_retried_in_order() {
    let h = Harness::new();
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let uids = (0..3)
        .map(|_| h.add_message(&info.identity, &[]))
        .collect::<Vec<_>>();
    h.server
        .script_delete(Err(ServerError::Network("offline".into())));
    let (c, _) = setup(&h, 50);

    for uid in uids.iter() {
        c.delete_message(info.identity.clone(), uid.clone(), false);
    }

    iter_check!(2000, {
        if delete_batches(&h).len() == 2 && c.pending_count(&info.identity) == 0
        {
            break;
        }
    });
    let batches = delete_batches(&h);
    assert_eq!(batches[0], batches[1]);
    assert_eq!(
        uids,
        batches[1]
            .iter()
            .map(|(uid, _)| uid.clone())
            .collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_identity_drops_its_requests() {
    let h = Harness::new();
    let (c, session_calls) = setup(&h, 50);
    let identity = netfetch_test_utils::id::random_identity();

    c.delete_message(
        identity.clone(),
        netfetch_test_utils::id::random_message_uid(),
        false,
    );

    iter_check!({
        if c.pending_count(&identity) == 0 {
            break;
        }
    });
    assert_eq!(0, len_of(&session_calls));
    assert!(delete_batches(&h).is_empty());
}
