use crate::framework::*;
use netfetch_api::notification::*;
use netfetch_api::*;
use netfetch_test_utils::{enable_tracing, id::random_identity, iter_check};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn collect(
    bus: &NotificationBus,
    kind: NotificationKind,
) -> (Subscription, Arc<Mutex<Vec<Notification>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sub = bus.subscribe(kind, {
        let seen = seen.clone();
        move |n| seen.lock().unwrap().push(n.clone())
    });
    (sub, seen)
}

fn poll_completed(identity: &OwnedIdentity) -> Notification {
    Notification::ServerPollCompleted {
        identity: identity.clone(),
        success: true,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delivers_in_post_order() {
    enable_tracing();
    let bus = NotificationBus::create();
    let (_sub, seen) = collect(&bus, NotificationKind::ServerPollCompleted);

    let identities = (0..20).map(|_| random_identity()).collect::<Vec<_>>();
    for identity in identities.iter() {
        bus.post(poll_completed(identity));
    }

    iter_check!({
        if seen.lock().unwrap().len() == identities.len() {
            break;
        }
    });

    let expected = identities.iter().map(poll_completed).collect::<Vec<_>>();
    assert_eq!(expected, *seen.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn only_matching_kind_is_delivered() {
    let bus = NotificationBus::create();
    let (_sub1, polls) = collect(&bus, NotificationKind::ServerPollCompleted);
    let (_sub2, lists) =
        collect(&bus, NotificationKind::OwnedIdentityListUpdated);

    bus.post(Notification::OwnedIdentityListUpdated);
    iter_check!({
        if lists.lock().unwrap().len() == 1 {
            break;
        }
    });
    assert!(polls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribed_listener_is_not_called() {
    let bus = NotificationBus::create();
    let (sub, seen) = collect(&bus, NotificationKind::OwnedIdentityListUpdated);
    let (_keep, kept) =
        collect(&bus, NotificationKind::OwnedIdentityListUpdated);

    sub.unsubscribe();
    bus.post(Notification::OwnedIdentityListUpdated);

    iter_check!({
        if kept.lock().unwrap().len() == 1 {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_listener_does_not_stop_dispatch() {
    let bus = NotificationBus::create();
    let _bad = bus.subscribe(NotificationKind::OwnedIdentityListUpdated, |_| {
        panic!("listener panic")
    });
    let (_sub, seen) = collect(&bus, NotificationKind::OwnedIdentityListUpdated);

    bus.post(Notification::OwnedIdentityListUpdated);
    bus.post(Notification::OwnedIdentityListUpdated);
    iter_check!({
        if seen.lock().unwrap().len() == 2 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_a_listener_that_owns_a_subscription_returns() {
    let bus = NotificationBus::create();
    let (inner, inner_seen) =
        collect(&bus, NotificationKind::OwnedIdentityListUpdated);
    let outer =
        bus.subscribe(NotificationKind::ServerPollCompleted, move |_| {
            let _ = &inner;
        });

    let dropped = tokio::task::spawn_blocking(move || drop(outer));
    tokio::time::timeout(Duration::from_secs(5), dropped)
        .await
        .unwrap()
        .unwrap();

    // the owned subscription went away with its listener
    let (_sub, seen) =
        collect(&bus, NotificationKind::OwnedIdentityListUpdated);
    bus.post(Notification::OwnedIdentityListUpdated);
    iter_check!({
        if seen.lock().unwrap().len() == 1 {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(inner_seen.lock().unwrap().is_empty());
}
