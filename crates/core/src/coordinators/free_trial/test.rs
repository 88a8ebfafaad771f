use super::*;
use crate::test_support::*;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};

fn setup(
    h: &Harness,
) -> (
    Arc<FreeTrialCoordinator>,
    Calls<(OwnedIdentity, Option<Bytes>)>,
) {
    let (session, session_calls) = mock_session_delegate();
    let c = FreeTrialCoordinator::create(h.ctx.clone(), fast_backoff(), session);
    (c, session_calls)
}

#[tokio::test(flavor = "multi_thread")]
async fn query_start_and_receipt_are_announced() {
    enable_tracing();
    let h = Harness::new();
    let queried = h.record(NotificationKind::FreeTrialQuerySuccess);
    let started = h.record(NotificationKind::FreeTrialStartSuccess);
    let verified = h.record(NotificationKind::ReceiptVerificationSuccess);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let (c, _) = setup(&h);

    c.query_free_trial(info.identity.clone());
    c.start_free_trial(info.identity.clone());
    c.verify_receipt(info.identity.clone(), "store-tx".to_string());

    iter_check!({
        if queried.len() == 1 && started.len() == 1 && verified.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::FreeTrialQuerySuccess {
            identity: info.identity.clone(),
            available: true,
        }],
        queried.all()
    );
    assert_eq!(
        vec![Notification::FreeTrialStartSuccess {
            identity: info.identity.clone(),
            status: ApiKeyStatus::FreeTrial,
        }],
        started.all()
    );
    assert_eq!(
        vec![Notification::ReceiptVerificationSuccess {
            identity: info.identity.clone(),
            store_token: "store-tx".to_string(),
            status: ApiKeyStatus::Valid,
        }],
        verified.all()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_receipt_is_reported() {
    let h = Harness::new();
    let failed = h.record(NotificationKind::ReceiptVerificationFailed);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    h.server.script_receipt(Err(ServerError::Status(400)));
    let (c, _) = setup(&h);

    c.verify_receipt(info.identity.clone(), "store-tx".to_string());

    iter_check!({
        if failed.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::ReceiptVerificationFailed {
            identity: info.identity.clone(),
            store_token: "store-tx".to_string(),
        }],
        failed.all()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_start_is_reported() {
    let h = Harness::new();
    let failed = h.record(NotificationKind::FreeTrialStartFailed);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    h.server
        .script_free_trial_start(Err(ServerError::PermissionDenied));
    let (c, _) = setup(&h);

    c.start_free_trial(info.identity.clone());

    iter_check!({
        if failed.len() == 1 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn network_error_is_retried() {
    let h = Harness::new();
    let queried = h.record(NotificationKind::FreeTrialQuerySuccess);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    h.server
        .script_free_trial_query(Err(ServerError::Network("timeout".into())));
    let (c, _) = setup(&h);

    c.query_free_trial(info.identity.clone());

    iter_check!({
        if queried.len() == 1 {
            break;
        }
    });
    assert_eq!(
        2,
        h.server.count_calls(|c| matches!(c, Call::QueryFreeTrial(..)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_session_waits_for_session() {
    let h = Harness::new();
    let queried = h.record(NotificationKind::FreeTrialQuerySuccess);
    let info = h.add_identity(true);
    let (c, session_calls) = setup(&h);

    c.query_free_trial(info.identity.clone());

    iter_check!({
        if len_of(&session_calls) == 1 {
            break;
        }
    });
    assert_eq!(0, h.server.calls().len());

    h.add_session(&info.identity).await;
    h.post_session_created(&info.identity);

    iter_check!({
        if queried.len() == 1 {
            break;
        }
    });
}
