use super::*;
use crate::test_support::*;
use netfetch_test_utils::server::Call;
use netfetch_test_utils::{enable_tracing, iter_check};
use std::sync::Mutex;
use std::time::Duration;

const TURN_URL: &str = "turn:turn.srv.example:3478";

#[derive(Debug, Default)]
struct TurnWellKnown(Mutex<bool>);

impl TurnWellKnown {
    fn create(cached: bool) -> Arc<Self> {
        Arc::new(Self(Mutex::new(cached)))
    }
}

impl WellKnownCacheDelegate for TurnWellKnown {
    fn get_web_socket_url(&self, server: ServerUrl) -> NfResult<String> {
        Err(NfError::not_cached_yet(server))
    }

    fn get_turn_urls(&self, server: ServerUrl) -> NfResult<Vec<String>> {
        let mut cached = self.0.lock().unwrap();
        if *cached {
            Ok(vec![TURN_URL.to_string()])
        } else {
            // cached by the time of the next attempt
            *cached = true;
            Err(NfError::not_cached_yet(server))
        }
    }
}

fn setup(
    h: &Harness,
    cached: bool,
) -> (
    Arc<TurnCredentialsCoordinator>,
    Calls<(OwnedIdentity, Option<Bytes>)>,
) {
    let (session, session_calls) = mock_session_delegate();
    let c = TurnCredentialsCoordinator::create(
        h.ctx.clone(),
        fast_backoff(),
        TurnWellKnown::create(cached),
        session,
    );
    (c, session_calls)
}

fn request(identity: &OwnedIdentity) -> TurnRequest {
    TurnRequest {
        identity: identity.clone(),
        call_uuid: "call-1".to_string(),
        caller_username: "alice".to_string(),
        callee_username: "bob".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn credentials_are_announced_with_turn_servers() {
    enable_tracing();
    let h = Harness::new();
    let received = h.record(NotificationKind::TurnCredentialsReceived);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let (c, _) = setup(&h, true);

    c.get_turn_credentials(request(&info.identity));

    iter_check!({
        if received.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::TurnCredentialsReceived {
            identity: info.identity.clone(),
            call_uuid: "call-1".to_string(),
            credentials: TurnCredentials {
                caller_username: "alice".to_string(),
                caller_password: "caller-pw".to_string(),
                callee_username: "bob".to_string(),
                callee_password: "callee-pw".to_string(),
            },
            turn_servers: vec![TURN_URL.to_string()],
        }],
        received.all()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_denied_is_a_terminal_failure() {
    let h = Harness::new();
    let failed = h.record(NotificationKind::TurnCredentialsFailed);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    h.server.script_turn(Err(ServerError::PermissionDenied));
    let (c, _) = setup(&h, true);

    c.get_turn_credentials(request(&info.identity));

    iter_check!({
        if failed.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::TurnCredentialsFailed {
            identity: info.identity.clone(),
            call_uuid: "call-1".to_string(),
            failure: TurnCredentialsFailure::PermissionDenied,
        }],
        failed.all()
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        1,
        h.server
            .count_calls(|c| matches!(c, Call::GetTurnCredentials(..)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_identity_fails_immediately() {
    let h = Harness::new();
    let failed = h.record(NotificationKind::TurnCredentialsFailed);
    let info = h.add_identity(false);
    let (c, _) = setup(&h, true);

    c.get_turn_credentials(request(&info.identity));

    iter_check!({
        if failed.len() == 1 {
            break;
        }
    });
    assert_eq!(
        vec![Notification::TurnCredentialsFailed {
            identity: info.identity.clone(),
            call_uuid: "call-1".to_string(),
            failure: TurnCredentialsFailure::IdentityInactive,
        }],
        failed.all()
    );
    assert_eq!(0, h.server.calls().len());
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_session_is_recreated_then_retried() {
    let h = Harness::new();
    let received = h.record(NotificationKind::TurnCredentialsReceived);
    let info = h.add_identity(true);
    let token = h.add_session(&info.identity).await;
    h.server.script_turn(Err(ServerError::InvalidSession));
    let (c, session_calls) = setup(&h, true);

    c.get_turn_credentials(request(&info.identity));

    iter_check!({
        if len_of(&session_calls) == 1 {
            break;
        }
    });
    assert_eq!(
        vec![(info.identity.clone(), Some(token))],
        session_calls.lock().unwrap().clone()
    );
    h.post_session_created(&info.identity);

    iter_check!({
        if received.len() == 1 {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn uncached_turn_urls_are_retried() {
    let h = Harness::new();
    let received = h.record(NotificationKind::TurnCredentialsReceived);
    let info = h.add_identity(true);
    h.add_session(&info.identity).await;
    let (c, _) = setup(&h, false);

    c.get_turn_credentials(request(&info.identity));

    iter_check!({
        if received.len() == 1 {
            break;
        }
    });
    assert_eq!(
        1,
        h.server
            .count_calls(|c| matches!(c, Call::GetTurnCredentials(..)))
    );
}
