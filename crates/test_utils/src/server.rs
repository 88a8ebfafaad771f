//! A scriptable in-process [ServerApi].

use bytes::Bytes;
use netfetch_api::{record::*, server::*, *};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A server call recorded by [FakeServerApi].
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Call {
    RequestChallenge(OwnedIdentity),
    GetToken(OwnedIdentity),
    QueryApiKeyStatus(OwnedIdentity, String),
    ListMessages(OwnedIdentity, Bytes),
    DownloadChunk(String),
    RefreshSignedUrls(OwnedIdentity, MessageUid),
    DownloadExtendedPayload(OwnedIdentity, MessageUid),
    DeleteMessages(OwnedIdentity, Vec<(MessageUid, bool)>),
    RegisterPush(OwnedIdentity),
    ExecuteQuery(OwnedIdentity, String),
    DownloadUserData(OwnedIdentity, Bytes),
    GetTurnCredentials(OwnedIdentity),
    QueryFreeTrial(OwnedIdentity),
    StartFreeTrial(OwnedIdentity),
    VerifyReceipt(OwnedIdentity, String),
    DownloadWellKnown(ServerUrl),
}

#[derive(Debug, Default)]
struct Scripts {
    challenge: VecDeque<ServerResult<SessionChallenge>>,
    token: VecDeque<ServerResult<(Bytes, ApiKeyStatus)>>,
    api_key_status: VecDeque<ServerResult<ApiKeyStatus>>,
    list: VecDeque<ServerResult<MessageListing>>,
    chunk: VecDeque<ServerResult<Bytes>>,
    refresh: VecDeque<ServerResult<Vec<(u32, Vec<String>)>>>,
    extended_payload: VecDeque<ServerResult<Bytes>>,
    delete: VecDeque<ServerResult<()>>,
    register_push: VecDeque<ServerResult<()>>,
    query: VecDeque<ServerResult<Bytes>>,
    user_data: VecDeque<ServerResult<Bytes>>,
    turn: VecDeque<ServerResult<TurnCredentials>>,
    free_trial_query: VecDeque<ServerResult<FreeTrialAvailability>>,
    free_trial_start: VecDeque<ServerResult<ApiKeyStatus>>,
    receipt: VecDeque<ServerResult<ApiKeyStatus>>,
    well_known: VecDeque<ServerResult<String>>,
}

#[derive(Debug, Default)]
struct State {
    scripts: Scripts,
    calls: Vec<Call>,
    token_counter: u32,
}

/// A scriptable in-process [ServerApi].
///
/// Each call pops the next scripted result for its method, falling back to
/// a successful default when nothing is scripted. All calls are recorded.
#[derive(Debug)]
pub struct FakeServerApi {
    state: Mutex<State>,
    chunk_gate: tokio::sync::watch::Sender<bool>,
}

fn next<T>(
    queue: &mut VecDeque<ServerResult<T>>,
    default: impl FnOnce() -> ServerResult<T>,
) -> ServerResult<T> {
    queue.pop_front().unwrap_or_else(default)
}

macro_rules! script_fn {
    ($(#[$m:meta])* $name:ident, $field:ident, $t:ty) => {
        $(#[$m])*
        pub fn $name(&self, result: ServerResult<$t>) {
            self.state.lock().unwrap().scripts.$field.push_back(result);
        }
    };
}

impl FakeServerApi {
    /// Construct a new FakeServerApi.
    pub fn create() -> Arc<Self> {
        let (chunk_gate, _) = tokio::sync::watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(State::default()),
            chunk_gate,
        })
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Count the calls matching a predicate.
    pub fn count_calls(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| f(c)).count()
    }

    /// Make chunk downloads block until [FakeServerApi::open_chunk_gate].
    pub fn close_chunk_gate(&self) {
        self.chunk_gate.send_replace(false);
    }

    /// Let blocked chunk downloads proceed.
    pub fn open_chunk_gate(&self) {
        self.chunk_gate.send_replace(true);
    }

    script_fn!(
        /// Script the next challenge request.
        script_challenge, challenge, SessionChallenge
    );
    script_fn!(
        /// Script the next token request.
        script_token, token, (Bytes, ApiKeyStatus)
    );
    script_fn!(
        /// Script the next api key status query.
        script_api_key_status, api_key_status, ApiKeyStatus
    );
    script_fn!(
        /// Script the next listing.
        script_list, list, MessageListing
    );
    script_fn!(
        /// Script the next chunk download.
        script_chunk, chunk, Bytes
    );
    script_fn!(
        /// Script the next signed url refresh.
        script_refresh, refresh, Vec<(u32, Vec<String>)>
    );
    script_fn!(
        /// Script the next extended payload download.
        script_extended_payload, extended_payload, Bytes
    );
    script_fn!(
        /// Script the next deletion.
        script_delete, delete, ()
    );
    script_fn!(
        /// Script the next push registration.
        script_register_push, register_push, ()
    );
    script_fn!(
        /// Script the next signed query.
        script_query, query, Bytes
    );
    script_fn!(
        /// Script the next user-data download.
        script_user_data, user_data, Bytes
    );
    script_fn!(
        /// Script the next TURN credentials request.
        script_turn, turn, TurnCredentials
    );
    script_fn!(
        /// Script the next free trial query.
        script_free_trial_query, free_trial_query, FreeTrialAvailability
    );
    script_fn!(
        /// Script the next free trial start.
        script_free_trial_start, free_trial_start, ApiKeyStatus
    );
    script_fn!(
        /// Script the next receipt verification.
        script_receipt, receipt, ApiKeyStatus
    );
    script_fn!(
        /// Script the next well-known download.
        script_well_known, well_known, String
    );

    fn record(&self, call: Call) -> std::sync::MutexGuard<'_, State> {
        let mut lock = self.state.lock().unwrap();
        lock.calls.push(call);
        lock
    }
}

impl ServerApi for FakeServerApi {
    fn request_challenge(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, ServerResult<SessionChallenge>> {
        let mut lock = self.record(Call::RequestChallenge(identity));
        let r = next(&mut lock.scripts.challenge, || {
            Ok(SessionChallenge {
                challenge: Bytes::from_static(b"challenge"),
                nonce: Bytes::from_static(b"nonce"),
            })
        });
        Box::pin(async move { r })
    }

    fn get_token(
        &self,
        identity: OwnedIdentity,
        _nonce: Bytes,
        _signature: Bytes,
    ) -> BoxFut<'_, ServerResult<(Bytes, ApiKeyStatus)>> {
        let mut lock = self.record(Call::GetToken(identity));
        lock.token_counter += 1;
        let n = lock.token_counter;
        let r = next(&mut lock.scripts.token, || {
            Ok((Bytes::from(format!("token-{n}")), ApiKeyStatus::Valid))
        });
        Box::pin(async move { r })
    }

    fn query_api_key_status(
        &self,
        identity: OwnedIdentity,
        api_key: String,
    ) -> BoxFut<'_, ServerResult<ApiKeyStatus>> {
        let mut lock = self.record(Call::QueryApiKeyStatus(identity, api_key));
        let r = next(&mut lock.scripts.api_key_status, || {
            Ok(ApiKeyStatus::Valid)
        });
        Box::pin(async move { r })
    }

    fn list_messages(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        _device_uid: DeviceUid,
    ) -> BoxFut<'_, ServerResult<MessageListing>> {
        let mut lock = self.record(Call::ListMessages(identity, token));
        let r = next(&mut lock.scripts.list, || {
            Ok(MessageListing {
                messages: Vec::new(),
                truncated: false,
            })
        });
        Box::pin(async move { r })
    }

    fn download_chunk(&self, url: String) -> BoxFut<'_, ServerResult<Bytes>> {
        let r = {
            let mut lock = self.record(Call::DownloadChunk(url.clone()));
            next(&mut lock.scripts.chunk, || Ok(Bytes::from(url)))
        };
        let mut gate = self.chunk_gate.subscribe();
        Box::pin(async move {
            loop {
                let open = *gate.borrow_and_update();
                if open || gate.changed().await.is_err() {
                    break;
                }
            }
            r
        })
    }

    fn refresh_signed_urls(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
        uid: MessageUid,
    ) -> BoxFut<'_, ServerResult<Vec<(u32, Vec<String>)>>> {
        let mut lock = self.record(Call::RefreshSignedUrls(identity, uid));
        let r = next(&mut lock.scripts.refresh, || Ok(Vec::new()));
        Box::pin(async move { r })
    }

    fn download_extended_payload(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
        uid: MessageUid,
    ) -> BoxFut<'_, ServerResult<Bytes>> {
        let mut lock =
            self.record(Call::DownloadExtendedPayload(identity, uid));
        let r = next(&mut lock.scripts.extended_payload, || {
            Ok(Bytes::from_static(b"extended payload"))
        });
        Box::pin(async move { r })
    }

    fn delete_messages(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
        _device_uid: DeviceUid,
        items: Vec<(MessageUid, bool)>,
    ) -> BoxFut<'_, ServerResult<()>> {
        let mut lock = self.record(Call::DeleteMessages(identity, items));
        let r = next(&mut lock.scripts.delete, || Ok(()));
        Box::pin(async move { r })
    }

    fn register_push(
        &self,
        _token: Bytes,
        config: PushNotificationConfiguration,
    ) -> BoxFut<'_, ServerResult<()>> {
        let mut lock = self.record(Call::RegisterPush(config.identity));
        let r = next(&mut lock.scripts.register_push, || Ok(()));
        Box::pin(async move { r })
    }

    fn execute_query(
        &self,
        identity: OwnedIdentity,
        method: String,
        body: Bytes,
    ) -> BoxFut<'_, ServerResult<Bytes>> {
        let mut lock = self.record(Call::ExecuteQuery(identity, method));
        let r = next(&mut lock.scripts.query, || Ok(body));
        Box::pin(async move { r })
    }

    fn download_user_data(
        &self,
        identity: OwnedIdentity,
        label: Bytes,
    ) -> BoxFut<'_, ServerResult<Bytes>> {
        let mut lock = self.record(Call::DownloadUserData(identity, label));
        let r = next(&mut lock.scripts.user_data, || {
            Ok(Bytes::from_static(b"user data"))
        });
        Box::pin(async move { r })
    }

    fn get_turn_credentials(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
        caller_username: String,
        callee_username: String,
    ) -> BoxFut<'_, ServerResult<TurnCredentials>> {
        let mut lock = self.record(Call::GetTurnCredentials(identity));
        let r = next(&mut lock.scripts.turn, || {
            Ok(TurnCredentials {
                caller_username,
                caller_password: "caller-pw".into(),
                callee_username,
                callee_password: "callee-pw".into(),
            })
        });
        Box::pin(async move { r })
    }

    fn query_free_trial(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
    ) -> BoxFut<'_, ServerResult<FreeTrialAvailability>> {
        let mut lock = self.record(Call::QueryFreeTrial(identity));
        let r = next(&mut lock.scripts.free_trial_query, || {
            Ok(FreeTrialAvailability { available: true })
        });
        Box::pin(async move { r })
    }

    fn start_free_trial(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
    ) -> BoxFut<'_, ServerResult<ApiKeyStatus>> {
        let mut lock = self.record(Call::StartFreeTrial(identity));
        let r = next(&mut lock.scripts.free_trial_start, || {
            Ok(ApiKeyStatus::FreeTrial)
        });
        Box::pin(async move { r })
    }

    fn verify_receipt(
        &self,
        identity: OwnedIdentity,
        _token: Bytes,
        store_token: String,
    ) -> BoxFut<'_, ServerResult<ApiKeyStatus>> {
        let mut lock = self.record(Call::VerifyReceipt(identity, store_token));
        let r = next(&mut lock.scripts.receipt, || Ok(ApiKeyStatus::Valid));
        Box::pin(async move { r })
    }

    fn download_well_known(
        &self,
        server: ServerUrl,
    ) -> BoxFut<'_, ServerResult<String>> {
        let mut lock = self.record(Call::DownloadWellKnown(server.clone()));
        let r = next(&mut lock.scripts.well_known, || {
            Ok(format!(
                r#"{{"webSocketUrl":"wss://ws.{}","turnServerUrls":["turn:{}"]}}"#,
                server.as_str().trim_start_matches("https://"),
                server.as_str().trim_start_matches("https://"),
            ))
        });
        Box::pin(async move { r })
    }
}
