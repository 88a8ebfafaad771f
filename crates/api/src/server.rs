//! The server-facing calls made by operations.
//!
//! The encoding of these calls is not part of this crate. Implementations
//! map transport failures and server status codes onto [ServerError].

use crate::record::*;
use crate::*;
use bytes::Bytes;
use std::sync::Arc;

/// Failure of a server call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    /// The request did not reach the server or the answer did not reach us.
    #[error("network error: {0}")]
    Network(String),
    /// The session token was refused.
    #[error("invalid server session")]
    InvalidSession,
    /// The identity is inactive on the server.
    #[error("identity is inactive")]
    IdentityInactive,
    /// The device is not registered on the server.
    #[error("device not registered")]
    DeviceNotRegistered,
    /// Another device is registered for this identity.
    #[error("another device is already registered")]
    AnotherDeviceIsAlreadyRegistered,
    /// The subject does not exist on the server.
    #[error("not found")]
    NotFound,
    /// The subject was deleted from the server.
    #[error("deleted from server")]
    Deleted,
    /// The subject exists but is not available yet.
    #[error("not yet available")]
    NotYetAvailable,
    /// A signed url expired.
    #[error("signed url expired")]
    SignedUrlExpired,
    /// The api key does not permit this call.
    #[error("permission denied")]
    PermissionDenied,
    /// The server does not support this call.
    #[error("not supported")]
    NotSupported,
    /// The request or the answer could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Any other server status.
    #[error("server status {0}")]
    Status(u16),
}

/// Result of a server call.
pub type ServerResult<T> = Result<T, ServerError>;

/// A nonce to sign when creating a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionChallenge {
    /// The server challenge.
    pub challenge: Bytes,
    /// Our nonce, echoed back in the token request.
    pub nonce: Bytes,
}

/// The answer to a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageListing {
    /// Listed messages.
    pub messages: Vec<ListedMessage>,
    /// The server had more messages than it returned.
    pub truncated: bool,
}

/// The answer to a free-trial query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeTrialAvailability {
    /// True if a free trial can be started.
    pub available: bool,
}

/// Server calls.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait ServerApi: 'static + Send + Sync + std::fmt::Debug {
    /// Request a session challenge.
    fn request_challenge(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, ServerResult<SessionChallenge>>;

    /// Exchange a signed challenge for a session.
    fn get_token(
        &self,
        identity: OwnedIdentity,
        nonce: Bytes,
        signature: Bytes,
    ) -> BoxFut<'_, ServerResult<(Bytes, ApiKeyStatus)>>;

    /// Query the status of an api key.
    fn query_api_key_status(
        &self,
        identity: OwnedIdentity,
        api_key: String,
    ) -> BoxFut<'_, ServerResult<ApiKeyStatus>>;

    /// List the inbox of a device.
    fn list_messages(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        device_uid: DeviceUid,
    ) -> BoxFut<'_, ServerResult<MessageListing>>;

    /// Download one attachment chunk from its signed url.
    fn download_chunk(&self, url: String) -> BoxFut<'_, ServerResult<Bytes>>;

    /// Get fresh signed urls for all attachments of a message.
    fn refresh_signed_urls(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        uid: MessageUid,
    ) -> BoxFut<'_, ServerResult<Vec<(u32, Vec<String>)>>>;

    /// Download the encrypted extended payload of a message.
    fn download_extended_payload(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        uid: MessageUid,
    ) -> BoxFut<'_, ServerResult<Bytes>>;

    /// Delete messages (and their attachments), or mark them as listed.
    fn delete_messages(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        device_uid: DeviceUid,
        items: Vec<(MessageUid, bool)>,
    ) -> BoxFut<'_, ServerResult<()>>;

    /// Register a device for push delivery.
    fn register_push(
        &self,
        token: Bytes,
        config: PushNotificationConfiguration,
    ) -> BoxFut<'_, ServerResult<()>>;

    /// Execute a signed server query.
    fn execute_query(
        &self,
        identity: OwnedIdentity,
        method: String,
        body: Bytes,
    ) -> BoxFut<'_, ServerResult<Bytes>>;

    /// Download a user-data file.
    fn download_user_data(
        &self,
        identity: OwnedIdentity,
        label: Bytes,
    ) -> BoxFut<'_, ServerResult<Bytes>>;

    /// Get TURN credentials for a call.
    fn get_turn_credentials(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        caller_username: String,
        callee_username: String,
    ) -> BoxFut<'_, ServerResult<TurnCredentials>>;

    /// Ask whether a free trial is available.
    fn query_free_trial(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
    ) -> BoxFut<'_, ServerResult<FreeTrialAvailability>>;

    /// Start a free trial.
    fn start_free_trial(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
    ) -> BoxFut<'_, ServerResult<ApiKeyStatus>>;

    /// Verify an in-app purchase receipt.
    fn verify_receipt(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
        store_token: String,
    ) -> BoxFut<'_, ServerResult<ApiKeyStatus>>;

    /// Download the well-known json of a server.
    fn download_well_known(
        &self,
        server: ServerUrl,
    ) -> BoxFut<'_, ServerResult<String>>;
}

/// Trait-object [ServerApi].
pub type DynServerApi = Arc<dyn ServerApi>;
