//! Notifications posted on the bus.
//!
//! Every notification has a [NotificationKind] that listeners subscribe
//! to. Application code never polls the coordinators, it listens here.

use crate::record::*;
use crate::*;
use bytes::Bytes;
use std::time::Duration;

/// State of a websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    /// Connecting.
    Connecting,
    /// Open.
    Connected,
    /// Closed, a reconnection may be scheduled.
    Disconnected,
}

/// Why TURN credentials could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnCredentialsFailure {
    /// The api key does not allow calls.
    PermissionDenied,
    /// The server does not support calls.
    CallsNotSupported,
    /// The identity is not active.
    IdentityInactive,
}

/// Why a push registration failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRegisterFailure {
    /// Another device is registered for this identity.
    AnotherDeviceIsAlreadyRegistered,
    /// The server refused the configuration.
    InvalidConfiguration,
}

/// Why an attachment download failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentFailure {
    /// A chunk could not be decrypted.
    DecryptionError,
    /// A chunk had an unexpected length or format.
    InvalidChunk,
    /// The sender cancelled the upload, the server deleted it.
    DeletedFromServer,
    /// The local file could not be written.
    CannotWriteFile,
}

/// A notification posted on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A server session was created or refreshed.
    ServerSessionCreated {
        /// The identity.
        identity: OwnedIdentity,
    },
    /// An api key status query succeeded.
    ApiKeyStatusQuerySuccess {
        /// The identity.
        identity: OwnedIdentity,
        /// The queried key.
        api_key: String,
        /// Its status.
        status: ApiKeyStatus,
    },
    /// An api key status query failed.
    ApiKeyStatusQueryFailed {
        /// The identity.
        identity: OwnedIdentity,
        /// The queried key.
        api_key: String,
    },
    /// Someone asked for a server poll.
    ServerPollRequested {
        /// The identity.
        identity: OwnedIdentity,
    },
    /// A server poll completed.
    ServerPollCompleted {
        /// The identity.
        identity: OwnedIdentity,
        /// True if the listing succeeded.
        success: bool,
    },
    /// Some chunks of an attachment were downloaded.
    AttachmentDownloadProgress {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
        /// The attachment number.
        number: u32,
        /// Fraction in `[0, 1]`.
        progress: f32,
    },
    /// An attachment was fully downloaded.
    AttachmentDownloadFinished {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
        /// The attachment number.
        number: u32,
    },
    /// An attachment download failed terminally.
    AttachmentDownloadFailed {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
        /// The attachment number.
        number: u32,
        /// The cause.
        failure: AttachmentFailure,
    },
    /// An attachment download was paused.
    AttachmentDownloadPaused {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
        /// The attachment number.
        number: u32,
    },
    /// The extended payload of a message was downloaded and decrypted.
    MessageExtendedPayloadDownloaded {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
        /// The decrypted payload.
        payload: Bytes,
    },
    /// A decrypted message is available to the application.
    InboxMessageDecrypted {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
    },
    /// A websocket changed state.
    WebSocketConnectionStateChanged {
        /// The server.
        server: ServerUrl,
        /// The new state.
        state: WebSocketState,
    },
    /// A ping was not answered in time.
    PingLost {
        /// The server.
        server: ServerUrl,
        /// Time since the unanswered ping was sent.
        elapsed: Duration,
    },
    /// A pong was received.
    PingReceived {
        /// The server.
        server: ServerUrl,
        /// Round-trip time.
        delay: Duration,
    },
    /// The server announced an update on a push topic.
    PushTopicNotified {
        /// The topic.
        topic: String,
    },
    /// An owned identity changed active status.
    OwnedIdentityActiveStatusChanged {
        /// The identity.
        identity: OwnedIdentity,
        /// The new status.
        active: bool,
    },
    /// Owned identities were created or deleted.
    OwnedIdentityListUpdated,
    /// A return receipt was received over the websocket.
    ReturnReceiptReceived {
        /// The server.
        server: ServerUrl,
        /// The identity the receipt is addressed to.
        identity: OwnedIdentity,
        /// The receipt's server uid, used to delete it.
        server_uid: Bytes,
        /// Nonce identifying the receipt.
        nonce: Bytes,
        /// Encrypted content.
        encrypted_payload: Bytes,
        /// Server timestamp.
        timestamp: Timestamp,
    },
    /// TURN credentials were received.
    TurnCredentialsReceived {
        /// The identity.
        identity: OwnedIdentity,
        /// The call.
        call_uuid: String,
        /// The credentials.
        credentials: TurnCredentials,
        /// TURN servers to use.
        turn_servers: Vec<String>,
    },
    /// TURN credentials could not be obtained.
    TurnCredentialsFailed {
        /// The identity.
        identity: OwnedIdentity,
        /// The call.
        call_uuid: String,
        /// The cause.
        failure: TurnCredentialsFailure,
    },
    /// A device was registered for push delivery.
    PushNotificationRegistered {
        /// The identity.
        identity: OwnedIdentity,
    },
    /// A push registration failed terminally.
    PushRegisterFailed {
        /// The identity.
        identity: OwnedIdentity,
        /// The cause.
        failure: PushRegisterFailure,
    },
    /// Fresh signed urls were saved for the attachments of a message.
    SignedUrlRefreshed {
        /// The identity.
        identity: OwnedIdentity,
        /// The message.
        uid: MessageUid,
        /// The attachment that asked for the refresh.
        number: u32,
    },
    /// The well-known cache of a server was downloaded.
    WellKnownCacheUpdated {
        /// The server.
        server: ServerUrl,
        /// True if the data differs from what was cached before.
        changed: bool,
    },
    /// A user-data file was downloaded.
    UserDataDownloaded {
        /// The identity.
        identity: OwnedIdentity,
        /// The label.
        label: Bytes,
    },
    /// A free trial query succeeded.
    FreeTrialQuerySuccess {
        /// The identity.
        identity: OwnedIdentity,
        /// True if a free trial is still available.
        available: bool,
    },
    /// A free trial query failed.
    FreeTrialQueryFailed {
        /// The identity.
        identity: OwnedIdentity,
    },
    /// A free trial was started.
    FreeTrialStartSuccess {
        /// The identity.
        identity: OwnedIdentity,
        /// The resulting api key status.
        status: ApiKeyStatus,
    },
    /// A free trial could not be started.
    FreeTrialStartFailed {
        /// The identity.
        identity: OwnedIdentity,
    },
    /// A store receipt was verified.
    ReceiptVerificationSuccess {
        /// The identity.
        identity: OwnedIdentity,
        /// The verified store transaction.
        store_token: String,
        /// The resulting api key status.
        status: ApiKeyStatus,
    },
    /// A store receipt was refused.
    ReceiptVerificationFailed {
        /// The identity.
        identity: OwnedIdentity,
        /// The refused store transaction.
        store_token: String,
    },
}

/// The subscription key of a [Notification].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NotificationKind {
    ServerSessionCreated,
    ApiKeyStatusQuerySuccess,
    ApiKeyStatusQueryFailed,
    ServerPollRequested,
    ServerPollCompleted,
    AttachmentDownloadProgress,
    AttachmentDownloadFinished,
    AttachmentDownloadFailed,
    AttachmentDownloadPaused,
    MessageExtendedPayloadDownloaded,
    InboxMessageDecrypted,
    WebSocketConnectionStateChanged,
    PingLost,
    PingReceived,
    PushTopicNotified,
    OwnedIdentityActiveStatusChanged,
    OwnedIdentityListUpdated,
    ReturnReceiptReceived,
    TurnCredentialsReceived,
    TurnCredentialsFailed,
    PushNotificationRegistered,
    PushRegisterFailed,
    SignedUrlRefreshed,
    WellKnownCacheUpdated,
    UserDataDownloaded,
    FreeTrialQuerySuccess,
    FreeTrialQueryFailed,
    FreeTrialStartSuccess,
    FreeTrialStartFailed,
    ReceiptVerificationSuccess,
    ReceiptVerificationFailed,
}

impl Notification {
    /// The kind listeners subscribe to.
    pub fn kind(&self) -> NotificationKind {
        use Notification as N;
        use NotificationKind as K;
        match self {
            N::ServerSessionCreated { .. } => K::ServerSessionCreated,
            N::ApiKeyStatusQuerySuccess { .. } => K::ApiKeyStatusQuerySuccess,
            N::ApiKeyStatusQueryFailed { .. } => K::ApiKeyStatusQueryFailed,
            N::ServerPollRequested { .. } => K::ServerPollRequested,
            N::ServerPollCompleted { .. } => K::ServerPollCompleted,
            N::AttachmentDownloadProgress { .. } => {
                K::AttachmentDownloadProgress
            }
            N::AttachmentDownloadFinished { .. } => {
                K::AttachmentDownloadFinished
            }
            N::AttachmentDownloadFailed { .. } => K::AttachmentDownloadFailed,
            N::AttachmentDownloadPaused { .. } => K::AttachmentDownloadPaused,
            N::MessageExtendedPayloadDownloaded { .. } => {
                K::MessageExtendedPayloadDownloaded
            }
            N::InboxMessageDecrypted { .. } => K::InboxMessageDecrypted,
            N::WebSocketConnectionStateChanged { .. } => {
                K::WebSocketConnectionStateChanged
            }
            N::PingLost { .. } => K::PingLost,
            N::PingReceived { .. } => K::PingReceived,
            N::PushTopicNotified { .. } => K::PushTopicNotified,
            N::OwnedIdentityActiveStatusChanged { .. } => {
                K::OwnedIdentityActiveStatusChanged
            }
            N::OwnedIdentityListUpdated => K::OwnedIdentityListUpdated,
            N::ReturnReceiptReceived { .. } => K::ReturnReceiptReceived,
            N::TurnCredentialsReceived { .. } => K::TurnCredentialsReceived,
            N::TurnCredentialsFailed { .. } => K::TurnCredentialsFailed,
            N::PushNotificationRegistered { .. } => {
                K::PushNotificationRegistered
            }
            N::PushRegisterFailed { .. } => K::PushRegisterFailed,
            N::SignedUrlRefreshed { .. } => K::SignedUrlRefreshed,
            N::WellKnownCacheUpdated { .. } => K::WellKnownCacheUpdated,
            N::UserDataDownloaded { .. } => K::UserDataDownloaded,
            N::FreeTrialQuerySuccess { .. } => K::FreeTrialQuerySuccess,
            N::FreeTrialQueryFailed { .. } => K::FreeTrialQueryFailed,
            N::FreeTrialStartSuccess { .. } => K::FreeTrialStartSuccess,
            N::FreeTrialStartFailed { .. } => K::FreeTrialStartFailed,
            N::ReceiptVerificationSuccess { .. } => {
                K::ReceiptVerificationSuccess
            }
            N::ReceiptVerificationFailed { .. } => {
                K::ReceiptVerificationFailed
            }
        }
    }
}
