//! Durable records read and mutated by the coordinators.
//!
//! These are owned by the storage layer behind [crate::store::FetchStore].
//! The coordinators only reference them by identity, uid and label.

use crate::*;
use bytes::Bytes;

/// What the store knows about one owned identity.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedIdentityInfo {
    /// The identity.
    pub identity: OwnedIdentity,
    /// The server hosting this identity.
    pub server: ServerUrl,
    /// The uid of the current device of this identity.
    pub device_uid: DeviceUid,
    /// Inactive identities must not talk to their server except to
    /// reactivate through push registration.
    pub active: bool,
}

/// A message as reported by a listing, or pushed inline over a websocket.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedMessage {
    /// Server uid of the message.
    pub uid: MessageUid,
    /// Opaque encrypted header.
    #[serde(with = "crate::serde_bytes_base64")]
    pub wrapped_key: Bytes,
    /// Opaque encrypted content.
    #[serde(with = "crate::serde_bytes_base64")]
    pub content: Bytes,
    /// Server timestamp of the message.
    pub server_timestamp: Timestamp,
    /// True if a large payload can be downloaded separately.
    pub has_extended_payload: bool,
    /// Attachments announced by the server.
    pub attachments: Vec<ListedAttachment>,
}

/// An attachment as reported by a listing.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedAttachment {
    /// Index of the attachment within its message.
    pub number: u32,
    /// Total encrypted length.
    pub expected_length: u64,
    /// One signed url per chunk.
    pub chunk_download_urls: Vec<String>,
}

/// Where an inbox message stands locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxMessageStatus {
    /// Downloaded, not yet decrypted by the channel layer.
    Unprocessed,
    /// Decrypted and waiting to be consumed by the application.
    Decrypted,
    /// Consumed, waiting for server-side deletion.
    MarkedForDeletion,
}

/// A durable inbox message row, keyed by (identity, uid).
#[derive(Debug, Clone, PartialEq)]
pub struct InboxMessage {
    /// Owning identity.
    pub identity: OwnedIdentity,
    /// Server uid.
    pub uid: MessageUid,
    /// Local status.
    pub status: InboxMessageStatus,
    /// Server timestamp of the message.
    pub server_timestamp: Timestamp,
    /// True if the channel layer could not find a contact for the key
    /// used by this message yet.
    pub awaiting_contact: bool,
    /// True if the server holds an extended payload for this message.
    pub has_extended_payload: bool,
    /// Decryption key of the extended payload, set once decrypted.
    pub extended_payload_key: Option<Bytes>,
    /// The decrypted extended payload, once downloaded.
    pub extended_payload: Option<Bytes>,
}

/// A durable inbox attachment row, keyed by (identity, uid, number).
#[derive(Debug, Clone, PartialEq)]
pub struct InboxAttachment {
    /// Owning identity.
    pub identity: OwnedIdentity,
    /// Uid of the owning message.
    pub uid: MessageUid,
    /// Index of the attachment within its message.
    pub number: u32,
    /// Total encrypted length.
    pub expected_length: u64,
    /// One signed url per chunk. Empty if unknown.
    pub chunk_download_urls: Vec<String>,
    /// Chunks already downloaded, decrypted and written.
    pub received_chunk_count: u32,
    /// The application asked for this attachment.
    pub download_requested: bool,
    /// The attachment was consumed or failed terminally.
    pub marked_for_deletion: bool,
    /// Server timestamp of the owning message.
    pub server_timestamp: Timestamp,
}

impl InboxAttachment {
    /// Total number of chunks.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_download_urls.len() as u32
    }

    /// All chunks have been received.
    pub fn is_downloaded(&self) -> bool {
        !self.chunk_download_urls.is_empty()
            && self.received_chunk_count >= self.chunk_count()
    }

    /// Progress fraction in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.chunk_download_urls.is_empty() {
            return 0.0;
        }
        self.received_chunk_count as f32 / self.chunk_count() as f32
    }
}

/// How a device wants to be told about new messages.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PushKind {
    /// A native push token.
    Native {
        /// The token issued by the platform push service.
        token: String,
    },
    /// No native push, messages are announced over the websocket.
    WebSocketOnly,
}

/// A durable push-notification configuration row, keyed by identity.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotificationConfiguration {
    /// The identity to register.
    pub identity: OwnedIdentity,
    /// The device to register.
    pub device_uid: DeviceUid,
    /// Push mechanism.
    pub kind: PushKind,
    /// Ask the server to make this device the active one, deactivating
    /// any other device registered for the identity.
    pub reactivate_current_device: bool,
    /// Topics the device wants push-topic notices for.
    pub topics: Vec<String>,
}

/// Api key permissions as reported by the server.
#[derive(
    Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum ApiKeyStatus {
    /// Valid key.
    Valid,
    /// Unknown or revoked key.
    Invalid,
    /// Key expired.
    Expired,
    /// Free trial running.
    FreeTrial,
    /// Free trial expired.
    FreeTrialExpired,
}

/// A freshly granted server session.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSession {
    /// The identity the session belongs to.
    pub identity: OwnedIdentity,
    /// The opaque session token.
    pub token: Bytes,
    /// Api key status at grant time.
    pub api_key_status: ApiKeyStatus,
}

/// A durable user-data row, keyed by (identity, label).
#[derive(Debug, Clone, PartialEq)]
pub struct UserData {
    /// Owning identity.
    pub identity: OwnedIdentity,
    /// Server-side label.
    pub label: Bytes,
    /// True if the local copy is missing and must be downloaded.
    pub needs_download: bool,
}

/// A transfer request made by a device-transfer protocol instance.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferRequest {
    /// Open a source connection and obtain a session number.
    Source,
    /// Connect to a source by session number, sending an initial payload.
    Target {
        /// The session number displayed on the source device.
        session_number: u64,
        /// First payload for the source.
        payload: Bytes,
    },
    /// Relay a payload to the other end.
    Relay {
        /// The other end's connection id.
        connection_id: String,
        /// The payload.
        payload: Bytes,
        /// If true, the response is the next message from the other end.
        wait_for_response: bool,
    },
    /// Wait for the next message from the other end.
    Wait,
    /// Close the transfer socket.
    Close {
        /// True if the transfer is aborted rather than completed.
        abort: bool,
    },
}

/// The kind of a pending server query.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerQueryKind {
    /// A signed server method, executed through [crate::server::ServerApi].
    Signed {
        /// Server method name.
        method: String,
        /// Encoded signed body.
        body: Bytes,
    },
    /// A device-transfer request, relayed over a dedicated websocket.
    Transfer {
        /// The protocol instance owning the transfer socket.
        protocol_instance: ProtocolInstanceUid,
        /// The request.
        request: TransferRequest,
    },
}

/// A durable pending server query row, keyed by uid.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingServerQuery {
    /// Query uid.
    pub uid: QueryUid,
    /// Identity on whose behalf the query is made.
    pub identity: OwnedIdentity,
    /// Server the query is sent to.
    pub server: ServerUrl,
    /// What to do.
    pub kind: ServerQueryKind,
    /// Creation time.
    pub created: Timestamp,
}

/// The decoded answer to a pending server query.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerResponse {
    /// Answer of a [ServerQueryKind::Signed] query.
    Signed(Bytes),
    /// The source connection got a session number.
    TransferSessionNumber(u64),
    /// A message from the other end of a transfer.
    TransferMessage {
        /// The other end's connection id.
        connection_id: String,
        /// Reassembled payload.
        payload: Bytes,
    },
    /// The payload was relayed.
    TransferRelayed,
    /// The transfer socket was closed.
    TransferClosed,
}

/// TURN credentials for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnCredentials {
    /// Username for the caller.
    pub caller_username: String,
    /// Password for the caller.
    pub caller_password: String,
    /// Username for the callee.
    pub callee_username: String,
    /// Password for the callee.
    pub callee_password: String,
}

/// Per-server configuration published at the server's well-known url.
#[derive(
    Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(default, rename_all = "camelCase")]
pub struct WellKnownData {
    /// Url of the websocket endpoint.
    pub web_socket_url: Option<String>,
    /// TURN server urls.
    pub turn_server_urls: Vec<String>,
    /// Url of the address lookup service.
    pub address_lookup_url: Option<String>,
    /// Available map styles.
    pub map_styles: Vec<String>,
}

/// Messages handed to the channel layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// A server query completed. `None` is the null response which fails
    /// the protocol instance that made the query.
    ServerQueryResponse {
        /// The query.
        query: PendingServerQuery,
        /// The answer.
        response: Option<ServerResponse>,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    fn attachment(urls: usize, received: u32) -> InboxAttachment {
        InboxAttachment {
            identity: OwnedIdentity::from(Bytes::from_static(b"i")),
            uid: MessageUid::from(Bytes::from_static(b"m")),
            number: 0,
            expected_length: 10,
            chunk_download_urls: vec!["u".to_string(); urls],
            received_chunk_count: received,
            download_requested: true,
            marked_for_deletion: false,
            server_timestamp: Timestamp::from_micros(0),
        }
    }

    #[test]
    fn attachment_progress() {
        assert_eq!(0.0, attachment(0, 0).progress());
        assert!(!attachment(0, 0).is_downloaded());
        assert_eq!(0.5, attachment(4, 2).progress());
        assert!(!attachment(4, 2).is_downloaded());
        assert!(attachment(4, 4).is_downloaded());
    }

    #[test]
    fn well_known_tolerates_missing_fields() {
        let wk: WellKnownData =
            serde_json::from_str(r#"{"webSocketUrl":"wss://ws.example"}"#)
                .unwrap();
        assert_eq!(Some("wss://ws.example".to_string()), wk.web_socket_url);
        assert!(wk.turn_server_urls.is_empty());
    }
}
