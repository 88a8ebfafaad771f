//! Delegates consumed by the coordinators.
//!
//! [CryptoDelegate] and [ChannelDelegate] are implemented by the
//! cryptographic engine and the channel layer. The other traits are
//! narrow triggers implemented by the coordinators themselves, so that
//! one workflow can start another without holding a reference to it.

use crate::record::*;
use crate::*;
use bytes::Bytes;
use std::sync::Arc;

/// Cryptographic operations needed around network calls.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait CryptoDelegate: 'static + Send + Sync + std::fmt::Debug {
    /// Sign a session challenge with the identity's private key.
    fn solve_challenge(
        &self,
        identity: OwnedIdentity,
        challenge: Bytes,
        nonce: Bytes,
    ) -> NfResult<Bytes>;

    /// Decrypt one attachment chunk.
    fn decrypt_attachment_chunk(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
        chunk_index: u32,
        encrypted: Bytes,
    ) -> NfResult<Bytes>;

    /// Decrypt an extended payload with its key.
    fn decrypt_extended_payload(
        &self,
        key: Bytes,
        encrypted: Bytes,
    ) -> NfResult<Bytes>;
}

/// Trait-object [CryptoDelegate].
pub type DynCryptoDelegate = Arc<dyn CryptoDelegate>;

/// The channel layer.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait ChannelDelegate: 'static + Send + Sync + std::fmt::Debug {
    /// Hand a message to the channel layer.
    fn post(&self, message: ChannelMessage) -> BoxFut<'_, NfResult<()>>;

    /// Decrypt and process a downloaded inbox message.
    fn process_message(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) -> BoxFut<'_, NfResult<()>>;
}

/// Trait-object [ChannelDelegate].
pub type DynChannelDelegate = Arc<dyn ChannelDelegate>;

/// Protocol state machines that network events may need to start.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait ProtocolStarterDelegate:
    'static + Send + Sync + std::fmt::Debug
{
    /// Discover the other devices of an owned identity.
    fn start_owned_device_discovery(
        &self,
        identity: OwnedIdentity,
    ) -> NfResult<()>;
}

/// Trait-object [ProtocolStarterDelegate].
pub type DynProtocolStarterDelegate = Arc<dyn ProtocolStarterDelegate>;

/// Trigger a session creation.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait CreateServerSessionDelegate:
    'static + Send + Sync + std::fmt::Debug
{
    /// Create a session for `identity`. If `invalid_token` is set, the
    /// stored token is discarded only if it still equals that token.
    /// Completion is announced with
    /// [Notification::ServerSessionCreated](crate::notification::Notification::ServerSessionCreated).
    fn create_server_session(
        &self,
        identity: OwnedIdentity,
        invalid_token: Option<Bytes>,
    );
}

/// Trait-object [CreateServerSessionDelegate].
pub type DynCreateServerSessionDelegate =
    Arc<dyn CreateServerSessionDelegate>;

/// Trigger a push registration.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait RegisterPushDelegate: 'static + Send + Sync + std::fmt::Debug {
    /// Register the device of `identity` again with its stored
    /// configuration.
    fn reregister_push_notification(&self, identity: OwnedIdentity);
}

/// Trait-object [RegisterPushDelegate].
pub type DynRegisterPushDelegate = Arc<dyn RegisterPushDelegate>;

/// Trigger a listing.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait DownloadListDelegate: 'static + Send + Sync + std::fmt::Debug {
    /// List the inbox of a device.
    fn download_messages_and_list_attachments(
        &self,
        identity: OwnedIdentity,
        device_uid: DeviceUid,
    );

    /// Save and process a message pushed inline over a websocket.
    fn process_pushed_message(
        &self,
        identity: OwnedIdentity,
        message: ListedMessage,
    );
}

/// Trait-object [DownloadListDelegate].
pub type DynDownloadListDelegate = Arc<dyn DownloadListDelegate>;

/// Trigger a signed-url refresh.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait RefreshSignedUrlDelegate:
    'static + Send + Sync + std::fmt::Debug
{
    /// Refresh the signed urls of the attachments of a message.
    /// Completion is announced with
    /// [Notification::SignedUrlRefreshed](crate::notification::Notification::SignedUrlRefreshed).
    fn refresh_signed_urls(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    );
}

/// Trait-object [RefreshSignedUrlDelegate].
pub type DynRefreshSignedUrlDelegate = Arc<dyn RefreshSignedUrlDelegate>;

/// Synchronous access to the well-known cache.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait WellKnownCacheDelegate:
    'static + Send + Sync + std::fmt::Debug
{
    /// The websocket url of a server, or [NfError::NotCachedYet].
    fn get_web_socket_url(&self, server: ServerUrl) -> NfResult<String>;

    /// The TURN urls of a server, or [NfError::NotCachedYet].
    fn get_turn_urls(&self, server: ServerUrl) -> NfResult<Vec<String>>;
}

/// Trait-object [WellKnownCacheDelegate].
pub type DynWellKnownCacheDelegate = Arc<dyn WellKnownCacheDelegate>;

/// Trigger a server-side deletion.
#[cfg_attr(feature = "mockall", mockall::automock)]
pub trait DeleteMessageDelegate: 'static + Send + Sync + std::fmt::Debug {
    /// Delete a consumed message from the server, or only mark it listed.
    fn delete_message(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        mark_as_listed_only: bool,
    );
}

/// Trait-object [DeleteMessageDelegate].
pub type DynDeleteMessageDelegate = Arc<dyn DeleteMessageDelegate>;
