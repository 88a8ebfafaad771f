//! The storage delegate.
//!
//! Every method is one logical step: implementations must run it in a
//! single transaction and either commit all of it or none of it.

use crate::record::*;
use crate::*;
use bytes::Bytes;
use std::sync::Arc;

/// Durable state read at startup and mutated as operations complete.
pub trait FetchStore: 'static + Send + Sync + std::fmt::Debug {
    // -- owned identities --

    /// All owned identities.
    fn get_owned_identities(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<OwnedIdentityInfo>>>;

    /// One owned identity, `None` if it was deleted.
    fn get_owned_identity(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<Option<OwnedIdentityInfo>>>;

    /// Change the active status of an owned identity.
    fn set_owned_identity_active(
        &self,
        identity: OwnedIdentity,
        active: bool,
    ) -> BoxFut<'_, NfResult<()>>;

    // -- server sessions --

    /// The current session token of an identity, if any.
    fn get_server_session_token(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<Option<Bytes>>>;

    /// Save a freshly granted session, replacing any previous one.
    fn save_server_session(
        &self,
        session: ServerSession,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Delete the session token of an identity if it equals `token`.
    /// Returns true if it was deleted.
    fn delete_server_session_if_token(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
    ) -> BoxFut<'_, NfResult<bool>>;

    // -- inbox messages --

    /// Save listed messages and their attachments. Messages that already
    /// exist are left untouched. Returns the uids that were new.
    fn save_listed_messages(
        &self,
        identity: OwnedIdentity,
        messages: Vec<ListedMessage>,
    ) -> BoxFut<'_, NfResult<Vec<MessageUid>>>;

    /// Record that the listing of an identity is complete.
    fn mark_listing_up_to_date(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<()>>;

    /// One inbox message.
    fn get_inbox_message(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) -> BoxFut<'_, NfResult<Option<InboxMessage>>>;

    /// All inbox messages of all identities.
    fn get_inbox_messages(&self) -> BoxFut<'_, NfResult<Vec<InboxMessage>>>;

    /// Messages marked for deletion whose attachments are all marked for
    /// deletion too.
    fn get_messages_ready_for_deletion(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<(OwnedIdentity, MessageUid)>>>;

    /// Delete inbox messages and their attachments.
    fn delete_inbox_messages(
        &self,
        identity: OwnedIdentity,
        uids: Vec<MessageUid>,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Record that messages are known to the server as listed.
    fn mark_messages_listed_on_server(
        &self,
        identity: OwnedIdentity,
        uids: Vec<MessageUid>,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Save a decrypted extended payload.
    fn set_extended_payload(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        payload: Bytes,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Forget the extended payload of a message, it will never be
    /// downloaded.
    fn clear_extended_payload(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) -> BoxFut<'_, NfResult<()>>;

    // -- inbox attachments --

    /// One inbox attachment.
    fn get_inbox_attachment(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> BoxFut<'_, NfResult<Option<InboxAttachment>>>;

    /// Attachments requested by the application and not yet downloaded.
    fn get_attachments_to_download(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<InboxAttachment>>>;

    /// Set or clear the download request flag of an attachment.
    fn set_attachment_download_requested(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
        requested: bool,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Append a decrypted chunk. Returns the new received chunk count.
    fn write_attachment_chunk(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
        chunk_index: u32,
        data: Bytes,
    ) -> BoxFut<'_, NfResult<u32>>;

    /// Replace the signed urls of the attachments of a message.
    fn update_attachment_urls(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        urls: Vec<(u32, Vec<String>)>,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Mark an attachment for deletion. Returns true if the owning message
    /// is now fully consumed (itself and all its attachments marked).
    fn mark_attachment_for_deletion(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> BoxFut<'_, NfResult<bool>>;

    // -- push configuration --

    /// The push configuration of an identity.
    fn get_push_configuration(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<Option<PushNotificationConfiguration>>>;

    /// Save the push configuration of an identity.
    fn save_push_configuration(
        &self,
        config: PushNotificationConfiguration,
    ) -> BoxFut<'_, NfResult<()>>;

    // -- pending server queries --

    /// All pending server queries.
    fn get_pending_server_queries(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<PendingServerQuery>>>;

    /// One pending server query.
    fn get_pending_server_query(
        &self,
        uid: QueryUid,
    ) -> BoxFut<'_, NfResult<Option<PendingServerQuery>>>;

    /// Delete a pending server query once its response was posted.
    fn delete_pending_server_query(
        &self,
        uid: QueryUid,
    ) -> BoxFut<'_, NfResult<()>>;

    // -- user data --

    /// User data whose local copy must be downloaded.
    fn get_user_data_to_download(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<UserData>>>;

    /// Save a downloaded user-data file.
    fn save_user_data(
        &self,
        identity: OwnedIdentity,
        label: Bytes,
        data: Bytes,
    ) -> BoxFut<'_, NfResult<()>>;

    /// Forget a user-data label.
    fn delete_user_data(
        &self,
        identity: OwnedIdentity,
        label: Bytes,
    ) -> BoxFut<'_, NfResult<()>>;

    // -- well-known cache --

    /// All cached well-known blobs.
    fn get_cached_well_known(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<(ServerUrl, String)>>>;

    /// Save a downloaded well-known blob.
    fn save_well_known(
        &self,
        server: ServerUrl,
        json: String,
    ) -> BoxFut<'_, NfResult<()>>;
}

/// Trait-object [FetchStore].
pub type DynFetchStore = Arc<dyn FetchStore>;
