//! The in-memory fetch store.
//!
//! This is a reference implementation of [FetchStore] used by the tests
//! and by embedders that do not persist state. It is not intended for
//! production, nothing survives a restart.

use bytes::Bytes;
use netfetch_api::{record::*, store::*, *};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

type MsgKey = (OwnedIdentity, MessageUid);
type AttKey = (OwnedIdentity, MessageUid, u32);

#[derive(Debug, Default)]
struct State {
    identities: BTreeMap<OwnedIdentity, OwnedIdentityInfo>,
    sessions: HashMap<OwnedIdentity, ServerSession>,
    messages: BTreeMap<MsgKey, InboxMessage>,
    attachments: BTreeMap<AttKey, InboxAttachment>,
    attachment_data: HashMap<AttKey, Vec<Bytes>>,
    up_to_date: HashSet<OwnedIdentity>,
    listed_on_server: HashSet<MsgKey>,
    push: HashMap<OwnedIdentity, PushNotificationConfiguration>,
    queries: BTreeMap<QueryUid, PendingServerQuery>,
    user_data: BTreeMap<(OwnedIdentity, Bytes), (UserData, Option<Bytes>)>,
    well_known: BTreeMap<ServerUrl, String>,
    activate_after_read: HashSet<OwnedIdentity>,
}

impl State {
    fn is_consumed(&self, identity: &OwnedIdentity, uid: &MessageUid) -> bool {
        let marked = self
            .messages
            .get(&(identity.clone(), uid.clone()))
            .map(|m| m.status == InboxMessageStatus::MarkedForDeletion)
            .unwrap_or(false);
        marked
            && self
                .attachments
                .values()
                .filter(|a| a.identity == *identity && a.uid == *uid)
                .all(|a| a.marked_for_deletion)
    }

    fn attachment_mut(
        &mut self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> NfResult<&mut InboxAttachment> {
        self.attachments
            .get_mut(&(identity, uid, number))
            .ok_or_else(|| NfError::other("attachment not found"))
    }
}

/// An in-memory [FetchStore].
#[derive(Debug, Default)]
pub struct MemFetchStore(Mutex<State>);

impl MemFetchStore {
    /// Construct a new, empty MemFetchStore.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or replace an owned identity.
    pub fn add_owned_identity(&self, info: OwnedIdentityInfo) {
        self.0
            .lock()
            .unwrap()
            .identities
            .insert(info.identity.clone(), info);
    }

    /// Make an identity active right after its next read, without any
    /// notification. The reader still sees it inactive.
    pub fn activate_after_next_read(&self, identity: OwnedIdentity) {
        self.0.lock().unwrap().activate_after_read.insert(identity);
    }

    /// Add or replace an inbox message.
    pub fn add_inbox_message(&self, message: InboxMessage) {
        self.0.lock().unwrap().messages.insert(
            (message.identity.clone(), message.uid.clone()),
            message,
        );
    }

    /// Add or replace an inbox attachment.
    pub fn add_inbox_attachment(&self, attachment: InboxAttachment) {
        self.0.lock().unwrap().attachments.insert(
            (
                attachment.identity.clone(),
                attachment.uid.clone(),
                attachment.number,
            ),
            attachment,
        );
    }

    /// Add a pending server query.
    pub fn add_pending_server_query(&self, query: PendingServerQuery) {
        self.0
            .lock()
            .unwrap()
            .queries
            .insert(query.uid.clone(), query);
    }

    /// Add a user-data label.
    pub fn add_user_data(&self, user_data: UserData) {
        self.0.lock().unwrap().user_data.insert(
            (user_data.identity.clone(), user_data.label.clone()),
            (user_data, None),
        );
    }

    /// Snapshot of an inbox message.
    pub fn inbox_message(
        &self,
        identity: &OwnedIdentity,
        uid: &MessageUid,
    ) -> Option<InboxMessage> {
        self.0
            .lock()
            .unwrap()
            .messages
            .get(&(identity.clone(), uid.clone()))
            .cloned()
    }

    /// Snapshot of an inbox attachment.
    pub fn inbox_attachment(
        &self,
        identity: &OwnedIdentity,
        uid: &MessageUid,
        number: u32,
    ) -> Option<InboxAttachment> {
        self.0
            .lock()
            .unwrap()
            .attachments
            .get(&(identity.clone(), uid.clone(), number))
            .cloned()
    }

    /// The decrypted chunks written for an attachment.
    pub fn attachment_data(
        &self,
        identity: &OwnedIdentity,
        uid: &MessageUid,
        number: u32,
    ) -> Vec<Bytes> {
        self.0
            .lock()
            .unwrap()
            .attachment_data
            .get(&(identity.clone(), uid.clone(), number))
            .cloned()
            .unwrap_or_default()
    }

    /// True if the listing of `identity` was marked up to date.
    pub fn is_listing_up_to_date(&self, identity: &OwnedIdentity) -> bool {
        self.0.lock().unwrap().up_to_date.contains(identity)
    }

    /// True if a message was marked as listed on the server.
    pub fn is_listed_on_server(
        &self,
        identity: &OwnedIdentity,
        uid: &MessageUid,
    ) -> bool {
        self.0
            .lock()
            .unwrap()
            .listed_on_server
            .contains(&(identity.clone(), uid.clone()))
    }

    /// The saved content of a user-data label.
    pub fn user_data(
        &self,
        identity: &OwnedIdentity,
        label: &Bytes,
    ) -> Option<Bytes> {
        self.0
            .lock()
            .unwrap()
            .user_data
            .get(&(identity.clone(), label.clone()))
            .and_then(|(_, d)| d.clone())
    }

    /// The saved well-known json of a server.
    pub fn well_known(&self, server: &ServerUrl) -> Option<String> {
        self.0.lock().unwrap().well_known.get(server).cloned()
    }
}

impl FetchStore for MemFetchStore {
    fn get_owned_identities(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<OwnedIdentityInfo>>> {
        Box::pin(async move {
            Ok(self.0.lock().unwrap().identities.values().cloned().collect())
        })
    }

    fn get_owned_identity(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<Option<OwnedIdentityInfo>>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            let info = lock.identities.get(&identity).cloned();
            if lock.activate_after_read.remove(&identity) {
                if let Some(info) = lock.identities.get_mut(&identity) {
                    info.active = true;
                }
            }
            Ok(info)
        })
    }

    fn set_owned_identity_active(
        &self,
        identity: OwnedIdentity,
        active: bool,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            match self.0.lock().unwrap().identities.get_mut(&identity) {
                Some(info) => {
                    info.active = active;
                    Ok(())
                }
                None => Err(NfError::other("owned identity not found")),
            }
        })
    }

    fn get_server_session_token(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<Option<Bytes>>> {
        Box::pin(async move {
            Ok(self
                .0
                .lock()
                .unwrap()
                .sessions
                .get(&identity)
                .map(|s| s.token.clone()))
        })
    }

    fn save_server_session(
        &self,
        session: ServerSession,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            self.0
                .lock()
                .unwrap()
                .sessions
                .insert(session.identity.clone(), session);
            Ok(())
        })
    }

    fn delete_server_session_if_token(
        &self,
        identity: OwnedIdentity,
        token: Bytes,
    ) -> BoxFut<'_, NfResult<bool>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            let matches = lock
                .sessions
                .get(&identity)
                .map(|s| s.token == token)
                .unwrap_or(false);
            if matches {
                lock.sessions.remove(&identity);
            }
            Ok(matches)
        })
    }

    fn save_listed_messages(
        &self,
        identity: OwnedIdentity,
        messages: Vec<ListedMessage>,
    ) -> BoxFut<'_, NfResult<Vec<MessageUid>>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            let mut new = Vec::new();
            for m in messages {
                let key = (identity.clone(), m.uid.clone());
                if lock.messages.contains_key(&key) {
                    continue;
                }
                for a in m.attachments.iter() {
                    lock.attachments.insert(
                        (identity.clone(), m.uid.clone(), a.number),
                        InboxAttachment {
                            identity: identity.clone(),
                            uid: m.uid.clone(),
                            number: a.number,
                            expected_length: a.expected_length,
                            chunk_download_urls: a.chunk_download_urls.clone(),
                            received_chunk_count: 0,
                            download_requested: false,
                            marked_for_deletion: false,
                            server_timestamp: m.server_timestamp,
                        },
                    );
                }
                lock.messages.insert(
                    key,
                    InboxMessage {
                        identity: identity.clone(),
                        uid: m.uid.clone(),
                        status: InboxMessageStatus::Unprocessed,
                        server_timestamp: m.server_timestamp,
                        awaiting_contact: false,
                        has_extended_payload: m.has_extended_payload,
                        extended_payload_key: None,
                        extended_payload: None,
                    },
                );
                new.push(m.uid);
            }
            Ok(new)
        })
    }

    fn mark_listing_up_to_date(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            self.0.lock().unwrap().up_to_date.insert(identity);
            Ok(())
        })
    }

    fn get_inbox_message(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) -> BoxFut<'_, NfResult<Option<InboxMessage>>> {
        Box::pin(async move { Ok(self.inbox_message(&identity, &uid)) })
    }

    fn get_inbox_messages(&self) -> BoxFut<'_, NfResult<Vec<InboxMessage>>> {
        Box::pin(async move {
            Ok(self.0.lock().unwrap().messages.values().cloned().collect())
        })
    }

    fn get_messages_ready_for_deletion(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<(OwnedIdentity, MessageUid)>>> {
        Box::pin(async move {
            let lock = self.0.lock().unwrap();
            Ok(lock
                .messages
                .keys()
                .filter(|(i, u)| lock.is_consumed(i, u))
                .cloned()
                .collect())
        })
    }

    fn delete_inbox_messages(
        &self,
        identity: OwnedIdentity,
        uids: Vec<MessageUid>,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            for uid in uids {
                lock.messages.remove(&(identity.clone(), uid.clone()));
                lock.attachments
                    .retain(|(i, u, _), _| !(*i == identity && *u == uid));
                lock.attachment_data
                    .retain(|(i, u, _), _| !(*i == identity && *u == uid));
            }
            Ok(())
        })
    }

    fn mark_messages_listed_on_server(
        &self,
        identity: OwnedIdentity,
        uids: Vec<MessageUid>,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            for uid in uids {
                lock.listed_on_server.insert((identity.clone(), uid));
            }
            Ok(())
        })
    }

    fn set_extended_payload(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        payload: Bytes,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            match self.0.lock().unwrap().messages.get_mut(&(identity, uid)) {
                Some(m) => {
                    m.extended_payload = Some(payload);
                    Ok(())
                }
                None => Err(NfError::other("inbox message not found")),
            }
        })
    }

    fn clear_extended_payload(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            if let Some(m) =
                self.0.lock().unwrap().messages.get_mut(&(identity, uid))
            {
                m.has_extended_payload = false;
                m.extended_payload_key = None;
                m.extended_payload = None;
            }
            Ok(())
        })
    }

    fn get_inbox_attachment(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> BoxFut<'_, NfResult<Option<InboxAttachment>>> {
        Box::pin(
            async move { Ok(self.inbox_attachment(&identity, &uid, number)) },
        )
    }

    fn get_attachments_to_download(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<InboxAttachment>>> {
        Box::pin(async move {
            Ok(self
                .0
                .lock()
                .unwrap()
                .attachments
                .values()
                .filter(|a| {
                    a.download_requested
                        && !a.marked_for_deletion
                        && !a.is_downloaded()
                })
                .cloned()
                .collect())
        })
    }

    fn set_attachment_download_requested(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
        requested: bool,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            lock.attachment_mut(identity, uid, number)?.download_requested =
                requested;
            Ok(())
        })
    }

    fn write_attachment_chunk(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
        chunk_index: u32,
        data: Bytes,
    ) -> BoxFut<'_, NfResult<u32>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            let att =
                lock.attachment_mut(identity.clone(), uid.clone(), number)?;
            if chunk_index != att.received_chunk_count {
                return Err(NfError::other(format!(
                    "out of order chunk {chunk_index}, expected {}",
                    att.received_chunk_count
                )));
            }
            att.received_chunk_count += 1;
            let count = att.received_chunk_count;
            lock.attachment_data
                .entry((identity, uid, number))
                .or_default()
                .push(data);
            Ok(count)
        })
    }

    fn update_attachment_urls(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        urls: Vec<(u32, Vec<String>)>,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            for (number, urls) in urls {
                if let Some(att) = lock.attachments.get_mut(&(
                    identity.clone(),
                    uid.clone(),
                    number,
                )) {
                    att.chunk_download_urls = urls;
                }
            }
            Ok(())
        })
    }

    fn mark_attachment_for_deletion(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
        number: u32,
    ) -> BoxFut<'_, NfResult<bool>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            lock.attachment_mut(identity.clone(), uid.clone(), number)?
                .marked_for_deletion = true;
            Ok(lock.is_consumed(&identity, &uid))
        })
    }

    fn get_push_configuration(
        &self,
        identity: OwnedIdentity,
    ) -> BoxFut<'_, NfResult<Option<PushNotificationConfiguration>>> {
        Box::pin(async move {
            Ok(self.0.lock().unwrap().push.get(&identity).cloned())
        })
    }

    fn save_push_configuration(
        &self,
        config: PushNotificationConfiguration,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            self.0
                .lock()
                .unwrap()
                .push
                .insert(config.identity.clone(), config);
            Ok(())
        })
    }

    fn get_pending_server_queries(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<PendingServerQuery>>> {
        Box::pin(async move {
            Ok(self.0.lock().unwrap().queries.values().cloned().collect())
        })
    }

    fn get_pending_server_query(
        &self,
        uid: QueryUid,
    ) -> BoxFut<'_, NfResult<Option<PendingServerQuery>>> {
        Box::pin(
            async move { Ok(self.0.lock().unwrap().queries.get(&uid).cloned()) },
        )
    }

    fn delete_pending_server_query(
        &self,
        uid: QueryUid,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            self.0.lock().unwrap().queries.remove(&uid);
            Ok(())
        })
    }

    fn get_user_data_to_download(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<UserData>>> {
        Box::pin(async move {
            Ok(self
                .0
                .lock()
                .unwrap()
                .user_data
                .values()
                .filter(|(u, _)| u.needs_download)
                .map(|(u, _)| u.clone())
                .collect())
        })
    }

    fn save_user_data(
        &self,
        identity: OwnedIdentity,
        label: Bytes,
        data: Bytes,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            let mut lock = self.0.lock().unwrap();
            let entry = lock
                .user_data
                .entry((identity.clone(), label.clone()))
                .or_insert_with(|| {
                    (
                        UserData {
                            identity,
                            label,
                            needs_download: false,
                        },
                        None,
                    )
                });
            entry.0.needs_download = false;
            entry.1 = Some(data);
            Ok(())
        })
    }

    fn delete_user_data(
        &self,
        identity: OwnedIdentity,
        label: Bytes,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            self.0.lock().unwrap().user_data.remove(&(identity, label));
            Ok(())
        })
    }

    fn get_cached_well_known(
        &self,
    ) -> BoxFut<'_, NfResult<Vec<(ServerUrl, String)>>> {
        Box::pin(async move {
            Ok(self
                .0
                .lock()
                .unwrap()
                .well_known
                .iter()
                .map(|(s, j)| (s.clone(), j.clone()))
                .collect())
        })
    }

    fn save_well_known(
        &self,
        server: ServerUrl,
        json: String,
    ) -> BoxFut<'_, NfResult<()>> {
        Box::pin(async move {
            self.0.lock().unwrap().well_known.insert(server, json);
            Ok(())
        })
    }
}
