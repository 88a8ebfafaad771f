//! Test implementations of the external delegates.

use bytes::Bytes;
use netfetch_api::{delegate::*, record::*, *};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A [CryptoDelegate] that passes data through unchanged.
///
/// Chunks or payloads listed with [PassThroughCrypto::fail_on] fail to
/// decrypt.
#[derive(Debug, Default)]
pub struct PassThroughCrypto {
    failing: Mutex<HashSet<Bytes>>,
}

impl PassThroughCrypto {
    /// Construct a new PassThroughCrypto.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make decryption of this exact ciphertext fail.
    pub fn fail_on(&self, encrypted: Bytes) {
        self.failing.lock().unwrap().insert(encrypted);
    }

    fn check(&self, encrypted: Bytes) -> NfResult<Bytes> {
        if self.failing.lock().unwrap().contains(&encrypted) {
            Err(NfError::other("decryption failed"))
        } else {
            Ok(encrypted)
        }
    }
}

impl CryptoDelegate for PassThroughCrypto {
    fn solve_challenge(
        &self,
        _identity: OwnedIdentity,
        challenge: Bytes,
        nonce: Bytes,
    ) -> NfResult<Bytes> {
        let mut out = challenge.to_vec();
        out.extend_from_slice(&nonce);
        Ok(out.into())
    }

    fn decrypt_attachment_chunk(
        &self,
        _identity: OwnedIdentity,
        _uid: MessageUid,
        _number: u32,
        _chunk_index: u32,
        encrypted: Bytes,
    ) -> NfResult<Bytes> {
        self.check(encrypted)
    }

    fn decrypt_extended_payload(
        &self,
        _key: Bytes,
        encrypted: Bytes,
    ) -> NfResult<Bytes> {
        self.check(encrypted)
    }
}

/// A [ChannelDelegate] that records what it is handed.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    posted: Mutex<Vec<ChannelMessage>>,
    processed: Mutex<Vec<(OwnedIdentity, MessageUid)>>,
}

impl RecordingChannel {
    /// Construct a new RecordingChannel.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages posted so far.
    pub fn posted(&self) -> Vec<ChannelMessage> {
        self.posted.lock().unwrap().clone()
    }

    /// Server query responses posted so far, in order.
    pub fn query_responses(
        &self,
    ) -> Vec<(QueryUid, Option<ServerResponse>)> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                ChannelMessage::ServerQueryResponse { query, response } => {
                    (query.uid.clone(), response.clone())
                }
            })
            .collect()
    }

    /// Messages handed for processing so far.
    pub fn processed(&self) -> Vec<(OwnedIdentity, MessageUid)> {
        self.processed.lock().unwrap().clone()
    }
}

impl ChannelDelegate for RecordingChannel {
    fn post(&self, message: ChannelMessage) -> BoxFut<'_, NfResult<()>> {
        self.posted.lock().unwrap().push(message);
        Box::pin(async move { Ok(()) })
    }

    fn process_message(
        &self,
        identity: OwnedIdentity,
        uid: MessageUid,
    ) -> BoxFut<'_, NfResult<()>> {
        self.processed.lock().unwrap().push((identity, uid));
        Box::pin(async move { Ok(()) })
    }
}

/// A [ProtocolStarterDelegate] that records the protocols it starts.
#[derive(Debug, Default)]
pub struct RecordingProtocolStarter {
    started: Mutex<Vec<OwnedIdentity>>,
}

impl RecordingProtocolStarter {
    /// Construct a new RecordingProtocolStarter.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Identities an owned device discovery was started for.
    pub fn started(&self) -> Vec<OwnedIdentity> {
        self.started.lock().unwrap().clone()
    }
}

impl ProtocolStarterDelegate for RecordingProtocolStarter {
    fn start_owned_device_discovery(
        &self,
        identity: OwnedIdentity,
    ) -> NfResult<()> {
        self.started.lock().unwrap().push(identity);
        Ok(())
    }
}
