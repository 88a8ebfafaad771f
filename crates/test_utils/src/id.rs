//! Test utilities associated with ids.

use bytes::Bytes;
use netfetch_api::{
    id::Id, DeviceUid, MessageUid, OwnedIdentity, ProtocolInstanceUid,
    QueryUid,
};

use crate::random_bytes;

/// Create a random id.
pub fn random_id() -> Id {
    Id(Bytes::from(random_bytes(32)))
}

/// Create a random owned identity.
pub fn random_identity() -> OwnedIdentity {
    OwnedIdentity(random_id())
}

/// Create a random device uid.
pub fn random_device_uid() -> DeviceUid {
    DeviceUid(random_id())
}

/// Create a random message uid.
pub fn random_message_uid() -> MessageUid {
    MessageUid(random_id())
}

/// Create a random query uid.
pub fn random_query_uid() -> QueryUid {
    QueryUid(random_id())
}

/// Create a random protocol instance uid.
pub fn random_protocol_instance_uid() -> ProtocolInstanceUid {
    ProtocolInstanceUid(random_id())
}
