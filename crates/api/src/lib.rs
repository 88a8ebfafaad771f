#![deny(missing_docs)]
//! Netfetch API contains the delegate traits, durable records and bus
//! notifications consumed by the netfetch coordination layer.
//!
//! If you want the coordinators themselves, see the netfetch_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Serde helpers encoding [bytes::Bytes] as url-safe base64 strings, for
/// use with `#[serde(with = "netfetch_api::serde_bytes_base64")]`.
pub mod serde_bytes_base64 {
    /// Serialize bytes as a base64 string.
    pub fn serialize<S>(
        b: &bytes::Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::prelude::*;
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
    }

    /// Deserialize bytes from a base64 string.
    pub fn deserialize<'de, D, T: From<bytes::Bytes>>(
        deserializer: D,
    ) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::prelude::*;
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map(|v| bytes::Bytes::copy_from_slice(&v).into())
            .map_err(serde::de::Error::custom)
    }
}

pub mod builder;
pub mod config;
pub mod delegate;
pub mod notification;
pub mod record;
pub mod server;
pub mod store;
pub mod websocket;

mod error;
pub use error::*;

pub mod id;
pub use id::*;

mod timestamp;
pub use timestamp::*;
