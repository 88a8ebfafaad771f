//! Types dealing with data identity.

macro_rules! imp_deref {
    ($i:ty, $t:ty) => {
        impl std::ops::Deref for $i {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! imp_from {
    ($a:ty, $b:ty, $i:ident => $e:expr) => {
        impl From<$b> for $a {
            fn from($i: $b) -> Self {
                $e
            }
        }
    };
}

macro_rules! imp_id {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Id);

        imp_deref!($name, Id);
        imp_from!($name, bytes::Bytes, b => $name(Id(b)));
        imp_from!($name, Id, b => $name(b));

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

/// Base data identity type meant for newtyping.
///
/// Displayed as url-safe base64, which makes log lines far easier to read
/// than rust's default decimal array.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Id(#[serde(with = "crate::serde_bytes_base64")] pub bytes::Bytes);

imp_deref!(Id, bytes::Bytes);
imp_from!(Id, bytes::Bytes, b => Id(b));

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use base64::prelude::*;
        f.write_str(&BASE64_URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

imp_id!(
    /// An identity owned by this device. Each owned identity has its own
    /// server, session and device uid.
    OwnedIdentity
);

imp_id!(
    /// Identifies one device of an owned identity.
    DeviceUid
);

imp_id!(
    /// Server-assigned uid of an inbox message.
    MessageUid
);

imp_id!(
    /// Uid of a persisted pending server query.
    QueryUid
);

imp_id!(
    /// Identifies one running instance of a protocol, such as a device
    /// transfer.
    ProtocolInstanceUid
);

/// The base url of a messaging server, e.g. `https://server.example`.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ServerUrl(std::sync::Arc<str>);

impl ServerUrl {
    /// Get the url as a str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

imp_from!(ServerUrl, &str, s => ServerUrl(s.into()));
imp_from!(ServerUrl, String, s => ServerUrl(s.into_boxed_str().into()));

impl std::fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for ServerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_display_is_base64() {
        let id = OwnedIdentity::from(bytes::Bytes::from_static(b"hello"));
        assert_eq!("aGVsbG8", id.to_string());
        assert_eq!("aGVsbG8", format!("{id:?}"));
    }

    #[test]
    fn id_serde_round_trips_through_base64_string() {
        let id = MessageUid::from(bytes::Bytes::from_static(&[1, 2, 3]));
        let enc = serde_json::to_string(&id).unwrap();
        assert_eq!("\"AQID\"", enc);
        let dec: MessageUid = serde_json::from_str(&enc).unwrap();
        assert_eq!(id, dec);
    }
}
