//! Netfetch error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The netfetch error type, returned by delegates and by the synchronous
/// getters of the coordinators.
///
/// This type is `Clone` so that results can be stored in shared state
/// and handed to several listeners.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NfError {
    /// Generic error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// A cached value was requested before it was ever downloaded.
    /// A background download has been triggered; the caller should
    /// try again once the cache is updated.
    #[error("well-known data for {server} is not cached yet")]
    NotCachedYet {
        /// The server whose data is missing.
        server: Arc<str>,
    },
}

impl NfError {
    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Construct a "not cached yet" error.
    pub fn not_cached_yet<S: std::fmt::Display>(server: S) -> Self {
        Self::NotCachedYet {
            server: server.to_string().into_boxed_str().into(),
        }
    }

    /// True if this is the distinguished cache-miss condition.
    pub fn is_not_cached_yet(&self) -> bool {
        matches!(self, Self::NotCachedYet { .. })
    }
}

/// The netfetch result type.
pub type NfResult<T> = Result<T, NfError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "bla (src: None)",
            NfError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "foo (src: bar)",
            NfError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
        assert_eq!(
            "well-known data for https://srv.example is not cached yet",
            NfError::not_cached_yet("https://srv.example")
                .to_string()
                .as_str(),
        );
    }

    #[test]
    fn not_cached_yet_is_distinguished() {
        assert!(NfError::not_cached_yet("a").is_not_cached_yet());
        assert!(!NfError::other("a").is_not_cached_yet());
    }

    #[test]
    fn ensure_nferror_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(NfError::other("bla"));
    }
}
