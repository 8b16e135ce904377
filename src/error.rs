use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the object model, the registry, the local index and the client.
///
/// Structural errors are raised before any I/O or signature work happens.
/// Transport errors are mostly absorbed by the registry and the iterators; the
/// exhaustion variants (`NotFound`, `AllServersFailed`) are what callers see
/// when no server could help.
#[derive(Error, Debug)]
pub enum Error {
    #[error("content too large: {field} is {len}, limit is {limit}")]
    ContentTooLarge {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("too many objects: {0} (limit is 256)")]
    TooManyObjects(usize),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("unverified object {0}")]
    Unverified(String),

    #[error("transport error talking to {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no server accepted {0}")]
    AllServersFailed(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    pub fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Malformed {
            what,
            reason: reason.into(),
        }
    }

    /// Exhaustion errors: nobody had the object, or nobody accepted it.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::AllServersFailed(_))
    }
}

impl From<secp256k1::Error> for Error {
    fn from(err: secp256k1::Error) -> Self {
        Error::Key(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_too_large_display_test() {
        let err = Error::ContentTooLarge {
            field: "content",
            len: 2048,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("content"));
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn exhaustion_test() {
        assert!(Error::NotFound(String::from("urn:cid:abc")).is_exhaustion());
        assert!(Error::AllServersFailed(String::from("urn:cid:abc")).is_exhaustion());
        assert!(!Error::UnknownServer(String::from("http://a")).is_exhaustion());
        assert!(!Error::malformed("message", "missing actor").is_exhaustion());
    }

    #[test]
    fn from_json_error_test() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
