use crate::k8s::config::ConfigError;
use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

/// HTTP status the API server uses when a resource version has been compacted away
pub const STALE_CURSOR_STATUS: u16 = 410;

#[derive(Debug, From)]
pub enum Error {
    /// Non-2xx response or connection failure during a list or watch
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// A watch record that is not valid JSON for the watched type
    Decode {
        record: String,
        source: serde_json::Error,
    },

    /// The requested resource version is no longer available; a relist is required
    StaleCursor { message: String },

    #[from]
    Configuration(ConfigError),

    #[from]
    Request(kube::core::request::Error),

    #[from]
    Json(serde_json::Error),

    /// Custom error message
    Custom(String),
}

impl Error {
    pub fn transport(status: Option<u16>, message: impl ToString) -> Self {
        Self::Transport {
            status,
            message: message.to_string(),
        }
    }

    /// Map an API server status code and message onto the error taxonomy
    pub fn from_status(code: u16, message: impl ToString) -> Self {
        if code == STALE_CURSOR_STATUS {
            Self::StaleCursor {
                message: message.to_string(),
            }
        } else {
            Self::transport(Some(code), message)
        }
    }

    #[must_use]
    pub const fn is_stale_cursor(&self) -> bool {
        matches!(self, Self::StaleCursor { .. })
    }

    /// Status code reported by the API server, if any
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            Self::StaleCursor { .. } => Some(STALE_CURSOR_STATUS),
            _ => None,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(status) => Self::from_status(status.code, &status.message),
            other => Self::transport(None, other),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Transport {
                status: Some(status),
                message,
            } => write!(fmt, "transport error (HTTP {status}): {message}"),
            Self::Transport {
                status: None,
                message,
            } => write!(fmt, "transport error: {message}"),
            Self::Decode { record, source } => {
                write!(fmt, "failed to decode watch record {record:?}: {source}")
            }
            Self::StaleCursor { message } => write!(fmt, "resource version too old: {message}"),
            Self::Configuration(err) => write!(fmt, "configuration error: {err}"),
            Self::Request(err) => write!(fmt, "invalid request: {err}"),
            Self::Json(err) => write!(fmt, "invalid response body: {err}"),
            Self::Custom(message) => write!(fmt, "{message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode { source, .. } => Some(source),
            Self::Configuration(err) => Some(err),
            Self::Request(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_410_is_stale_cursor() {
        let err = Error::from_status(410, "too old resource version: 5 (20)");
        assert!(err.is_stale_cursor());
        assert_eq!(err.status(), Some(410));
    }

    #[test]
    fn test_other_status_is_transport() {
        let err = Error::from_status(503, "unavailable");
        assert!(!err.is_stale_cursor());
        assert!(matches!(err, Error::Transport { status: Some(503), .. }));
        assert_eq!(err.to_string(), "transport error (HTTP 503): unavailable");
    }
}
