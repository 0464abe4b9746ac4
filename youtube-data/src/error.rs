//! Error kinds surfaced by requests and the controllers built on top of them.

use http::StatusCode;

/// Classification of a failure reported by the [`Transport`](crate::transport::Transport).
///
/// HTTP error statuses are reported as transport failures too, since the API frequently
/// answers them with a diagnostic JSON body that callers still want to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorCode {
    ConnectionRefused,
    Timeout,
    /// The call was aborted before it completed.
    OperationCanceled,
    /// HTTP 401.
    AuthenticationRequired,
    /// HTTP 403.
    ContentAccessDenied,
    /// HTTP 404.
    ContentNotFound,
    /// Any other non-success HTTP status.
    Http(u16),
    Unknown,
}

impl NetworkErrorCode {
    /// Maps a non-success HTTP status to the matching code.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Self::AuthenticationRequired,
            StatusCode::FORBIDDEN => Self::ContentAccessDenied,
            StatusCode::NOT_FOUND => Self::ContentNotFound,
            other => Self::Http(other.as_u16()),
        }
    }
}

/// The ways a request, or an operation made of requests, can fail.
///
/// Every terminal failure carries one of these kinds; the `Display` output is the
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Network, DNS, TLS or HTTP-status level failure.
    #[error("{message}")]
    Network {
        code: NetworkErrorCode,
        message: String,
    },

    /// The API rejected the credentials and they could not be refreshed.
    #[error("{0}")]
    Authentication(String),

    /// The response body was not valid JSON.
    #[error("Unable to parse response")]
    Parse,

    /// Well-formed JSON carrying an application-level error, or an unexpected shape.
    #[error("{0}")]
    UnknownContent(String),

    /// A caller-supplied parameter violates a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another submission is already in flight on this request.
    #[error("another request is already in flight")]
    Busy,

    /// The operation was canceled by the caller.
    #[error("request canceled")]
    Canceled,
}

impl Error {
    /// The network code, if this is a transport-level failure.
    pub fn network_code(&self) -> Option<NetworkErrorCode> {
        match self {
            Self::Network { code, .. } => Some(*code),
            Self::Authentication(_) => Some(NetworkErrorCode::AuthenticationRequired),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
