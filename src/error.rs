use std::io;

use http::StatusCode;
use n0_error::{AnyError, e, stack_error};

use crate::{buffer::Span, message::ReadingState};

/// Errors raised while scanning, storing or writing an HTTP message.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum MessageError {
    /// The input ended before the first byte of a message.
    ///
    /// This is the normal way for a keep-alive peer to end a session.
    #[error("stream ended before a message started")]
    StreamEnded,

    /// The message violates HTTP/1.x framing syntax.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Status code suggested for the client-facing error response.
        status: StatusCode,
        /// Short description of what was wrong.
        reason: &'static str,
    },

    /// A modification overlaps another one or the spans are not sorted.
    #[error("modification span {span} conflicts with another modification")]
    SpanConflict { span: Span },

    /// The operation is not allowed in the current reading state.
    #[error("operation not allowed in reading state {state:?}")]
    InvalidState { state: ReadingState },

    /// IO error on the underlying stream or body storage.
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl From<io::Error> for MessageError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(MessageError::Io { source })
    }
}

impl MessageError {
    #[track_caller]
    pub(crate) fn bad_request(reason: &'static str) -> Self {
        e!(MessageError::Malformed {
            status: StatusCode::BAD_REQUEST,
            reason
        })
    }

    #[track_caller]
    pub(crate) fn invalid_state(state: ReadingState) -> Self {
        e!(MessageError::InvalidState { state })
    }

    /// Returns the status code a client should see for this error, if any.
    pub fn suggested_status(&self) -> Option<StatusCode> {
        match self {
            MessageError::Malformed { status, .. } => Some(*status),
            MessageError::SpanConflict { .. } | MessageError::InvalidState { .. } => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            MessageError::StreamEnded { .. } | MessageError::Io { .. } => None,
        }
    }

    pub(crate) fn is_stream_ended(&self) -> bool {
        matches!(self, MessageError::StreamEnded { .. })
    }
}

/// Errors that end the communication on one client connection.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ProxyError {
    /// The client sent a request that could not be parsed.
    #[error("invalid request from client")]
    BadRequest {
        #[error(source)]
        source: MessageError,
    },

    /// The request carries no host to route it to.
    #[error("request has no target host")]
    MissingHost,

    /// The upstream peer sent a response that could not be parsed.
    #[error("invalid response from upstream")]
    BadResponse {
        #[error(source)]
        source: MessageError,
    },

    /// Streaming the request to the upstream peer failed.
    #[error("failed to forward request upstream")]
    ForwardFailed {
        #[error(source)]
        source: MessageError,
    },

    /// The upstream peer closed the connection instead of responding.
    #[error("upstream closed the connection before responding")]
    UpstreamClosed,

    /// None of the candidate upstream endpoints accepted a connection.
    #[error("failed to connect to upstream {endpoints}")]
    UpstreamConnect {
        /// Comma separated list of the endpoints that were tried.
        endpoints: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// IO error while relaying bytes between the peers.
    #[error("io error")]
    Io {
        #[error(source)]
        source: AnyError,
    },

    /// Invariant violation inside the proxy.
    #[error("internal error")]
    Internal {
        #[error(source)]
        source: AnyError,
    },
}

impl From<io::Error> for ProxyError {
    #[track_caller]
    fn from(value: io::Error) -> Self {
        e!(ProxyError::Io, value.into())
    }
}

impl ProxyError {
    /// Returns the HTTP status code to surface to the client, if any.
    ///
    /// `None` means the connection should be torn down without a response,
    /// usually because one of the peers is already gone.
    pub fn should_reply(&self) -> Option<StatusCode> {
        match self {
            ProxyError::BadRequest { source, .. } => source.suggested_status(),
            ProxyError::MissingHost { .. } => Some(StatusCode::BAD_REQUEST),
            ProxyError::BadResponse { source, .. } => match source {
                MessageError::Io { .. } => None,
                _ => Some(StatusCode::BAD_GATEWAY),
            },
            ProxyError::ForwardFailed { .. }
            | ProxyError::UpstreamClosed { .. }
            | ProxyError::UpstreamConnect { .. } => Some(StatusCode::BAD_GATEWAY),
            ProxyError::Io { .. } => None,
            ProxyError::Internal { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

/// Invalid listener address or parameter.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ListenerError {
    #[error("invalid listener endpoint {input:?}")]
    InvalidEndpoint { input: String },
    #[error("invalid listener parameter {param:?}")]
    InvalidParameter { param: String },
}
