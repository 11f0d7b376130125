//! Error types returned by queries.
//!
//! [`Error`] says what went wrong, [`QueryError`] additionally records which
//! endpoint produced the failure and, for DoH, the HTTP response head.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::error::ProtoError;
use thiserror::Error;

use crate::doh::HttpResponse;
use crate::endpoint::{Endpoint, Method};

pub type Result<T, E = QueryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller's abort signal fired.
    #[error("Request aborted.")]
    Abort,

    /// No progress within the inactivity window.
    #[error("Timeout ({}ms).", .0.as_millis())]
    Timeout(Duration),

    #[error("status={status} while requesting {uri} [{method}]")]
    HttpStatus {
        uri: String,
        status: u16,
        method: Method,
    },

    /// The resolver answered with an empty or undecodable body.
    #[error("{message}")]
    Response {
        message: String,
        #[source]
        source: Option<ProtoError>,
    },

    #[error("{0}")]
    InvalidInput(String),

    #[error("failed to encode query: {0}")]
    Codec(#[source] ProtoError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub(crate) fn response(message: impl Into<String>) -> Self {
        Error::Response {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn invalid_packet(cause: ProtoError) -> Self {
        Error::Response {
            message: format!("Invalid packet (cause: {cause})"),
            source: Some(cause),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort)
    }

    /// Whether another attempt may succeed. Aborts and caller mistakes are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Abort | Error::InvalidInput(_) | Error::Codec(_)
        )
    }
}

/// A failed query, annotated with where it failed.
#[derive(Debug)]
pub struct QueryError {
    error: Error,
    endpoint: Option<Arc<Endpoint>>,
    response: Option<HttpResponse>,
}

impl QueryError {
    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_error(self) -> Error {
        self.error
    }

    /// The endpoint of the attempt that produced this error.
    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    /// The HTTP response head, when a DoH resolver got as far as answering.
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn is_abort(&self) -> bool {
        self.error.is_abort()
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    pub(crate) fn with_endpoint(mut self, endpoint: &Arc<Endpoint>) -> Self {
        if self.endpoint.is_none() {
            self.endpoint = Some(endpoint.clone());
        }
        self
    }

    pub(crate) fn with_response(mut self, response: Option<HttpResponse>) -> Self {
        if self.response.is_none() {
            self.response = response;
        }
        self
    }
}

impl From<Error> for QueryError {
    fn from(error: Error) -> Self {
        QueryError {
            error,
            endpoint: None,
            response: None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{} (endpoint: {})", self.error, endpoint),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
