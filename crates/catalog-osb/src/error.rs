//! Broker call failures
//!
//! The controller distinguishes an authoritative rejection from the broker
//! (an HTTP response carrying a status code) from a failure to reach it at all.

use std::fmt;

use thiserror::Error;

/// HTTP status a broker uses to report that the resource no longer exists
pub const HTTP_GONE: u16 = 410;

/// Structured HTTP error body returned by a broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpError {
    /// HTTP status code of the response
    pub status_code: u16,
    /// Machine-readable error code (e.g. "AsyncRequired")
    pub error_message: Option<String>,
    /// Human-readable description supplied by the broker
    pub description: Option<String>,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status code {}", self.status_code)?;
        if let Some(message) = &self.error_message {
            write!(f, "; error: {message}")?;
        }
        if let Some(description) = &self.description {
            write!(f, "; description: {description}")?;
        }
        Ok(())
    }
}

/// Error returned by every [`BrokerClient`](crate::BrokerClient) operation
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker answered with a non-success HTTP status
    #[error("broker returned an error: {0}")]
    Http(HttpError),

    /// The broker could not be reached or its response could not be read
    #[error("transport error: {message}")]
    Transport {
        /// Description of what failed
        message: String,
    },

    /// A client could not be built from the supplied configuration
    #[error("invalid client configuration: {message}")]
    Configuration {
        /// Description of what is invalid
        message: String,
    },
}

impl BrokerError {
    /// Create an HTTP error with the given status and optional body fields
    pub fn http(
        status_code: u16,
        error_message: Option<impl Into<String>>,
        description: Option<impl Into<String>>,
    ) -> Self {
        Self::Http(HttpError {
            status_code,
            error_message: error_message.map(Into::into),
            description: description.map(Into::into),
        })
    }

    /// Create an HTTP error carrying only a status code
    pub fn status(status_code: u16) -> Self {
        Self::Http(HttpError {
            status_code,
            error_message: None,
            description: None,
        })
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The HTTP error body, if the broker answered at all
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Self::Http(err) => Some(err),
            _ => None,
        }
    }

    /// True when the broker reports the resource as gone (HTTP 410)
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Http(err) if err.status_code == HTTP_GONE)
    }
}
