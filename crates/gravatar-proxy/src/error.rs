//! Error types for the Gravatar proxy

use std::fmt;

/// Why an upstream avatar fetch did not produce an image.
///
/// `Clone` so a single in-flight fetch can hand its result to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request did not complete within the fetch timeout
    Timeout,
    /// Upstream has no custom avatar for this hash
    NotFound,
    /// Any other transport failure or unexpected upstream response
    Upstream(String),
}

impl FetchError {
    /// Transient failures are never remembered and are retried on the next request
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::NotFound)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "Upstream request timed out"),
            FetchError::NotFound => write!(f, "Upstream has no avatar for this hash"),
            FetchError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Upstream(err.to_string())
        }
    }
}

/// Process-level failures: startup, configuration and serving
#[derive(Debug)]
pub enum ProxyError {
    Cache(avatar_blob_cache::CacheError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Cache(err) => Some(err),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<avatar_blob_cache::CacheError> for ProxyError {
    fn from(err: avatar_blob_cache::CacheError) -> Self {
        ProxyError::Cache(err)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
