//! Error types for the bridge.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Malformed input: {message}")]
    MalformedInput { message: String },

    #[error("Unknown upstream '{alias}'")]
    UnknownUpstream { alias: String },

    /// A 2xx upstream response that does not have the expected shape.
    /// `body` holds a truncated excerpt of what the upstream sent.
    #[error("Upstream protocol error: {message}")]
    UpstreamProtocol { message: String, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: msg.into(),
        }
    }

    pub fn unknown_upstream(alias: impl Into<String>) -> Self {
        Self::UnknownUpstream {
            alias: alias.into(),
        }
    }

    pub fn upstream_protocol(msg: impl Into<String>, body: impl Into<String>) -> Self {
        Self::UpstreamProtocol {
            message: msg.into(),
            body: body.into(),
        }
    }

    /// Replace the body excerpt of an `UpstreamProtocol` error. Other errors are
    /// returned unchanged.
    pub fn with_upstream_body(self, excerpt: impl Into<String>) -> Self {
        match self {
            Self::UpstreamProtocol { message, .. } => Self::UpstreamProtocol {
                message,
                body: excerpt.into(),
            },
            other => other,
        }
    }

    /// Whether the caller, rather than the upstream, is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedInput { .. } | Self::UnknownUpstream { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Cut `s` to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
