//! Error types surfaced to callers of the client and registry.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::PathToUriError;

/// The configuration document as a whole could not be used.
///
/// Problems confined to one language entry never produce this; that entry is
/// logged and dropped instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration document is not valid JSON")]
    Parse(#[from] serde_json::Error),
    #[error("configuration document must be a JSON object keyed by language")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum LspError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no language server configured for {}", path.display())]
    UnsupportedFile { path: PathBuf },

    #[error("no language server configured for language '{language}'")]
    ServerNotFound { language: String },

    #[error("failed to start '{command}' for language '{language}'")]
    Spawn {
        language: String,
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("language server for '{language}' failed to initialize: {reason}")]
    Initialize { language: String, reason: String },

    #[error(transparent)]
    Uri(#[from] PathToUriError),

    #[error("{method} timed out after {}s", timeout.as_secs_f32())]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },

    #[error("{method} was cancelled before a response arrived")]
    Cancelled { method: &'static str },

    #[error("connection to language server closed")]
    ConnectionClosed,

    #[error("language server rejected {method}: {message} (code {code})")]
    Response {
        method: &'static str,
        code: i64,
        message: String,
    },
}

impl LspError {
    /// Whether the backend answered with JSON-RPC `MethodNotFound`.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Response { code, .. } if *code == crate::protocol::METHOD_NOT_FOUND)
    }
}
