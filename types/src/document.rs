//! Request-shaping document identifiers and hover results.

use serde::{Deserialize, Serialize};

use crate::position::{Position, Range};

/// `{uri}`: names a document on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

impl TextDocumentIdentifier {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// `{textDocument, position}`: the common shape of positional requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentPositionParams {
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
}

impl TextDocumentPositionParams {
    #[must_use]
    pub fn new(uri: impl Into<String>, position: Position) -> Self {
        Self {
            text_document: TextDocumentIdentifier::new(uri),
            position,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.text_document.uri
    }
}

/// Hover documentation, flattened to plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverInfo {
    pub contents: String,
    /// Span the hover applies to, when the server reports one.
    pub range: Option<Range>,
}
