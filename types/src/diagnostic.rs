//! Diagnostics reported by a language server.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::Range;

/// Severity level for a diagnostic.
///
/// Discriminants equal the LSP wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown diagnostic severity {0}")]
pub struct UnknownSeverityError(pub u64);

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_lsp(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

impl TryFrom<u64> for DiagnosticSeverity {
    type Error = UnknownSeverityError;

    fn try_from(value: u64) -> Result<Self, UnknownSeverityError> {
        Self::from_lsp(value).ok_or(UnknownSeverityError(value))
    }
}

/// Server-specific diagnostic code. The wire allows either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiagnosticCode {
    Number(i64),
    Text(String),
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A single diagnostic from a language server.
///
/// Fields are private; a diagnostic is built once through [`Diagnostic::new`]
/// and read through accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    range: Range,
    severity: DiagnosticSeverity,
    code: Option<DiagnosticCode>,
    /// Tool that produced the diagnostic (e.g. "pyright", "rustc").
    /// Empty when the server did not say.
    source: String,
    message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        range: Range,
        severity: DiagnosticSeverity,
        code: Option<DiagnosticCode>,
        source: String,
        message: String,
    ) -> Self {
        Self {
            range,
            severity,
            code,
            source,
            message,
        }
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn code(&self) -> Option<&DiagnosticCode> {
        self.code.as_ref()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        let start = self.range.start;
        let mut out = format!(
            "{}:{}:{}: {}: ",
            path.display(),
            start.line + 1,
            start.character + 1,
            self.severity.label(),
        );
        if !self.source.is_empty() {
            out.push_str(&format!("[{}] ", self.source));
        }
        out.push_str(&self.message);
        if let Some(code) = &self.code {
            out.push_str(&format!(" ({code})"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::position::Position;

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(
            Range::new(Position::new(10, 5), Position::new(10, 9)),
            severity,
            None,
            "pyright".to_string(),
            msg.to_string(),
        )
    }

    #[test]
    fn test_from_lsp_known_values() {
        assert_eq!(
            DiagnosticSeverity::from_lsp(1),
            Some(DiagnosticSeverity::Error)
        );
        assert_eq!(
            DiagnosticSeverity::from_lsp(2),
            Some(DiagnosticSeverity::Warning)
        );
        assert_eq!(
            DiagnosticSeverity::from_lsp(3),
            Some(DiagnosticSeverity::Information)
        );
        assert_eq!(
            DiagnosticSeverity::from_lsp(4),
            Some(DiagnosticSeverity::Hint)
        );
    }

    #[test]
    fn test_from_lsp_unknown_returns_none() {
        assert_eq!(DiagnosticSeverity::from_lsp(0), None);
        assert_eq!(DiagnosticSeverity::from_lsp(99), None);
        assert_eq!(
            DiagnosticSeverity::try_from(7),
            Err(UnknownSeverityError(7))
        );
    }

    #[test]
    fn test_rank_matches_wire_value() {
        assert_eq!(DiagnosticSeverity::Error.as_lsp(), 1);
        assert_eq!(DiagnosticSeverity::Hint.as_lsp(), 4);
        assert!(DiagnosticSeverity::Error < DiagnosticSeverity::Warning);
    }

    #[test]
    fn test_is_error_only_for_error() {
        assert!(make_diag(DiagnosticSeverity::Error, "e").is_error());
        assert!(!make_diag(DiagnosticSeverity::Warning, "w").is_error());
        assert!(!make_diag(DiagnosticSeverity::Information, "i").is_error());
        assert!(!make_diag(DiagnosticSeverity::Hint, "h").is_error());
    }

    #[test]
    fn test_display_with_path() {
        let diag = make_diag(DiagnosticSeverity::Error, "Undefined variable 'x'");
        let path = PathBuf::from("src/app.py");
        // line/col are 0-indexed internally, displayed as 1-indexed
        assert_eq!(
            diag.display_with_path(&path),
            "src/app.py:11:6: error: [pyright] Undefined variable 'x'"
        );
    }

    #[test]
    fn test_display_with_path_code_without_source() {
        let diag = Diagnostic::new(
            Range::new(Position::new(0, 0), Position::new(0, 1)),
            DiagnosticSeverity::Warning,
            Some(DiagnosticCode::Number(6133)),
            String::new(),
            "unused import".to_string(),
        );
        assert_eq!(
            diag.display_with_path(&PathBuf::from("a.ts")),
            "a.ts:1:1: warning: unused import (6133)"
        );
    }

    #[test]
    fn test_code_accepts_number_or_string() {
        let n: DiagnosticCode = serde_json::from_value(serde_json::json!(2304)).unwrap();
        let s: DiagnosticCode =
            serde_json::from_value(serde_json::json!("reportUndefinedVariable")).unwrap();
        assert_eq!(n, DiagnosticCode::Number(2304));
        assert_eq!(s.to_string(), "reportUndefinedVariable");
    }
}
