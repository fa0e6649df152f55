//! Language server domain types for polyglot.
//!
//! This crate contains pure value types with no IO, no async, and minimal dependencies.
//! Every value is built fresh for one request or response and never mutated afterwards.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod diagnostic;
mod document;
mod edit;
mod position;

pub use diagnostic::{Diagnostic, DiagnosticCode, DiagnosticSeverity, UnknownSeverityError};
pub use document::{HoverInfo, TextDocumentIdentifier, TextDocumentPositionParams};
pub use edit::{TextEdit, WorkspaceEdit};
pub use position::{Location, Position, Range};
