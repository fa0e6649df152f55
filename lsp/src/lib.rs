//! Async client for driving several language servers at once.
//!
//! [`LspClient`] resolves a file to its language, starts (or reuses) that
//! language's server as a child process, and talks JSON-RPC to it over stdio.
//! Results come back as [`polyglot_types`] values.

pub mod codec;
pub mod config;

mod client;
mod error;
mod registry;
mod server;

pub(crate) mod protocol;
pub(crate) mod rpc;

pub use client::LspClient;
pub use config::{CONFIG_FILE_NAME, ClientSettings, ServerConfig, ServerConfigs};
pub use error::{ConfigError, LspError};
pub use polyglot_types::{
    Diagnostic, DiagnosticCode, DiagnosticSeverity, HoverInfo, Location, Position, Range,
    TextEdit, WorkspaceEdit,
};
pub use protocol::PathToUriError;
pub use registry::ServerRegistry;
pub use server::{ProcessHandle, ProcessState, ServerHandle};
