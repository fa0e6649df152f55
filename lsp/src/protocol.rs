//! LSP message shapes: outgoing envelopes and params, incoming result parsing.
//!
//! Parsers here never fail a whole response because one field is missing or
//! one item is malformed; bad items are dropped and logged at debug level.

use std::path::{Component, Path, PathBuf};

use polyglot_types::{
    Diagnostic, DiagnosticCode, DiagnosticSeverity, HoverInfo, Location, Position, Range,
    TextDocumentPositionParams, TextEdit, WorkspaceEdit,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::LspError;

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";
pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CHANGE: &str = "textDocument/didChange";
pub(crate) const DIAGNOSTIC: &str = "textDocument/diagnostic";
pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
pub(crate) const REFERENCES: &str = "textDocument/references";
pub(crate) const RENAME: &str = "textDocument/rename";
pub(crate) const HOVER: &str = "textDocument/hover";

/// JSON-RPC `MethodNotFound`.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

// ── Envelopes ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    jsonrpc: &'static str,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseError {
    code: i64,
    message: String,
}

/// Reply to a request the server sent us.
#[derive(Debug, Serialize)]
pub(crate) struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ResponseError>,
}

impl Response {
    pub fn new(id: Value, outcome: Result<Value, (i64, String)>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err((code, message)) => (None, Some(ResponseError { code, message })),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

/// Any frame the client writes.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum Outgoing {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Split a response body into its `result`, or the error the server sent.
/// A missing `result` is treated as `null`.
pub(crate) fn response_result(method: &'static str, mut body: Value) -> Result<Value, LspError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(LspError::Response {
            method,
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}

// ── Params ─────────────────────────────────────────────────────────────

pub(crate) fn initialize_params(root_uri: &str) -> Value {
    json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                },
                "diagnostic": {
                    "dynamicRegistration": false,
                    "relatedDocumentSupport": false
                },
                "references": { "dynamicRegistration": false },
                "rename": { "dynamicRegistration": false, "prepareSupport": false },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                }
            },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "workspaceEdit": { "documentChanges": true }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn document_diagnostic_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn references_params(at: &TextDocumentPositionParams, include_declaration: bool) -> Value {
    json!({
        "textDocument": at.text_document,
        "position": at.position,
        "context": { "includeDeclaration": include_declaration }
    })
}

pub(crate) fn rename_params(at: &TextDocumentPositionParams, new_name: &str) -> Value {
    json!({
        "textDocument": at.text_document,
        "position": at.position,
        "newName": new_name
    })
}

pub(crate) fn hover_params(at: &TextDocumentPositionParams) -> Value {
    json!(at)
}

// ── Paths and URIs ─────────────────────────────────────────────────────

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

/// Canonical string form of a file URI, so that differently-escaped spellings
/// of the same path compare equal. Non-file URIs are returned unchanged.
pub(crate) fn normalize_uri(uri: &str) -> String {
    file_uri_to_path(uri)
        .and_then(|path| path_to_file_uri(&path).ok())
        .map_or_else(|| uri.to_string(), String::from)
}

pub(crate) fn position_params(
    path: &Path,
    position: Position,
) -> Result<TextDocumentPositionParams, PathToUriError> {
    let uri = path_to_file_uri(path)?;
    Ok(TextDocumentPositionParams::new(uri, position))
}

// ── Diagnostics ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    /// Document version the diagnostics were computed for, when the server says.
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub diagnostics: Vec<Value>,
}

/// Wire diagnostic. Everything but `range` and `message` is optional.
#[derive(Debug, Deserialize)]
struct LspDiagnostic {
    range: Range,
    severity: Option<u64>,
    code: Option<Value>,
    source: Option<String>,
    message: String,
}

impl LspDiagnostic {
    fn into_diagnostic(self) -> Diagnostic {
        let code = match self.code {
            Some(Value::Number(n)) => n.as_i64().map(DiagnosticCode::Number),
            Some(Value::String(s)) => Some(DiagnosticCode::Text(s)),
            _ => None,
        };
        Diagnostic::new(
            self.range,
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            code,
            self.source.unwrap_or_default(),
            self.message,
        )
    }
}

/// Items of a `textDocument/diagnostic` report. `unchanged` reports carry none.
pub(crate) fn diagnostic_report_items(report: Value) -> Vec<Value> {
    match report {
        Value::Object(mut obj) => match obj.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

pub(crate) fn parse_diagnostics(items: Vec<Value>) -> Vec<Diagnostic> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<LspDiagnostic>(item) {
            Ok(d) => Some(d.into_diagnostic()),
            Err(e) => {
                tracing::debug!("Skipping malformed diagnostic: {e}");
                None
            }
        })
        .collect()
}

// ── References ─────────────────────────────────────────────────────────

fn parse_location(item: Value) -> Option<Location> {
    // LocationLink carries targetUri / targetSelectionRange instead.
    if item.get("targetUri").is_some() {
        let uri = item.get("targetUri")?.as_str()?.to_string();
        let range = item
            .get("targetSelectionRange")
            .or_else(|| item.get("targetRange"))
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())?;
        return Some(Location::new(uri, range));
    }
    serde_json::from_value(item)
        .map_err(|e| tracing::debug!("Skipping malformed location: {e}"))
        .ok()
}

/// `null`, a single location, or an array of locations / location links.
pub(crate) fn parse_locations(result: Value) -> Vec<Location> {
    match result {
        Value::Array(items) => items.into_iter().filter_map(parse_location).collect(),
        value @ Value::Object(_) => parse_location(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

// ── Rename ─────────────────────────────────────────────────────────────

fn parse_text_edits(edits: Option<&Value>) -> Vec<TextEdit> {
    let Some(Value::Array(items)) = edits else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            serde_json::from_value::<TextEdit>(item.clone())
                .map_err(|e| tracing::debug!("Skipping malformed text edit: {e}"))
                .ok()
        })
        .collect()
}

/// Accepts both the `changes` map and the `documentChanges` array forms.
/// `documentChanges` wins when both are present.
pub(crate) fn parse_workspace_edit(result: &Value) -> WorkspaceEdit {
    let mut edit = WorkspaceEdit::new();

    if let Some(document_changes) = result.get("documentChanges").and_then(Value::as_array) {
        for change in document_changes {
            if let Some(kind) = change.get("kind").and_then(Value::as_str) {
                tracing::debug!("Skipping resource operation '{kind}' in workspace edit");
                continue;
            }
            let Some(uri) = change.pointer("/textDocument/uri").and_then(Value::as_str) else {
                tracing::debug!("Skipping document change without a text document URI");
                continue;
            };
            let edits = parse_text_edits(change.get("edits"));
            if !edits.is_empty() {
                edit.push_edits(uri, edits);
            }
        }
    } else if let Some(changes) = result.get("changes").and_then(Value::as_object) {
        for (uri, edits) in changes {
            let edits = parse_text_edits(Some(edits));
            if !edits.is_empty() {
                edit.push_edits(uri.clone(), edits);
            }
        }
    }

    edit
}

// ── Hover ──────────────────────────────────────────────────────────────

/// Flatten `MarkupContent`, `MarkedString`, or an array of `MarkedString`.
fn hover_text(contents: &Value) -> String {
    match contents {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            let value = obj.get("value").and_then(Value::as_str).unwrap_or_default();
            match obj.get("language").and_then(Value::as_str) {
                Some(language) if !value.is_empty() => format!("```{language}\n{value}\n```"),
                _ => value.to_string(),
            }
        }
        Value::Array(parts) => parts
            .iter()
            .map(hover_text)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

pub(crate) fn parse_hover(result: &Value) -> Option<HoverInfo> {
    let contents = hover_text(result.get("contents")?);
    if contents.trim().is_empty() {
        return None;
    }
    let range = result
        .get("range")
        .cloned()
        .and_then(|r| serde_json::from_value(r).ok());
    Some(HoverInfo { contents, range })
}
