//! Launch configuration for language servers.
//!
//! The configuration document is a JSON object keyed by language name:
//!
//! ```json
//! {
//!   "$schema": "https://example.invalid/lsp.schema.json",
//!   "python": {
//!     "command": "pyright-langserver",
//!     "args": ["--stdio"],
//!     "extensionToLanguage": { ".py": "python", ".pyi": "python" }
//!   }
//! }
//! ```
//!
//! Keys starting with `$` or `_` are metadata and never treated as languages.
//! A malformed language entry is logged and dropped; only a document that is
//! not a JSON object at all fails the load.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// File name of the configuration document inside a project root.
pub const CONFIG_FILE_NAME: &str = ".lsp.json";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_DIAGNOSTICS_WAIT: Duration = Duration::from_secs(5);

/// Runtime knobs shared by the registry and the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// How long a single request may wait for its response.
    pub request_timeout: Duration,
    /// Grace period for `shutdown`/`exit` and for the process to exit before it is killed.
    pub shutdown_timeout: Duration,
    /// How long to wait for pushed diagnostics when the server has no pull support.
    pub diagnostics_wait: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            diagnostics_wait: DEFAULT_DIAGNOSTICS_WAIT,
        }
    }
}

fn is_metadata_key(key: &str) -> bool {
    key.starts_with('$') || key.starts_with('_')
}

/// Extensions are stored with a leading dot so `"py"` and `".py"` both match `a.py`
/// and neither matches `happy`.
fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

/// One language entry as written in the configuration document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, deserialize_with = "ordered_pairs")]
    extension_to_language: Vec<(String, String)>,
}

/// A JSON object of string values as `(key, value)` pairs in document order.
fn ordered_pairs<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PairsVisitor;

    impl<'de> Visitor<'de> for PairsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an object mapping extensions to language ids")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(pair) = map.next_entry::<String, String>()? {
                pairs.push(pair);
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(PairsVisitor)
}

/// Configuration for a single language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    language: String,
    command: String,
    args: Vec<String>,
    /// `(".ext", languageId)` in document order.
    extension_to_language: Vec<(String, String)>,
}

impl ServerConfig {
    pub fn new<E, L>(
        language: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        extensions: impl IntoIterator<Item = (E, L)>,
    ) -> Self
    where
        E: AsRef<str>,
        L: Into<String>,
    {
        Self {
            language: language.into(),
            command: command.into(),
            args,
            extension_to_language: extensions
                .into_iter()
                .map(|(ext, id)| (normalize_extension(ext.as_ref()), id.into()))
                .collect(),
        }
    }

    /// Parse one language entry of the configuration document.
    fn from_entry(language: &str, value: &Value) -> Result<Self, String> {
        let raw = RawServerConfig::deserialize(value).map_err(|e| e.to_string())?;
        if raw.command.trim().is_empty() {
            return Err("\"command\" must be a non-empty string".to_string());
        }
        Ok(Self::new(
            language,
            raw.command,
            raw.args,
            raw.extension_to_language,
        ))
    }

    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// `[command, *args]`.
    #[must_use]
    pub fn full_command(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extension_to_language.iter().map(|(ext, _)| ext.as_str())
    }

    /// Longest configured suffix matching the file name, case-sensitive.
    fn matching_entry(&self, path: &Path) -> Option<&(String, String)> {
        let file_name = path.file_name()?.to_str()?;
        self.extension_to_language
            .iter()
            .filter(|(ext, _)| ext.len() > 1 && file_name.ends_with(ext.as_str()))
            .max_by_key(|(ext, _)| ext.len())
    }

    #[must_use]
    pub fn handles(&self, path: &Path) -> bool {
        self.matching_entry(path).is_some()
    }

    /// LSP `languageId` for a file this server handles.
    #[must_use]
    pub fn language_id_for(&self, path: &Path) -> Option<&str> {
        self.matching_entry(path).map(|(_, id)| id.as_str())
    }
}

/// All configured servers, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfigs {
    servers: Vec<ServerConfig>,
}

impl ServerConfigs {
    #[must_use]
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self { servers }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let Value::Object(document) = value else {
            return Err(ConfigError::NotAnObject);
        };
        Ok(Self::from_document(document))
    }

    fn from_document(document: &Map<String, Value>) -> Self {
        let mut servers = Vec::new();
        for (key, entry) in document {
            if is_metadata_key(key) {
                tracing::trace!("Skipping metadata key '{key}' in LSP configuration");
                continue;
            }
            match ServerConfig::from_entry(key, entry) {
                Ok(config) => servers.push(config),
                Err(reason) => {
                    tracing::warn!("Ignoring LSP configuration for '{key}': {reason}");
                }
            }
        }
        Self { servers }
    }

    #[must_use]
    pub fn get(&self, language: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.language == language)
    }

    /// Language whose server handles `path`. The first config in document
    /// order wins when several claim the same extension.
    #[must_use]
    pub fn language_for_file(&self, path: &Path) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.handles(path))
            .map(ServerConfig::language)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(ServerConfig::language)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
