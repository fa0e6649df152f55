//! Client facade: the public async API over the server registry.
//!
//! Every operation resolves the file's language first, makes sure that
//! language's server is running and initialized, opens the document, then
//! sends one request and parses the response into domain types.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use polyglot_types::{Diagnostic, HoverInfo, Location, Position, WorkspaceEdit};

use crate::config::{CONFIG_FILE_NAME, ClientSettings, ServerConfigs};
use crate::error::{ConfigError, LspError};
use crate::protocol;
use crate::registry::ServerRegistry;
use crate::server::ServerHandle;

/// Multi-language LSP client for one project root.
///
/// Call [`LspClient::cleanup`] before dropping; dropping without it still
/// kills every server process but skips the graceful LSP shutdown.
pub struct LspClient {
    root: PathBuf,
    registry: ServerRegistry,
}

impl LspClient {
    /// Client for `project_root`, configured from `<root>/.lsp.json` when it exists.
    pub fn new(project_root: impl Into<PathBuf>) -> Result<Self, LspError> {
        let root = absolute_root(project_root.into());
        let config_path = root.join(CONFIG_FILE_NAME);
        let configs = match ServerConfigs::from_file(&config_path) {
            Ok(configs) => configs,
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::debug!("No {CONFIG_FILE_NAME} in {}", root.display());
                ServerConfigs::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::with_settings(root, configs, ClientSettings::default()))
    }

    #[must_use]
    pub fn with_configs(project_root: impl Into<PathBuf>, configs: ServerConfigs) -> Self {
        Self::with_settings(project_root, configs, ClientSettings::default())
    }

    #[must_use]
    pub fn with_settings(
        project_root: impl Into<PathBuf>,
        configs: ServerConfigs,
        settings: ClientSettings,
    ) -> Self {
        let root = absolute_root(project_root.into());
        let registry = ServerRegistry::with_configs(root.clone(), configs, settings);
        Self { root, registry }
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Language whose server handles `path`, if any.
    #[must_use]
    pub fn get_language_for_file(&self, path: &Path) -> Option<String> {
        self.registry.get_language_for_file(&self.resolve_path(path))
    }

    /// Start (or reuse) the server for `language` and complete its handshake.
    pub async fn ensure_server_running(
        &self,
        language: &str,
    ) -> Result<Arc<ServerHandle>, LspError> {
        let server = self.registry.start_server(language).await?;
        server.ensure_initialized(&self.root).await?;
        Ok(server)
    }

    /// Stop every language server.
    pub async fn cleanup(&self) {
        self.registry.stop_all_servers().await;
    }

    /// Diagnostics for one file.
    ///
    /// Pull diagnostics are used when the server advertises them. Otherwise,
    /// or when the pull request is rejected as unknown, the server's latest
    /// `publishDiagnostics` for the file is returned.
    pub async fn get_diagnostics(&self, path: &Path) -> Result<Vec<Diagnostic>, LspError> {
        let (server, _, uri) = self.open_target(path).await?;

        if server.supports_pull_diagnostics() {
            let params = protocol::document_diagnostic_params(&uri);
            match server.request(protocol::DIAGNOSTIC, Some(params)).await {
                Ok(report) => {
                    return Ok(protocol::parse_diagnostics(
                        protocol::diagnostic_report_items(report),
                    ));
                }
                Err(e) if e.is_method_not_found() => {
                    tracing::debug!(
                        server = %server.language(),
                        "Pull diagnostics rejected, falling back to published diagnostics"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let wait = self.registry.settings().diagnostics_wait;
        let items = server
            .published_diagnostics(&uri, wait)
            .await
            .unwrap_or_default();
        Ok(protocol::parse_diagnostics(items))
    }

    /// Every reference to the symbol at `position`, declaration included.
    pub async fn find_references(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Vec<Location>, LspError> {
        let (server, path, _) = self.open_target(path).await?;
        let at = protocol::position_params(&path, position)?;
        let result = server
            .request(
                protocol::REFERENCES,
                Some(protocol::references_params(&at, true)),
            )
            .await?;
        Ok(protocol::parse_locations(result))
    }

    /// Edits that rename the symbol at `position`. Nothing is applied.
    pub async fn rename_symbol(
        &self,
        path: &Path,
        position: Position,
        new_name: &str,
    ) -> Result<WorkspaceEdit, LspError> {
        let (server, path, _) = self.open_target(path).await?;
        let at = protocol::position_params(&path, position)?;
        let result = server
            .request(protocol::RENAME, Some(protocol::rename_params(&at, new_name)))
            .await?;
        Ok(protocol::parse_workspace_edit(&result))
    }

    pub async fn get_hover_info(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<HoverInfo>, LspError> {
        let (server, path, _) = self.open_target(path).await?;
        let at = protocol::position_params(&path, position)?;
        let result = server
            .request(protocol::HOVER, Some(protocol::hover_params(&at)))
            .await?;
        Ok(protocol::parse_hover(&result))
    }

    /// Send the new full content of `path` to its server.
    pub async fn notify_file_changed(&self, path: &Path, text: &str) -> Result<(), LspError> {
        let path = self.resolve_path(path);
        let language = self.language_of(&path)?;
        let server = self.ensure_server_running(&language).await?;
        let uri = protocol::path_to_file_uri(&path)?;
        server.change_document(&path, uri.as_str(), text).await
    }

    /// `file://` URI for `path`; relative paths are taken from the project root.
    pub fn path_to_uri(&self, path: &Path) -> Result<String, LspError> {
        Ok(protocol::path_to_file_uri(&self.resolve_path(path))?.into())
    }

    /// Filesystem path of a `file://` URI. `None` for other schemes.
    #[must_use]
    pub fn uri_to_path(&self, uri: &str) -> Option<PathBuf> {
        protocol::file_uri_to_path(uri)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            protocol::normalize_path(path)
        } else {
            protocol::normalize_path(&self.root.join(path))
        }
    }

    fn language_of(&self, path: &Path) -> Result<String, LspError> {
        self.registry
            .get_language_for_file(path)
            .ok_or_else(|| LspError::UnsupportedFile {
                path: path.to_path_buf(),
            })
    }

    /// Resolve, start the server and open the document.
    async fn open_target(
        &self,
        path: &Path,
    ) -> Result<(Arc<ServerHandle>, PathBuf, String), LspError> {
        let path = self.resolve_path(path);
        let language = self.language_of(&path)?;
        let server = self.ensure_server_running(&language).await?;
        let uri = protocol::path_to_file_uri(&path)?.to_string();
        server.open_document(&path, &uri).await?;
        Ok((server, path, uri))
    }
}

fn absolute_root(root: PathBuf) -> PathBuf {
    match std::path::absolute(&root) {
        Ok(abs) => protocol::normalize_path(&abs),
        Err(e) => {
            tracing::warn!("Cannot make {} absolute: {e}", root.display());
            root
        }
    }
}
