//! Server registry: at most one running server per language.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;

use crate::config::{ClientSettings, ServerConfig, ServerConfigs};
use crate::error::{ConfigError, LspError};
use crate::server::ServerHandle;

/// Owns the language server processes of one project.
///
/// Starting is check-then-act under a single async lock, so concurrent starts
/// for the same language share one process. Starts and stops of one language
/// are also serialized against each other: a start issued while that
/// language's server is shutting down waits for the old process to be gone.
pub struct ServerRegistry {
    root: PathBuf,
    settings: ClientSettings,
    configs: RwLock<ServerConfigs>,
    servers: Mutex<HashMap<String, Arc<ServerHandle>>>,
    lifecycles: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerRegistry {
    /// An empty registry rooted at `root`. Servers are spawned with `root` as
    /// their working directory.
    pub fn new(root: impl Into<PathBuf>, settings: ClientSettings) -> Self {
        Self::with_configs(root, ServerConfigs::default(), settings)
    }

    pub fn with_configs(
        root: impl Into<PathBuf>,
        configs: ServerConfigs,
        settings: ClientSettings,
    ) -> Self {
        Self {
            root: root.into(),
            settings,
            configs: RwLock::new(configs),
            servers: Mutex::new(HashMap::new()),
            lifecycles: StdMutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn configs(&self) -> RwLockReadGuard<'_, ServerConfigs> {
        self.configs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn configs_mut(&self) -> RwLockWriteGuard<'_, ServerConfigs> {
        self.configs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the configuration. Running servers keep running with the
    /// configuration they were started with.
    pub fn set_configs(&self, configs: ServerConfigs) {
        let count = configs.len();
        *self.configs_mut() = configs;
        tracing::info!("Loaded {count} language server configuration(s)");
    }

    pub fn load_config_str(&self, text: &str) -> Result<(), ConfigError> {
        self.set_configs(ServerConfigs::from_json_str(text)?);
        Ok(())
    }

    pub fn load_config_file(&self, path: &Path) -> Result<(), ConfigError> {
        self.set_configs(ServerConfigs::from_file(path)?);
        Ok(())
    }

    #[must_use]
    pub fn config_for(&self, language: &str) -> Option<ServerConfig> {
        self.configs().get(language).cloned()
    }

    /// Languages that have a configuration, in document order.
    #[must_use]
    pub fn configured_languages(&self) -> Vec<String> {
        self.configs().languages().map(String::from).collect()
    }

    /// Language whose server handles `path`, if any.
    #[must_use]
    pub fn get_language_for_file(&self, path: &Path) -> Option<String> {
        self.configs().language_for_file(path).map(String::from)
    }

    /// Lock held while `language`'s server is being started or stopped.
    fn lifecycle(&self, language: &str) -> Arc<Mutex<()>> {
        let mut lifecycles = self.lifecycles.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lifecycles.entry(language.to_string()).or_default())
    }

    /// The registered handle for `language`, running or not.
    pub async fn get_server(&self, language: &str) -> Option<Arc<ServerHandle>> {
        self.servers.lock().await.get(language).cloned()
    }

    /// Return the running server for `language`, spawning it if needed.
    ///
    /// A registered handle whose process has exited is replaced.
    pub async fn start_server(&self, language: &str) -> Result<Arc<ServerHandle>, LspError> {
        let lifecycle = self.lifecycle(language);
        let _lifecycle = lifecycle.lock().await;
        let mut servers = self.servers.lock().await;

        if let Some(existing) = servers.get(language) {
            if existing.is_running() {
                return Ok(Arc::clone(existing));
            }
            tracing::info!(
                server = %language,
                code = ?existing.exit_code(),
                "Replacing exited language server"
            );
            servers.remove(language);
        }

        let config = self
            .config_for(language)
            .ok_or_else(|| LspError::ServerNotFound {
                language: language.to_string(),
            })?;

        tracing::info!(
            server = %language,
            command = ?config.full_command(),
            "Starting language server"
        );
        let handle = Arc::new(ServerHandle::spawn(config, &self.root, &self.settings)?);
        servers.insert(language.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Unregister and shut down the server for `language`. No-op when none is registered.
    ///
    /// Returns once the process is gone; a concurrent [`Self::start_server`]
    /// for the same language waits until then.
    pub async fn stop_server(&self, language: &str) {
        let lifecycle = self.lifecycle(language);
        let _lifecycle = lifecycle.lock().await;
        let removed = self.servers.lock().await.remove(language);
        if let Some(handle) = removed {
            tracing::info!(server = %language, "Stopping language server");
            handle.shutdown().await;
        }
    }

    /// Shut down every registered server. The registry is empty afterwards.
    pub async fn stop_all_servers(&self) {
        let languages: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        for language in languages {
            self.stop_server(&language).await;
        }
    }

    /// Languages whose server process is currently alive, sorted.
    pub async fn running_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self
            .servers
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| handle.is_running())
            .map(|(language, _)| language.clone())
            .collect();
        languages.sort();
        languages
    }

    /// Number of registered handles, including exited ones not yet replaced.
    pub async fn server_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, handle: ServerHandle) -> Arc<ServerHandle> {
        let handle = Arc::new(handle);
        self.servers
            .lock()
            .await
            .insert(handle.language().to_string(), Arc::clone(&handle));
        handle
    }
}
