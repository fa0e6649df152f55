//! Server handle: owns a backend process and its connection.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{OnceCell, oneshot, watch};

use crate::config::{ClientSettings, ServerConfig};
use crate::error::LspError;
use crate::protocol;
use crate::rpc::{Connection, lock};

/// Lifecycle of a spawned backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit was observed. `None` when the process was ended by a signal
    /// or its status could not be collected.
    Exited(Option<i32>),
}

/// A spawned backend process.
///
/// A supervisor task owns the [`Child`] and records its exit. Dropping the
/// handle kills the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    /// Resolve and spawn the configured command with piped stdio.
    pub(crate) fn spawn(
        config: &ServerConfig,
        cwd: &Path,
    ) -> Result<(Self, ChildStdin, ChildStdout), LspError> {
        let spawn_error = |source: io::Error| LspError::Spawn {
            language: config.language().to_string(),
            command: config.command().to_string(),
            source,
        };

        let resolved = which::which(config.command()).map_err(|e| {
            spawn_error(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found in PATH: {e}", config.command()),
            ))
        })?;

        let mut child = Command::new(&resolved)
            .args(config.args())
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("no stdin from child")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("no stdout from child")))?;

        let pid = child.id();
        let (state_tx, state) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(Self::supervise(
            child,
            state_tx,
            kill_rx,
            config.language().to_string(),
        ));

        tracing::debug!(
            server = %config.language(),
            ?pid,
            "Spawned {}",
            resolved.display()
        );

        let handle = Self {
            pid,
            state,
            kill_tx: Mutex::new(Some(kill_tx)),
        };
        Ok((handle, stdin, stdout))
    }

    async fn supervise(
        mut child: Child,
        state_tx: watch::Sender<ProcessState>,
        mut kill_rx: oneshot::Receiver<()>,
        name: String,
    ) {
        // A dropped sender also lands in the kill branch.
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_rx => None,
        };
        let status = match exited {
            Some(status) => status,
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(server = %name, "Kill failed: {e}");
                }
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(server = %name, "Failed to collect exit status: {e}");
                None
            }
        };
        tracing::info!(server = %name, ?code, "Language server process exited");
        let _ = state_tx.send(ProcessState::Exited(code));
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Exit code once the process has exited.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            ProcessState::Running => None,
            ProcessState::Exited(code) => code,
        }
    }

    /// Wait up to `timeout` for the process to exit. `None` if it is still running.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessState> {
        let mut state = self.state.clone();
        match tokio::time::timeout(timeout, state.wait_for(|s| *s != ProcessState::Running)).await
        {
            Ok(Ok(exited)) => Some(*exited),
            Ok(Err(_)) => Some(self.state()),
            Err(_) => None,
        }
    }

    /// Ask the supervisor to kill the process. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = lock(&self.kill_tx).take() {
            let _ = tx.send(());
        }
    }
}

/// A registered language server: its configuration, its process (if any) and
/// the connection over the process's stdio.
pub struct ServerHandle {
    config: ServerConfig,
    process: Option<ProcessHandle>,
    connection: Connection,
    /// Capabilities from the `initialize` result; set once the handshake completed.
    capabilities: OnceCell<Value>,
    /// URI → version of documents already sent via `didOpen`.
    documents: Mutex<HashMap<String, i32>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Spawn the configured command in `cwd` and connect to its stdio.
    pub(crate) fn spawn(
        config: ServerConfig,
        cwd: &Path,
        settings: &ClientSettings,
    ) -> Result<Self, LspError> {
        let (process, stdin, stdout) = ProcessHandle::spawn(&config, cwd)?;
        Ok(Self::with_transport(config, Some(process), stdout, stdin, settings))
    }

    /// Build a handle over an arbitrary transport.
    pub(crate) fn with_transport<R, W>(
        config: ServerConfig,
        process: Option<ProcessHandle>,
        reader: R,
        writer: W,
        settings: &ClientSettings,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::start(
            config.language().to_string(),
            reader,
            writer,
            settings.request_timeout,
        );
        Self {
            config,
            process,
            connection,
            capabilities: OnceCell::new(),
            documents: Mutex::new(HashMap::new()),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    #[must_use]
    pub fn language(&self) -> &str {
        self.config.language()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// True only while a process exists and has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(ProcessHandle::is_running)
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.process.as_ref().and_then(ProcessHandle::exit_code)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.capabilities.initialized()
    }

    /// Run the `initialize` / `initialized` handshake once; later calls reuse
    /// the stored capabilities. A failed handshake is retried on the next call.
    pub(crate) async fn ensure_initialized(&self, root: &Path) -> Result<&Value, LspError> {
        self.capabilities
            .get_or_try_init(|| async {
                let root_uri = protocol::path_to_file_uri(root)?;
                let params = protocol::initialize_params(root_uri.as_str());
                let result = self
                    .connection
                    .request(protocol::INITIALIZE, Some(params))
                    .await
                    .map_err(|e| match e {
                        LspError::Response { message, .. } => LspError::Initialize {
                            language: self.language().to_string(),
                            reason: message,
                        },
                        other => other,
                    })?;
                self.connection
                    .notify(protocol::INITIALIZED, Some(json!({})))
                    .await?;
                tracing::info!(server = %self.language(), "Language server initialized");
                Ok::<_, LspError>(result.get("capabilities").cloned().unwrap_or(Value::Null))
            })
            .await
    }

    /// Whether the server advertised `textDocument/diagnostic`.
    #[must_use]
    pub fn supports_pull_diagnostics(&self) -> bool {
        self.capabilities
            .get()
            .and_then(|caps| caps.get("diagnosticProvider"))
            .is_some_and(|provider| !provider.is_null() && *provider != Value::Bool(false))
    }

    pub(crate) async fn request(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<Value, LspError> {
        self.connection.request(method, params).await
    }

    /// Send `didOpen` the first time a document is touched.
    ///
    /// Unreadable files are not opened; the server may still read them from disk.
    pub(crate) async fn open_document(&self, path: &Path, uri: &str) -> Result<(), LspError> {
        if lock(&self.documents).contains_key(uri) {
            return Ok(());
        }
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("Not opening {} in '{}': {e}", path.display(), self.language());
                return Ok(());
            }
        };
        self.send_open(path, uri, &text).await
    }

    async fn send_open(&self, path: &Path, uri: &str, text: &str) -> Result<(), LspError> {
        let version = 1;
        if lock(&self.documents)
            .insert(uri.to_string(), version)
            .is_some()
        {
            return Ok(());
        }
        let language_id = self
            .config
            .language_id_for(path)
            .unwrap_or(self.config.language());
        let params = protocol::did_open_params(uri, language_id, version, text);
        self.connection.invalidate_published(uri, version);
        self.connection.notify(protocol::DID_OPEN, Some(params)).await
    }

    /// Push new content: `didOpen` for an unseen document, else `didChange`
    /// with the next version.
    pub(crate) async fn change_document(
        &self,
        path: &Path,
        uri: &str,
        text: &str,
    ) -> Result<(), LspError> {
        let next_version = lock(&self.documents).get_mut(uri).map(|version| {
            *version += 1;
            *version
        });
        match next_version {
            Some(version) => {
                let params = protocol::did_change_params(uri, version, text);
                self.connection.invalidate_published(uri, version);
                self.connection.notify(protocol::DID_CHANGE, Some(params)).await
            }
            None => self.send_open(path, uri, text).await,
        }
    }

    pub(crate) async fn published_diagnostics(
        &self,
        uri: &str,
        wait: Duration,
    ) -> Option<Vec<Value>> {
        self.connection.published_diagnostics(uri, wait).await
    }

    /// Gracefully stop the server.
    ///
    /// Pending requests are cancelled first. `shutdown`/`exit` are only sent
    /// after a completed handshake. A process that outlives the grace period
    /// is killed.
    pub(crate) async fn shutdown(&self) {
        let cancelled = self.connection.cancel_all();
        if cancelled > 0 {
            tracing::debug!(server = %self.language(), "Cancelled {cancelled} pending requests");
        }

        if self.is_initialized() {
            let polite = tokio::time::timeout(
                self.shutdown_timeout,
                self.connection.request(protocol::SHUTDOWN, None),
            )
            .await;
            match polite {
                Ok(Ok(_)) => {
                    let _ = self.connection.notify(protocol::EXIT, None).await;
                }
                Ok(Err(e)) => tracing::debug!(server = %self.language(), "shutdown failed: {e}"),
                Err(_) => tracing::debug!(server = %self.language(), "shutdown timed out"),
            }
        }
        self.connection.close().await;

        let Some(process) = &self.process else {
            return;
        };
        if process.wait_for_exit(self.shutdown_timeout).await.is_none() {
            tracing::debug!(server = %self.language(), "Didn't exit in time, killing");
            process.kill();
            let _ = process.wait_for_exit(self.shutdown_timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tests::connected_pair;

    fn settings() -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_millis(500),
            diagnostics_wait: Duration::from_millis(200),
        }
    }

    #[cfg(unix)]
    fn cat_config() -> ServerConfig {
        ServerConfig::new("python", "cat", Vec::new(), [(".py", "python")])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_process_runs_until_stdin_closes() {
        let handle =
            ServerHandle::spawn(cat_config(), &std::env::temp_dir(), &settings()).unwrap();
        assert!(handle.is_running());
        assert!(handle.pid().is_some());
        assert_eq!(handle.exit_code(), None);

        handle.shutdown().await;
        assert!(!handle.is_running());
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unresponsive_process_is_killed() {
        let config = ServerConfig::new("sleepy", "sleep", vec!["30".into()], [(".z", "z")]);
        let handle = ServerHandle::spawn(config, &std::env::temp_dir(), &settings()).unwrap();
        assert!(handle.is_running());

        handle.shutdown().await;
        assert!(!handle.is_running());
        // Killed by signal: no exit code.
        assert_eq!(handle.exit_code(), None);
        assert!(matches!(
            handle.process().unwrap().state(),
            ProcessState::Exited(None)
        ));
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let config = ServerConfig::new("ghost", "polyglot-no-such-server", Vec::new(), [(".g", "g")]);
        let err = ServerHandle::spawn(config, &std::env::temp_dir(), &settings())
            .err()
            .unwrap();
        match err {
            LspError::Spawn { language, command, source } => {
                assert_eq!(language, "ghost");
                assert_eq!(command, "polyglot-no-such-server");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected Spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_without_process_is_not_running() {
        let (client_out, _backend_in) = tokio::io::duplex(1024);
        let (_backend_out, client_in) = tokio::io::duplex(1024);
        let handle = ServerHandle::with_transport(
            ServerConfig::new("python", "pyright", Vec::new(), [(".py", "python")]),
            None,
            client_in,
            client_out,
            &settings(),
        );
        assert!(!handle.is_running());
        assert_eq!(handle.pid(), None);
    }

    /// Handle backed by an in-memory transport; returns the fake backend side.
    fn scripted_handle() -> (ServerHandle, crate::rpc::tests::FakeBackend) {
        let (conn, backend) = connected_pair(Duration::from_secs(5));
        let handle = ServerHandle {
            config: ServerConfig::new(
                "typescript",
                "typescript-language-server",
                Vec::new(),
                [(".ts", "typescript"), (".tsx", "typescriptreact")],
            ),
            process: None,
            connection: conn,
            capabilities: OnceCell::new(),
            documents: Mutex::new(HashMap::new()),
            shutdown_timeout: Duration::from_millis(500),
        };
        (handle, backend)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_initialize_runs_once() {
        let (handle, mut backend) = scripted_handle();

        let server = tokio::spawn(async move {
            let init = backend.recv_request().await;
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["rootUri"], "file:///proj");
            backend
                .respond(&init, json!({ "capabilities": { "diagnosticProvider": { "interFileDependencies": false } } }))
                .await;
            let initialized = backend.recv().await;
            assert_eq!(initialized["method"], "initialized");
            backend
        });

        let root = Path::new("/proj");
        handle.ensure_initialized(root).await.unwrap();
        let mut backend = server.await.unwrap();
        assert!(handle.is_initialized());
        assert!(handle.supports_pull_diagnostics());

        // Second call must not send anything.
        handle.ensure_initialized(root).await.unwrap();
        handle.connection.notify("$/ping", None).await.unwrap();
        assert_eq!(backend.recv().await["method"], "$/ping");
    }

    #[tokio::test]
    async fn test_initialize_error_is_reported() {
        let (handle, mut backend) = scripted_handle();
        let server = tokio::spawn(async move {
            let init = backend.recv_request().await;
            backend
                .send(&json!({
                    "jsonrpc": "2.0",
                    "id": init["id"],
                    "error": { "code": -32002, "message": "workspace not supported" }
                }))
                .await;
            backend
        });

        let err = handle
            .ensure_initialized(&std::env::temp_dir())
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Initialize { ref reason, .. } if reason == "workspace not supported"));
        assert!(!handle.is_initialized());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_document_versions_increase() {
        let (handle, mut backend) = scripted_handle();
        let path = Path::new("/proj/app.tsx");
        let uri = "file:///proj/app.tsx";

        handle.change_document(path, uri, "let a = 1").await.unwrap();
        handle.change_document(path, uri, "let a = 2").await.unwrap();
        handle.change_document(path, uri, "let a = 3").await.unwrap();

        let open = backend.recv().await;
        assert_eq!(open["method"], "textDocument/didOpen");
        assert_eq!(open["params"]["textDocument"]["languageId"], "typescriptreact");
        assert_eq!(open["params"]["textDocument"]["version"], 1);

        let first = backend.recv().await;
        assert_eq!(first["method"], "textDocument/didChange");
        assert_eq!(first["params"]["textDocument"]["version"], 2);
        let second = backend.recv().await;
        assert_eq!(second["params"]["textDocument"]["version"], 3);
        assert_eq!(second["params"]["contentChanges"][0]["text"], "let a = 3");
    }

    #[tokio::test]
    async fn test_open_document_sends_did_open_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.ts");
        std::fs::write(&path, "export const x = 1;\n").unwrap();
        let uri = protocol::path_to_file_uri(&path).unwrap().to_string();

        let (handle, mut backend) = scripted_handle();
        handle.open_document(&path, &uri).await.unwrap();
        handle.open_document(&path, &uri).await.unwrap();
        handle.connection.notify("$/ping", None).await.unwrap();

        let open = backend.recv().await;
        assert_eq!(open["method"], "textDocument/didOpen");
        assert_eq!(open["params"]["textDocument"]["text"], "export const x = 1;\n");
        assert_eq!(backend.recv().await["method"], "$/ping");
    }

    #[tokio::test]
    async fn test_open_missing_file_is_skipped() {
        let (handle, mut backend) = scripted_handle();
        handle
            .open_document(Path::new("/nonexistent/x.ts"), "file:///nonexistent/x.ts")
            .await
            .unwrap();
        handle.connection.notify("$/ping", None).await.unwrap();
        assert_eq!(backend.recv().await["method"], "$/ping");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_before_terminating() {
        let (handle, mut backend) = scripted_handle();
        let handle = std::sync::Arc::new(handle);

        let waiter = {
            let handle = std::sync::Arc::clone(&handle);
            tokio::spawn(async move { handle.request(protocol::REFERENCES, None).await })
        };
        let req = backend.recv_request().await;
        assert_eq!(req["method"], "textDocument/references");

        // Never initialized: no shutdown request is sent, only stdin is closed.
        handle.shutdown().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LspError::Cancelled { .. }));
        assert!(backend.recv_eof().await);
    }
}
