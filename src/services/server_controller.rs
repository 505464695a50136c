use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::{ManagerError, Result};
use crate::models::{ConsoleLevel, RunningServer, ServerEvent, ServerProfile, SessionState};
use crate::services::auth_service::{self, AuthClient};
use crate::services::event_bus::EventBus;
use crate::services::log_classifier::{DeviceAuthClassifier, LineClassifier};
use crate::services::profile_store::ProfileService;
use crate::services::session_registry::{Claim, ExitReport, ServerSession, SessionRegistry};
use crate::services::update_service::{UpdateFetcher, UpdateOutcome};
use crate::settings::ManagerSettings;
use crate::utils::process::hide_console_window;

pub const SESSION_TOKEN_ENV: &str = "HYTALE_SERVER_SESSION_TOKEN";
pub const IDENTITY_TOKEN_ENV: &str = "HYTALE_SERVER_IDENTITY_TOKEN";
pub const API_KEY_ENV: &str = "HYTALE_API_KEY";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const FORCED_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const PENDING_START_POLL: Duration = Duration::from_millis(25);
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    AlreadyActive,
    /// The start sequence failed before anything was spawned.
    Aborted,
    SpawnFailed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub graceful: Vec<String>,
    pub forced: Vec<String>,
}

#[derive(Clone)]
pub struct ControllerOptions {
    pub stop_command: String,
    pub bundled_java: PathBuf,
    pub classifier: Arc<dyn LineClassifier>,
}

impl ControllerOptions {
    pub fn from_settings(settings: &ManagerSettings) -> Self {
        Self {
            stop_command: settings.file.stop_command.clone(),
            bundled_java: settings.bundled_java(),
            classifier: Arc::new(DeviceAuthClassifier),
        }
    }
}

struct ControllerInner {
    profiles: ProfileService,
    registry: SessionRegistry,
    events: EventBus,
    auth: Arc<dyn AuthClient>,
    updates: Arc<dyn UpdateFetcher>,
    options: ControllerOptions,
}

/// Runs one server process per profile: update, auth refresh, spawn, log
/// streaming and exit cleanup.
#[derive(Clone)]
pub struct ServerController {
    inner: Arc<ControllerInner>,
}

/// `javaArgs` split on whitespace, then `-jar <jarFile>`.
pub fn launch_arguments(profile: &ServerProfile) -> Vec<String> {
    let mut args: Vec<String> = profile
        .java_args
        .split_whitespace()
        .map(str::to_string)
        .collect();
    args.push("-jar".to_string());
    args.push(profile.jar_file.clone());
    args
}

/// Variables added on top of the inherited environment. Absent fields add nothing.
pub fn session_environment(profile: &ServerProfile) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(token) = profile.session_token() {
        env.push((SESSION_TOKEN_ENV.to_string(), token.to_string()));
    }
    if let Some(token) = profile.identity_token() {
        env.push((IDENTITY_TOKEN_ENV.to_string(), token.to_string()));
    }
    if let Some(key) = profile.api_key() {
        env.push((API_KEY_ENV.to_string(), key.to_string()));
    }
    for (key, value) in &profile.extra_env {
        if key.trim().is_empty() || value.trim().is_empty() {
            continue;
        }
        env.push((key.clone(), value.clone()));
    }
    env
}

/// `javaPath`, else the bundled runtime if installed, else `java` from PATH.
pub fn resolve_executable(profile: &ServerProfile, bundled_java: &Path) -> PathBuf {
    if let Some(java_path) = profile.java_path() {
        return PathBuf::from(java_path);
    }
    if bundled_java.is_file() {
        return bundled_java.to_path_buf();
    }
    PathBuf::from("java")
}

fn exit_summary(report: &ExitReport) -> (ConsoleLevel, String) {
    match report.code {
        Some(0) => (
            ConsoleLevel::Info,
            "[Manager] Server stopped. Exit code: 0.".to_string(),
        ),
        Some(code) => (
            ConsoleLevel::Error,
            format!("[Manager] Server stopped. Exit code: {code} (abnormal termination)."),
        ),
        None if report.forced => (
            ConsoleLevel::Info,
            "[Manager] Server was force-stopped after the grace period.".to_string(),
        ),
        None => (
            ConsoleLevel::Info,
            "[Manager] Server stopped by a signal.".to_string(),
        ),
    }
}

fn exit_report(status: std::io::Result<ExitStatus>, forced: bool, profile_id: &str) -> ExitReport {
    match status {
        Ok(status) => ExitReport {
            code: status.code(),
            forced,
        },
        Err(err) => {
            tracing::warn!("failed to wait on server {}: {}", profile_id, err);
            ExitReport { code: None, forced }
        }
    }
}

impl ServerController {
    pub fn new(
        profiles: ProfileService,
        events: EventBus,
        auth: Arc<dyn AuthClient>,
        updates: Arc<dyn UpdateFetcher>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                profiles,
                registry: SessionRegistry::new(),
                events,
                auth,
                updates,
                options,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn profiles(&self) -> &ProfileService {
        &self.inner.profiles
    }

    pub fn auth_client(&self) -> Arc<dyn AuthClient> {
        self.inner.auth.clone()
    }

    pub fn state(&self, profile_id: &str) -> SessionState {
        self.inner.registry.state(profile_id)
    }

    pub fn is_active(&self, profile_id: &str) -> bool {
        self.inner.registry.is_claimed(profile_id)
    }

    pub fn running(&self) -> Vec<RunningServer> {
        self.inner.registry.list()
    }

    fn console(&self, profile_id: &str, level: ConsoleLevel, line: impl Into<String>) {
        self.inner.events.console(profile_id, level, line);
    }

    /// Starts the server for `profile_id`. Failures end up in the console, never in the return.
    pub async fn start(&self, profile_id: &str) -> StartOutcome {
        match self.inner.registry.begin_start(profile_id) {
            Claim::Claimed => {}
            Claim::Busy => {
                self.console(
                    profile_id,
                    ConsoleLevel::Info,
                    "[Manager] Server is already running.",
                );
                return StartOutcome::AlreadyActive;
            }
            Claim::ShuttingDown => {
                self.console(
                    profile_id,
                    ConsoleLevel::Info,
                    "[Manager] Manager is shutting down; start refused.",
                );
                return StartOutcome::Aborted;
            }
        }

        match self.prepare(profile_id).await {
            Ok(profile) => self.spawn(profile),
            Err(err) => {
                self.inner.registry.abort_start(profile_id);
                self.console(profile_id, ConsoleLevel::Error, format!("[Manager] Error: {err}"));
                StartOutcome::Aborted
            }
        }
    }

    async fn prepare(&self, profile_id: &str) -> Result<ServerProfile> {
        let mut profile = self.inner.profiles.require(profile_id).await?;
        if profile.path.trim().is_empty() {
            return Err(ManagerError::Config("server path is not set".to_string()));
        }
        if profile.jar_file.trim().is_empty() {
            return Err(ManagerError::Config("server jar file is not set".to_string()));
        }
        let jar_path = Path::new(&profile.path).join(&profile.jar_file);

        if let Some(url) = profile.auto_update_url() {
            self.console(profile_id, ConsoleLevel::Info, "[Manager] Checking for server updates...");
            match self.inner.updates.fetch(url, &jar_path).await {
                Ok(UpdateOutcome::Updated { bytes }) => self.console(
                    profile_id,
                    ConsoleLevel::Info,
                    format!("[Manager] Server updated ({bytes} bytes)."),
                ),
                Ok(UpdateOutcome::Unchanged) => {
                    self.console(profile_id, ConsoleLevel::Info, "[Manager] Server is up to date.")
                }
                Err(err) => self.console(
                    profile_id,
                    ConsoleLevel::Warning,
                    format!("[Update Warning] {err}. Starting with the existing server jar."),
                ),
            }
        }

        if !jar_path.is_file() {
            return Err(ManagerError::Config(format!(
                "server jar not found at {}",
                jar_path.display()
            )));
        }

        if profile.refresh_token().is_some() {
            self.console(profile_id, ConsoleLevel::Info, "[Auth] Auto-refreshing session...");
            match self.refresh_session(&profile).await {
                Ok(refreshed) => {
                    self.console(profile_id, ConsoleLevel::Info, "[Auth] Session tokens refreshed.");
                    profile = refreshed;
                }
                Err(err) => self.console(
                    profile_id,
                    ConsoleLevel::Warning,
                    format!("[Auth Warning] Session refresh failed: {err}"),
                ),
            }
        }

        Ok(profile)
    }

    /// Exchanges the profile's refresh token for fresh session tokens and
    /// persists them onto the stored record. Returns the stored record.
    pub async fn refresh_session(&self, profile: &ServerProfile) -> Result<ServerProfile> {
        let refresh_token = profile
            .refresh_token()
            .ok_or_else(|| ManagerError::Auth("no refresh token stored".to_string()))?;
        let refreshed = auth_service::refresh_session(self.inner.auth.as_ref(), refresh_token).await?;
        if refreshed.rotated_refresh_token.is_some() {
            tracing::info!("refresh token rotated for {}", profile.id);
        }

        self.inner
            .profiles
            .modify(&profile.id, |stored| refreshed.apply_to(stored))
            .await?
            .ok_or_else(|| {
                ManagerError::NotFound(format!("server config not found for ID {}", profile.id))
            })
    }

    fn spawn(&self, profile: ServerProfile) -> StartOutcome {
        let profile_id = profile.id.clone();
        if self.inner.registry.is_shutting_down() {
            self.inner.registry.abort_start(&profile_id);
            self.console(
                &profile_id,
                ConsoleLevel::Info,
                "[Manager] Manager is shutting down; start cancelled.",
            );
            return StartOutcome::Aborted;
        }
        let program = resolve_executable(&profile, &self.inner.options.bundled_java);
        tracing::info!(
            "starting server {} with {} in {}",
            profile_id,
            program.display(),
            profile.path
        );

        let mut command = Command::new(&program);
        command
            .args(launch_arguments(&profile))
            .current_dir(&profile.path)
            .envs(session_environment(&profile))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.inner.registry.abort_start(&profile_id);
                self.console(
                    &profile_id,
                    ConsoleLevel::Error,
                    format!("[Manager] Error: {err}. Is Java installed and the server path/jar correct?"),
                );
                self.inner.events.state(&profile_id, false);
                return StartOutcome::SpawnFailed;
            }
        };

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let session = Arc::new(ServerSession::new(
            profile_id.clone(),
            pid,
            self.inner.registry.next_seq(),
            child.stdin.take(),
            exit_rx,
        ));
        self.inner.registry.mark_running(session.clone());
        self.inner.events.state(&profile_id, true);
        self.console(
            &profile_id,
            ConsoleLevel::Info,
            match pid {
                Some(pid) => format!("[Manager] Server started (PID {pid})."),
                None => "[Manager] Server started.".to_string(),
            },
        );

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, &profile_id, ConsoleLevel::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, &profile_id, ConsoleLevel::Stderr));
        }

        let controller = self.clone();
        tokio::spawn(async move {
            controller.monitor(child, session, exit_tx, readers).await;
        });

        StartOutcome::Started { pid }
    }

    fn spawn_reader<R>(&self, stream: R, profile_id: &str, level: ConsoleLevel) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.inner.events.clone();
        let classifier = self.inner.options.classifier.clone();
        let profile_id = profile_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buffer = Vec::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let decoded = String::from_utf8_lossy(&buffer);
                        let line = decoded.trim_end_matches(['\n', '\r']);
                        events.emit(ServerEvent::log(&profile_id, level, line));
                        if let Some(prompt) = classifier.classify(line) {
                            events.emit(ServerEvent::auth_needed(&profile_id, prompt));
                        }
                    }
                    Err(err) => {
                        tracing::warn!("console stream for {} failed: {}", profile_id, err);
                        break;
                    }
                }
            }
        })
    }

    async fn monitor(
        &self,
        mut child: Child,
        session: Arc<ServerSession>,
        exit_tx: watch::Sender<Option<ExitReport>>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let profile_id = session.profile_id.clone();
        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = session.kill_requested() => None,
        };
        let report = match finished {
            Some(status) => exit_report(status, false, &profile_id),
            None => {
                if let Err(err) = child.start_kill() {
                    tracing::warn!("failed to kill server {}: {}", profile_id, err);
                }
                exit_report(child.wait().await, true, &profile_id)
            }
        };

        // A grandchild can hold the pipes open long after the server is gone.
        let drain = if report.forced {
            FORCED_DRAIN_TIMEOUT
        } else {
            DRAIN_TIMEOUT
        };
        let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(drain, join_all(readers)).await.is_err() {
            tracing::debug!("console readers for {} still open after exit", profile_id);
            for abort in aborts {
                abort.abort();
            }
        }

        let removed = self
            .inner
            .registry
            .take_if_seq_matches(&profile_id, session.seq());
        let (level, summary) = exit_summary(&report);
        self.console(&profile_id, level, summary);
        if removed {
            self.inner.events.state(&profile_id, false);
        } else {
            tracing::debug!("session {} for {} was already replaced", session.seq(), profile_id);
        }
        exit_tx.send_replace(Some(report));
    }

    /// Writes the stop command. Completion is observed through the exit events.
    pub async fn stop(&self, profile_id: &str) -> bool {
        let Some(session) = self.inner.registry.mark_stopping(profile_id) else {
            self.console(profile_id, ConsoleLevel::Info, "[Manager] Server is not running.");
            return false;
        };
        self.console(profile_id, ConsoleLevel::Info, "[Manager] Sending stop command...");
        if let Err(err) = session.write_line(&self.inner.options.stop_command).await {
            self.console(
                profile_id,
                ConsoleLevel::Warning,
                format!("[Manager] Could not send stop command: {err}"),
            );
        }
        true
    }

    pub async fn send_command(&self, profile_id: &str, text: &str) -> bool {
        let Some(session) = self.inner.registry.get(profile_id) else {
            self.console(
                profile_id,
                ConsoleLevel::Info,
                "[Manager] Cannot send command: Server not running.",
            );
            return false;
        };
        match session.write_line(text).await {
            Ok(()) => true,
            Err(err) => {
                self.console(
                    profile_id,
                    ConsoleLevel::Warning,
                    format!("[Manager] Cannot send command: {err}"),
                );
                false
            }
        }
    }

    /// Stops every running server, killing any that outlive `grace`.
    /// Resolves once all of them are gone. Starts still in progress are
    /// cancelled before they spawn, and no new start is accepted afterwards.
    pub async fn shutdown_all(&self, grace: Duration) -> ShutdownReport {
        self.inner.registry.begin_shutdown();
        self.settle_pending_starts(grace).await;

        let sessions = self.inner.registry.sessions();
        if sessions.is_empty() {
            return ShutdownReport::default();
        }
        tracing::info!("stopping {} running server(s)", sessions.len());

        let results = join_all(
            sessions
                .into_iter()
                .map(|session| self.shutdown_session(session, grace)),
        )
        .await;

        let mut report = ShutdownReport::default();
        for (profile_id, forced) in results {
            if forced {
                report.forced.push(profile_id);
            } else {
                report.graceful.push(profile_id);
            }
        }
        report
    }

    /// Waits for claimed starts to either spawn or give up. Any that are still
    /// preparing after `grace` will refuse to spawn once they get there.
    async fn settle_pending_starts(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.registry.pending_starts() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("shutting down with server starts still in progress");
                return;
            }
            tokio::time::sleep(PENDING_START_POLL).await;
        }
    }

    async fn shutdown_session(&self, session: Arc<ServerSession>, grace: Duration) -> (String, bool) {
        let profile_id = session.profile_id.clone();
        self.inner.registry.mark_stopping(&profile_id);
        if let Err(err) = session.write_line(&self.inner.options.stop_command).await {
            tracing::debug!("stop command for {} not delivered: {}", profile_id, err);
        }

        if tokio::time::timeout(grace, session.wait_exit()).await.is_ok() {
            return (profile_id, false);
        }

        self.console(
            &profile_id,
            ConsoleLevel::Warning,
            "[Manager] Server did not stop in time, terminating.",
        );
        session.kill();
        if tokio::time::timeout(KILL_WAIT, session.wait_exit()).await.is_err() {
            tracing::error!("server {} did not exit after kill", profile_id);
        }
        (profile_id, true)
    }
}
