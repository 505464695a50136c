use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{watch, Notify};

use crate::errors::{ManagerError, Result};
use crate::models::{RunningServer, SessionState};

/// How a server process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    /// The manager killed it after the stop grace period ran out.
    pub forced: bool,
}

impl ExitReport {
    pub fn is_abnormal(&self) -> bool {
        matches!(self.code, Some(code) if code != 0)
    }
}

/// Handle to one live server process.
pub struct ServerSession {
    pub profile_id: String,
    pub pid: Option<u32>,
    pub started_at: i64,
    seq: u64,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill: Notify,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl ServerSession {
    pub fn new(
        profile_id: impl Into<String>,
        pid: Option<u32>,
        seq: u64,
        stdin: Option<ChildStdin>,
        exit: watch::Receiver<Option<ExitReport>>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            pid,
            started_at: Utc::now().timestamp(),
            seq,
            stdin: tokio::sync::Mutex::new(stdin),
            kill: Notify::new(),
            exit,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Writes `text` plus a newline to the process's stdin.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ManagerError::Process("stdin is closed".to_string()))?;
        stdin.write_all(format!("{text}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Asks the monitor task to kill the process. Safe to call repeatedly.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    pub(crate) async fn kill_requested(&self) {
        self.kill.notified().await
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.exit.borrow()
    }

    /// Resolves once the process has exited. A vanished monitor counts as exited.
    pub async fn wait_exit(&self) -> Option<ExitReport> {
        let mut exit = self.exit.clone();
        let report = match exit.wait_for(|report| report.is_some()).await {
            Ok(report) => *report,
            Err(_) => None,
        };
        report
    }
}

/// Result of trying to claim a profile id for a start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    Busy,
    ShuttingDown,
}

enum Slot {
    Starting,
    Active {
        session: Arc<ServerSession>,
        stopping: bool,
    },
}

/// Which profile ids have a server starting or running.
///
/// A slot is claimed before any asynchronous start work begins, so two
/// concurrent starts for the same id can never both spawn.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
    next_seq: Arc<AtomicU64>,
    shutting_down: Arc<AtomicBool>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `profile_id` for a start. Refused while it is already starting
    /// or running, and always once shutdown has begun.
    pub fn begin_start(&self, profile_id: &str) -> Claim {
        let mut map = self.lock();
        if self.is_shutting_down() {
            return Claim::ShuttingDown;
        }
        if map.contains_key(profile_id) {
            return Claim::Busy;
        }
        map.insert(profile_id.to_string(), Slot::Starting);
        Claim::Claimed
    }

    /// Refuses every later claim. There is no way back.
    pub fn begin_shutdown(&self) {
        let _map = self.lock();
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Ids whose start sequence has not reached spawn yet.
    pub fn pending_starts(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Starting))
            .count()
    }

    /// Releases a claim that never produced a process.
    pub fn abort_start(&self, profile_id: &str) {
        let mut map = self.lock();
        if matches!(map.get(profile_id), Some(Slot::Starting)) {
            map.remove(profile_id);
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_running(&self, session: Arc<ServerSession>) {
        let mut map = self.lock();
        map.insert(
            session.profile_id.clone(),
            Slot::Active {
                session,
                stopping: false,
            },
        );
    }

    pub fn get(&self, profile_id: &str) -> Option<Arc<ServerSession>> {
        let map = self.lock();
        match map.get(profile_id) {
            Some(Slot::Active { session, .. }) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn mark_stopping(&self, profile_id: &str) -> Option<Arc<ServerSession>> {
        let mut map = self.lock();
        match map.get_mut(profile_id) {
            Some(Slot::Active { session, stopping }) => {
                *stopping = true;
                Some(session.clone())
            }
            _ => None,
        }
    }

    /// Removes the entry only if it still belongs to the session with `seq`.
    pub fn take_if_seq_matches(&self, profile_id: &str, seq: u64) -> bool {
        let mut map = self.lock();
        match map.get(profile_id) {
            Some(Slot::Active { session, .. }) if session.seq == seq => {
                map.remove(profile_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_claimed(&self, profile_id: &str) -> bool {
        self.lock().contains_key(profile_id)
    }

    pub fn state(&self, profile_id: &str) -> SessionState {
        let map = self.lock();
        match map.get(profile_id) {
            None => SessionState::Stopped,
            Some(Slot::Starting) => SessionState::Starting,
            Some(Slot::Active { stopping: false, .. }) => SessionState::Running,
            Some(Slot::Active { stopping: true, .. }) => SessionState::Stopping,
        }
    }

    pub fn list(&self) -> Vec<RunningServer> {
        let map = self.lock();
        let mut items: Vec<RunningServer> = map
            .iter()
            .map(|(profile_id, slot)| match slot {
                Slot::Starting => RunningServer {
                    profile_id: profile_id.clone(),
                    pid: None,
                    started_at: Utc::now().timestamp(),
                    state: SessionState::Starting,
                },
                Slot::Active { session, stopping } => RunningServer {
                    profile_id: profile_id.clone(),
                    pid: session.pid,
                    started_at: session.started_at,
                    state: if *stopping {
                        SessionState::Stopping
                    } else {
                        SessionState::Running
                    },
                },
            })
            .collect();
        items.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        items
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        let map = self.lock();
        map.values()
            .filter_map(|slot| match slot {
                Slot::Active { session, .. } => Some(session.clone()),
                Slot::Starting => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(registry: &SessionRegistry, id: &str) -> (Arc<ServerSession>, watch::Sender<Option<ExitReport>>) {
        let (tx, rx) = watch::channel(None);
        let session = Arc::new(ServerSession::new(id, Some(42), registry.next_seq(), None, rx));
        (session, tx)
    }

    #[test]
    fn second_claim_for_the_same_id_is_refused() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.begin_start("srv-1"), Claim::Claimed);
        assert_eq!(registry.begin_start("srv-1"), Claim::Busy);
        assert_eq!(registry.state("srv-1"), SessionState::Starting);

        registry.abort_start("srv-1");
        assert_eq!(registry.state("srv-1"), SessionState::Stopped);
        assert_eq!(registry.begin_start("srv-1"), Claim::Claimed);
    }

    #[test]
    fn no_claims_after_shutdown_begins() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.begin_start("srv-1"), Claim::Claimed);
        assert_eq!(registry.pending_starts(), 1);

        registry.begin_shutdown();
        assert_eq!(registry.begin_start("srv-2"), Claim::ShuttingDown);
        assert_eq!(registry.begin_start("srv-1"), Claim::ShuttingDown);

        registry.abort_start("srv-1");
        assert_eq!(registry.pending_starts(), 0);
    }

    #[test]
    fn stale_session_cannot_remove_its_successor() {
        let registry = SessionRegistry::new();
        let (old, _old_tx) = session(&registry, "srv-1");
        registry.mark_running(old.clone());
        assert!(registry.take_if_seq_matches("srv-1", old.seq()));

        let (new, _new_tx) = session(&registry, "srv-1");
        registry.mark_running(new.clone());
        assert!(!registry.take_if_seq_matches("srv-1", old.seq()));
        assert_eq!(registry.state("srv-1"), SessionState::Running);
        assert_eq!(registry.get("srv-1").map(|s| s.seq()), Some(new.seq()));
    }

    #[test]
    fn stopping_is_visible_in_listing() {
        let registry = SessionRegistry::new();
        let (running, _tx) = session(&registry, "srv-1");
        registry.mark_running(running);
        assert!(registry.mark_stopping("srv-1").is_some());
        assert!(registry.mark_stopping("srv-2").is_none());

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, SessionState::Stopping);
        assert_eq!(listed[0].pid, Some(42));
    }

    #[tokio::test]
    async fn wait_exit_resolves_on_report_or_dropped_monitor() {
        let registry = SessionRegistry::new();
        let (reported, tx) = session(&registry, "srv-1");
        tx.send_replace(Some(ExitReport {
            code: Some(1),
            forced: false,
        }));
        let report = reported.wait_exit().await.expect("report");
        assert!(report.is_abnormal());

        let (abandoned, tx) = session(&registry, "srv-2");
        drop(tx);
        assert_eq!(abandoned.wait_exit().await, None);
    }

    #[tokio::test]
    async fn write_line_without_stdin_fails() {
        let registry = SessionRegistry::new();
        let (detached, _tx) = session(&registry, "srv-1");
        assert!(matches!(
            detached.write_line("stop").await,
            Err(ManagerError::Process(_))
        ));
    }
}
