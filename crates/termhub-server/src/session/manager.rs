//! Session registry.
//!
//! The single owner of session lifecycle: maps session ids to their
//! [`SessionProcess`] and proxies every per-session operation. Operations on an
//! unknown id are silent no-ops, because viewers routinely race teardown.

use super::process::{
    ExitCallback, ExitHookId, ListenerId, OutputListener, ProcessState, ResumeTokenHandler,
    SessionProcess,
};
use super::pty::SpawnConfig;
use super::ring_buffer::DEFAULT_RING_BUFFER_CAPACITY;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use termhub_core::{HubError, HubResult};
use tracing::{debug, info};

/// Point-in-time description of one tracked session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub alive: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<u32>,
    pub resume_token: Option<String>,
    pub buffered_bytes: usize,
    pub listeners: usize,
    pub age_secs: u64,
}

impl SessionInfo {
    fn of(process: &SessionProcess) -> Self {
        Self {
            id: process.id().to_string(),
            alive: process.is_alive(),
            pid: process.pid(),
            exit_code: process.exit_code(),
            resume_token: process.resume_token(),
            buffered_bytes: process.buffered_bytes(),
            listeners: process.listener_count(),
            age_secs: process.created_at().elapsed().as_secs(),
        }
    }
}

/// Tracks every session by id.
pub struct ProcessManager {
    sessions: RwLock<HashMap<String, Arc<SessionProcess>>>,
    buffer_capacity: usize,
    resume_handler: Option<ResumeTokenHandler>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(DEFAULT_RING_BUFFER_CAPACITY)
    }
}

impl ProcessManager {
    /// Create a manager whose sessions buffer up to `buffer_capacity` bytes.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer_capacity,
            resume_handler: None,
        }
    }

    /// Report discovered resume tokens to `handler` as `(session_id, token)`.
    pub fn with_resume_handler(mut self, handler: ResumeTokenHandler) -> Self {
        self.resume_handler = Some(handler);
        self
    }

    /// Start a session under `id`.
    ///
    /// Fails with [`HubError::DuplicateSession`] while a session with this id
    /// is starting or running. An exited session under the same id (including
    /// one whose spawn failed) is replaced. A failed spawn stays registered in
    /// the exited state so callers can report it.
    ///
    /// A `kill`, `remove` or `destroy_all` that lands while the program is
    /// still starting terminates it; this call then fails.
    pub fn spawn(&self, id: &str, config: SpawnConfig) -> HubResult<()> {
        let process = {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(id) {
                if existing.state() != ProcessState::Exited {
                    return Err(HubError::DuplicateSession(id.to_string()));
                }
                debug!(session_id = id, "replacing exited session");
            }
            let process = Arc::new(SessionProcess::new(
                id,
                self.buffer_capacity,
                self.resume_handler.clone(),
            ));
            sessions.insert(id.to_string(), Arc::clone(&process));
            process
        };

        process.spawn(&config)
    }

    /// Kill the session's program. The record stays until [`remove`](Self::remove).
    pub fn kill(&self, id: &str) {
        if let Some(process) = self.get(id) {
            process.kill();
        }
    }

    /// Forget a session, killing it first if it is still running.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(process) => {
                process.kill();
                info!(session_id = id, "session removed");
                true
            }
            None => false,
        }
    }

    pub fn write(&self, id: &str, data: &[u8]) {
        if let Some(process) = self.get(id) {
            process.write(data);
        }
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        if let Some(process) = self.get(id) {
            process.resize(cols, rows);
        }
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.get(id).is_some_and(|p| p.is_alive())
    }

    /// Buffered output for `id`; empty when unknown.
    pub fn get_buffer(&self, id: &str) -> Vec<Bytes> {
        self.get(id).map(|p| p.buffer()).unwrap_or_default()
    }

    pub fn on_data(&self, id: &str, listener: Arc<dyn OutputListener>) -> Option<ListenerId> {
        self.get(id).map(|p| p.add_output_listener(listener))
    }

    pub fn off_data(&self, id: &str, listener_id: ListenerId) {
        if let Some(process) = self.get(id) {
            process.remove_output_listener(listener_id);
        }
    }

    /// Install a listener and snapshot the buffer atomically. `None` when the
    /// session is unknown.
    pub fn subscribe(
        &self,
        id: &str,
        listener_id: ListenerId,
        listener: Arc<dyn OutputListener>,
    ) -> Option<Vec<Bytes>> {
        self.get(id).map(|p| p.subscribe(listener_id, listener))
    }

    /// `None` when the session is unknown or the callback already ran.
    pub fn on_exit(&self, id: &str, callback: ExitCallback) -> Option<ExitHookId> {
        self.get(id).and_then(|p| p.on_exit(callback))
    }

    pub fn off_exit(&self, id: &str, hook_id: ExitHookId) {
        if let Some(process) = self.get(id) {
            process.remove_exit_hook(hook_id);
        }
    }

    pub fn resume_token(&self, id: &str) -> Option<String> {
        self.get(id).and_then(|p| p.resume_token())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionProcess>> {
        self.sessions.read().get(id).cloned()
    }

    /// Ids of every tracked session, running or exited.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.get(id).map(|p| SessionInfo::of(&p))
    }

    pub fn list_info(&self) -> Vec<SessionInfo> {
        let processes: Vec<Arc<SessionProcess>> = self.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = processes.iter().map(|p| SessionInfo::of(p)).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Kill every tracked session. Used at shutdown.
    pub fn destroy_all(&self) {
        let processes: Vec<Arc<SessionProcess>> = self.sessions.read().values().cloned().collect();
        info!(count = processes.len(), "destroying all sessions");
        for process in processes {
            process.kill();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
impl ProcessManager {
    /// Register a running session with no PTY; output is injected by tests.
    pub(crate) fn insert_without_pty(&self, id: &str) -> Arc<SessionProcess> {
        let process =
            SessionProcess::without_pty(id, self.buffer_capacity, self.resume_handler.clone());
        self.sessions
            .write()
            .insert(id.to_string(), Arc::clone(&process));
        process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> SpawnConfig {
        SpawnConfig::command("/bin/sh", ["-c", script])
    }

    fn buffered_text(manager: &ProcessManager, id: &str) -> String {
        let bytes: Vec<u8> = manager
            .get_buffer(id)
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn hello_then_kill() {
        let manager = ProcessManager::default();
        manager.spawn("s1", sh("echo hello; sleep 30")).unwrap();
        assert!(manager.is_alive("s1"));

        assert!(eventually(Duration::from_millis(500), || {
            buffered_text(&manager, "s1").contains("hello")
        }));

        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        manager.on_exit(
            "s1",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.kill("s1");
        assert!(!manager.is_alive("s1"));
        manager.kill("s1");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.list(), vec!["s1".to_string()]);
    }

    #[test]
    fn natural_exit_then_kill_reports_once() {
        let manager = ProcessManager::default();
        manager.spawn("quick", sh("true")).unwrap();
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        manager.on_exit(
            "quick",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(eventually(Duration::from_secs(5), || !manager.is_alive("quick")));
        manager.kill("quick");
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let manager = ProcessManager::default();
        manager.spawn("dup", sh("sleep 30")).unwrap();
        let err = manager.spawn("dup", sh("sleep 30")).unwrap_err();
        assert!(matches!(err, HubError::DuplicateSession(id) if id == "dup"));
        assert_eq!(manager.count(), 1);
        manager.destroy_all();
    }

    #[test]
    fn failed_spawn_occupies_id_until_respawned() {
        let manager = ProcessManager::default();
        let err = manager
            .spawn("broken", SpawnConfig::command("/no/such/program", Vec::<String>::new()))
            .unwrap_err();
        assert!(matches!(err, HubError::Spawn(_)));

        // Still listed, but exited.
        assert_eq!(manager.list(), vec!["broken".to_string()]);
        assert!(!manager.is_alive("broken"));

        // Same id can be reused without an explicit remove.
        manager.spawn("broken", sh("sleep 30")).unwrap();
        assert!(manager.is_alive("broken"));
        manager.destroy_all();
    }

    #[test]
    fn unknown_ids_are_silent() {
        let manager = ProcessManager::default();
        manager.write("ghost", b"ls\n");
        manager.resize("ghost", 100, 30);
        manager.kill("ghost");
        manager.off_data("ghost", ListenerId::next());
        assert!(manager
            .on_exit("ghost", Box::new(|| panic!("must not run")))
            .is_none());
        assert!(!manager.is_alive("ghost"));
        assert!(manager.get_buffer("ghost").is_empty());
        assert!(manager.on_data("ghost", Arc::new(|_: &Bytes| {})).is_none());
        assert!(manager.info("ghost").is_none());
        assert!(!manager.remove("ghost"));
    }

    #[test]
    fn remove_kills_and_forgets() {
        let manager = ProcessManager::default();
        manager.spawn("gone", sh("sleep 30")).unwrap();
        let process = manager.get("gone").unwrap();
        assert!(manager.remove("gone"));
        assert!(!process.is_alive());
        assert!(manager.list().is_empty());
    }

    #[test]
    fn destroy_all_kills_everything() {
        let manager = ProcessManager::default();
        for id in ["a", "b", "c"] {
            manager.spawn(id, sh("sleep 30")).unwrap();
        }
        manager.destroy_all();
        for id in manager.list() {
            assert!(!manager.is_alive(&id));
        }
        assert_eq!(manager.list_info().len(), 3);
    }

    /// Races `spawn` against `teardown` on one id. Each program touches a
    /// marker file once it has run for a while; a marker therefore means the
    /// program outlived the teardown.
    fn race_spawn_against(teardown: fn(&ProcessManager, &str)) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ProcessManager::default());
        let mut processes = Vec::new();

        for round in 0..20 {
            let id = format!("race-{round}");
            let marker = dir.path().join(&id);
            let script = format!("sleep 0.5; touch '{}'; sleep 30", marker.display());

            let stopper = {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                std::thread::spawn(move || loop {
                    if let Some(process) = manager.get(&id) {
                        teardown(&manager, &id);
                        return process;
                    }
                    std::thread::yield_now();
                })
            };
            let _ = manager.spawn(&id, sh(&script));
            processes.push(stopper.join().unwrap());
        }

        for process in &processes {
            assert_eq!(process.state(), ProcessState::Exited, "{} survived", process.id());
        }
        std::thread::sleep(Duration::from_millis(1500));
        let survivors: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(survivors.is_empty(), "{} programs outlived teardown", survivors.len());
        manager.destroy_all();
    }

    #[test]
    fn remove_during_spawn_leaves_nothing_running() {
        race_spawn_against(|manager, id| {
            manager.remove(id);
        });
    }

    #[test]
    fn kill_during_spawn_leaves_nothing_running() {
        race_spawn_against(|manager, id| manager.kill(id));
    }

    #[test]
    fn destroy_all_during_spawn_leaves_nothing_running() {
        race_spawn_against(|manager, _| manager.destroy_all());
    }

    #[test]
    fn exit_hooks_can_be_withdrawn() {
        let manager = ProcessManager::default();
        let process = manager.insert_without_pty("s");
        let hook = manager
            .on_exit("s", Box::new(|| panic!("withdrawn hook ran")))
            .unwrap();
        manager.off_exit("s", hook);
        manager.off_exit("ghost", hook);
        assert_eq!(process.exit_hook_count(), 0);
        manager.kill("s");
        assert!(!manager.is_alive("s"));
    }

    #[test]
    fn resume_handler_sees_token_from_output() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let manager = ProcessManager::default().with_resume_handler(Arc::new(
            move |id: &str, token: &str| sink.lock().push(format!("{id}={token}")),
        ));

        manager
            .spawn(
                "agent",
                sh("echo 'session 0f0e0d0c-0b0a-4908-8706-050403020100'; \
                    echo 'session ffffffff-0000-4000-8000-000000000000'; sleep 30"),
            )
            .unwrap();

        assert!(eventually(Duration::from_secs(5), || !seen.lock().is_empty()));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            *seen.lock(),
            vec!["agent=0f0e0d0c-0b0a-4908-8706-050403020100".to_string()]
        );
        assert_eq!(
            manager.resume_token("agent").as_deref(),
            Some("0f0e0d0c-0b0a-4908-8706-050403020100")
        );
        manager.destroy_all();
    }

    #[test]
    fn spawn_passes_resume_token_to_program() {
        let manager = ProcessManager::default();
        let config = SpawnConfig {
            resume_token: Some("tok-42".into()),
            ..SpawnConfig::command("/bin/echo", ["args:"])
        };
        manager.spawn("resumed", config).unwrap();
        assert!(eventually(Duration::from_secs(5), || {
            buffered_text(&manager, "resumed").contains("args: --resume tok-42")
        }));
    }
}
