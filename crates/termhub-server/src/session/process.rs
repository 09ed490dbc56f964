//! One PTY-backed program and the fan-out of its output.
//!
//! A dedicated thread reads the PTY. Every chunk is appended to the session's
//! [`RingBuffer`] and then handed to each registered [`OutputListener`], in
//! arrival order. Appending and capturing the listener list happen under one
//! lock, so [`SessionProcess::subscribe`] can install a listener and take a
//! snapshot that together cover every chunk exactly once.

use super::pty::{PtyHandle, SpawnConfig, SpawnedPty};
use super::resume::ResumeTokenScanner;
use super::ring_buffer::RingBuffer;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use portable_pty::{Child, ChildKiller};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use termhub_core::{HubError, HubResult};
use tracing::{debug, info, trace, warn};

/// Bytes requested per PTY read.
const READ_CHUNK: usize = 8192;

/// Receives output chunks from a session.
///
/// Errors are logged and discarded by the session; a failing listener stays
/// registered until it is explicitly removed.
pub trait OutputListener: Send + Sync {
    fn deliver(&self, chunk: &Bytes) -> HubResult<()>;
}

impl<F> OutputListener for F
where
    F: Fn(&Bytes) + Send + Sync,
{
    fn deliver(&self, chunk: &Bytes) -> HubResult<()> {
        self(chunk);
        Ok(())
    }
}

/// Handle for removing a listener. Unique across all sessions, so a stale id
/// can never remove a listener belonging to a later session with the same
/// session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Invoked once when the program terminates.
pub type ExitCallback = Box<dyn FnOnce() + Send>;

/// Handle for unregistering an exit callback that has not run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitHookId(u64);

impl ExitHookId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Invoked with `(session_id, token)` the first time a resume token shows up.
pub type ResumeTokenHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Only observable while `spawn` is running. A kill in this state
    /// wins: the program is terminated as soon as it exists.
    Starting,
    Running,
    Exited,
}

type ListenerList = Arc<Vec<(ListenerId, Arc<dyn OutputListener>)>>;

struct Output {
    ring: RingBuffer,
    /// Copy-on-write; the pump iterates a clone of the `Arc`.
    listeners: ListenerList,
}

struct Lifecycle {
    state: ProcessState,
    exit_code: Option<u32>,
    on_exit: Vec<(ExitHookId, ExitCallback)>,
}

/// A session's program, its scrollback and its listeners.
pub struct SessionProcess {
    id: String,
    created_at: Instant,
    output: Mutex<Output>,
    lifecycle: Mutex<Lifecycle>,
    pty: OnceLock<PtyHandle>,
    resume_token: Mutex<Option<String>>,
    resume_handler: Option<ResumeTokenHandler>,
}

impl SessionProcess {
    /// A session in the `Starting` state. Call [`spawn`](Self::spawn) next.
    pub fn new(
        id: impl Into<String>,
        buffer_capacity: usize,
        resume_handler: Option<ResumeTokenHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: Instant::now(),
            output: Mutex::new(Output {
                ring: RingBuffer::new(buffer_capacity),
                listeners: Arc::new(Vec::new()),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: ProcessState::Starting,
                exit_code: None,
                on_exit: Vec::new(),
            }),
            pty: OnceLock::new(),
            resume_token: Mutex::new(None),
            resume_handler,
        }
    }

    /// Launch the program and start the output pump. Blocks while the PTY
    /// opens and the child forks.
    ///
    /// On failure the session goes straight to `Exited` (exit callbacks
    /// fire) and the error is returned. If the session was killed while the
    /// program was starting, the program is terminated and reaped here and
    /// [`HubError::Spawn`] is returned.
    pub fn spawn(self: &Arc<Self>, config: &SpawnConfig) -> HubResult<()> {
        let SpawnedPty {
            handle,
            reader,
            mut child,
        } = match PtyHandle::spawn(config) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "spawn failed");
                self.mark_exited(None);
                return Err(e);
            }
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ProcessState::Starting {
                drop(lifecycle);
                drop(handle);
                // Escalates past SIGHUP, so the wait below cannot hang.
                if let Err(e) = child.kill() {
                    debug!(session_id = %self.id, error = %e, "kill failed (already gone?)");
                }
                if let Err(e) = child.wait() {
                    debug!(session_id = %self.id, error = %e, "wait failed");
                }
                info!(session_id = %self.id, "session killed while starting");
                return Err(HubError::Spawn(format!(
                    "session {} was killed while starting",
                    self.id
                )));
            }
            // The handle must be in place before `kill` can observe `Running`.
            if self.pty.set(handle).is_err() {
                return Err(HubError::Spawn(format!("session {} already spawned", self.id)));
            }
            lifecycle.state = ProcessState::Running;
        }

        let session = Arc::clone(self);
        let pump = std::thread::Builder::new()
            .name(format!("pty-{}", self.id))
            .spawn(move || session.pump(reader, child));

        if let Err(e) = pump {
            self.kill();
            return Err(HubError::Spawn(format!("failed to start output pump: {e}")));
        }

        info!(session_id = %self.id, pid = ?self.pid(), "session running");
        Ok(())
    }

    /// Read until EOF, then reap the child.
    fn pump(&self, mut reader: Box<dyn Read + Send>, mut child: Box<dyn Child + Send + Sync>) {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut scanner = ResumeTokenScanner::new();

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.handle_output(Bytes::copy_from_slice(&buf[..n]), &mut scanner),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a hung-up PTY.
                    debug!(session_id = %self.id, error = %e, "PTY read ended");
                    break;
                }
            }
        }

        let code = match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "wait failed");
                None
            }
        };
        self.mark_exited(code);
    }

    fn handle_output(&self, chunk: Bytes, scanner: &mut ResumeTokenScanner) {
        if !scanner.is_done() && self.is_alive() {
            if let Some(token) = scanner.scan(&chunk) {
                self.capture_resume_token(token);
            }
        }

        let listeners = {
            let mut output = self.output.lock();
            output.ring.append(chunk.clone());
            Arc::clone(&output.listeners)
        };

        if !self.is_alive() {
            return;
        }
        for (listener_id, listener) in listeners.iter() {
            if let Err(e) = listener.deliver(&chunk) {
                trace!(session_id = %self.id, ?listener_id, error = %e, "listener delivery failed");
            }
        }
    }

    fn capture_resume_token(&self, token: String) {
        {
            let mut slot = self.resume_token.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(token.clone());
        }
        info!(session_id = %self.id, token = %token, "resume token discovered");
        if let Some(handler) = &self.resume_handler {
            handler(&self.id, &token);
        }
    }

    /// Transition to `Exited` and run exit callbacks. Only the first call has
    /// any effect beyond recording a late exit code.
    fn mark_exited(&self, code: Option<u32>) {
        self.exit_locked(self.lifecycle.lock(), code);
    }

    /// Like [`mark_exited`](Self::mark_exited), for callers that already hold
    /// the lifecycle lock. Callbacks run after it is released.
    fn exit_locked(&self, mut lifecycle: MutexGuard<'_, Lifecycle>, code: Option<u32>) {
        if lifecycle.exit_code.is_none() {
            lifecycle.exit_code = code;
        }
        if lifecycle.state == ProcessState::Exited {
            return;
        }
        lifecycle.state = ProcessState::Exited;
        let callbacks = std::mem::take(&mut lifecycle.on_exit);
        drop(lifecycle);

        info!(session_id = %self.id, exit_code = ?code, "session exited");
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Forward input to the program. Ignored once exited.
    pub fn write(&self, data: &[u8]) {
        if !self.is_alive() {
            return;
        }
        if let Some(pty) = self.pty.get() {
            if let Err(e) = pty.write(data) {
                debug!(session_id = %self.id, error = %e, "PTY write failed");
            }
        }
    }

    /// Resize the terminal. Ignored once exited.
    pub fn resize(&self, cols: u16, rows: u16) {
        if !self.is_alive() {
            return;
        }
        if let Some(pty) = self.pty.get() {
            if let Err(e) = pty.resize(cols, rows) {
                debug!(session_id = %self.id, error = %e, "PTY resize failed");
            }
        }
    }

    /// Forcefully terminate the program. Idempotent.
    ///
    /// A session that is still starting moves straight to `Exited`; the
    /// pending [`spawn`](Self::spawn) then terminates the program itself.
    pub fn kill(&self) {
        let lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ProcessState::Exited => return,
            ProcessState::Starting => {
                debug!(session_id = %self.id, "kill while starting");
            }
            ProcessState::Running => {
                if let Some(pty) = self.pty.get() {
                    if let Err(e) = pty.kill() {
                        debug!(session_id = %self.id, error = %e, "kill failed (already gone?)");
                    }
                }
            }
        }
        self.exit_locked(lifecycle, None);
    }

    pub fn add_output_listener(&self, listener: Arc<dyn OutputListener>) -> ListenerId {
        let listener_id = ListenerId::next();
        self.subscribe(listener_id, listener);
        listener_id
    }

    pub fn remove_output_listener(&self, listener_id: ListenerId) {
        let mut output = self.output.lock();
        if output.listeners.iter().any(|(id, _)| *id == listener_id) {
            let remaining = output
                .listeners
                .iter()
                .filter(|(id, _)| *id != listener_id)
                .cloned()
                .collect();
            output.listeners = Arc::new(remaining);
        }
    }

    /// Install a listener and snapshot the buffer in one step.
    ///
    /// Each chunk is either in the returned snapshot or delivered to the
    /// listener, never both and never neither.
    pub fn subscribe(&self, listener_id: ListenerId, listener: Arc<dyn OutputListener>) -> Vec<Bytes> {
        let mut output = self.output.lock();
        let mut listeners = Vec::with_capacity(output.listeners.len() + 1);
        listeners.extend(output.listeners.iter().cloned());
        listeners.push((listener_id, listener));
        output.listeners = Arc::new(listeners);
        output.ring.snapshot()
    }

    /// Register an exit callback; runs immediately if already exited.
    ///
    /// Returns a handle for [`remove_exit_hook`](Self::remove_exit_hook), or
    /// `None` when the callback has already run.
    pub fn on_exit(&self, callback: ExitCallback) -> Option<ExitHookId> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ProcessState::Exited {
                let hook_id = ExitHookId::next();
                lifecycle.on_exit.push((hook_id, callback));
                return Some(hook_id);
            }
        }
        callback();
        None
    }

    /// Drop an exit callback that has not run. Unknown ids are ignored.
    pub fn remove_exit_hook(&self, hook_id: ExitHookId) {
        self.lifecycle.lock().on_exit.retain(|(id, _)| *id != hook_id);
    }

    pub fn exit_hook_count(&self) -> usize {
        self.lifecycle.lock().on_exit.len()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ProcessState {
        self.lifecycle.lock().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Buffered output in arrival order.
    pub fn buffer(&self) -> Vec<Bytes> {
        self.output.lock().ring.snapshot()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.output.lock().ring.len()
    }

    pub fn listener_count(&self) -> usize {
        self.output.lock().listeners.len()
    }

    pub fn resume_token(&self) -> Option<String> {
        self.resume_token.lock().clone()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.lifecycle.lock().exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.get().and_then(PtyHandle::pid)
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        self.pty.get().map(PtyHandle::size)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
impl SessionProcess {
    /// A running session with no PTY behind it; output is fed by hand.
    pub(crate) fn without_pty(
        id: &str,
        buffer_capacity: usize,
        resume_handler: Option<ResumeTokenHandler>,
    ) -> Arc<Self> {
        let process = Arc::new(Self::new(id, buffer_capacity, resume_handler));
        process.lifecycle.lock().state = ProcessState::Running;
        process
    }

    /// Push a chunk through the same path the pump uses.
    pub(crate) fn inject(&self, data: &[u8], scanner: &mut ResumeTokenScanner) {
        self.handle_output(Bytes::copy_from_slice(data), scanner);
    }

    pub(crate) fn finish(&self) {
        self.mark_exited(Some(0));
    }
}
