//! Per-connection attach state machine.
//!
//! A connection is attached to at most one session at a time. Attaching
//! installs a listener and snapshots the session's buffer in one step, sends
//! the snapshot, sends a replay-complete marker, and only then switches the
//! listener to live forwarding. Output that arrives while the snapshot is
//! being sent is queued by the listener and flushed at the switch, so the
//! viewer sees every byte exactly once and in order.

use crate::session::{ExitHookId, ListenerId, OutputListener, ProcessManager};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use termhub_core::HubResult;
use tracing::{debug, trace};

/// Something a connection forwards to its viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    Output { session_id: String, data: Bytes },
    ReplayComplete { session_id: String },
    Exited { session_id: String },
}

/// Outbound half of a viewer connection.
///
/// `send` is called from session pump threads and must not block. Failures
/// are logged and otherwise ignored.
pub trait ViewerSink: Send + Sync {
    fn send(&self, event: ViewerEvent) -> HubResult<()>;
}

/// Coarse view of [`Attachment`] state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPhase {
    Detached,
    Replaying,
    Live,
}

enum AttachState {
    Detached,
    Replaying {
        session_id: String,
        listener_id: ListenerId,
        generation: u64,
        /// Output that arrived after the snapshot was taken.
        queue: Vec<Bytes>,
    },
    Live {
        session_id: String,
        listener_id: ListenerId,
        generation: u64,
        /// Withdrawn on detach so re-attaching does not pile up hooks.
        exit_hook: Option<ExitHookId>,
    },
}

impl AttachState {
    fn generation(&self) -> Option<u64> {
        match self {
            AttachState::Detached => None,
            AttachState::Replaying { generation, .. } | AttachState::Live { generation, .. } => {
                Some(*generation)
            }
        }
    }

    fn session_id(&self) -> Option<&str> {
        match self {
            AttachState::Detached => None,
            AttachState::Replaying { session_id, .. } | AttachState::Live { session_id, .. } => {
                Some(session_id)
            }
        }
    }

    fn phase(&self) -> AttachPhase {
        match self {
            AttachState::Detached => AttachPhase::Detached,
            AttachState::Replaying { .. } => AttachPhase::Replaying,
            AttachState::Live { .. } => AttachPhase::Live,
        }
    }
}

/// State shared between an [`Attachment`] and the listeners it installs.
struct Shared {
    state: Mutex<AttachState>,
    /// Bumped on every attach so listeners and exit hooks from an earlier
    /// attachment can recognise themselves as stale.
    generation: AtomicU64,
    sink: Arc<dyn ViewerSink>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation() == Some(generation)
    }

    fn emit(&self, event: ViewerEvent) {
        if let Err(e) = self.sink.send(event) {
            trace!(error = %e, "viewer send failed");
        }
    }
}

/// The listener installed on a session for one attach generation.
struct AttachListener {
    shared: Weak<Shared>,
    session_id: String,
    generation: u64,
}

impl OutputListener for AttachListener {
    fn deliver(&self, chunk: &Bytes) -> HubResult<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let mut state = shared.state.lock();
        match &mut *state {
            AttachState::Replaying {
                generation, queue, ..
            } if *generation == self.generation => {
                queue.push(chunk.clone());
                Ok(())
            }
            // Sent under the state lock so live output cannot overtake the flush.
            AttachState::Live { generation, .. } if *generation == self.generation => {
                shared.sink.send(ViewerEvent::Output {
                    session_id: self.session_id.clone(),
                    data: chunk.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// One connection's view onto the sessions of a [`ProcessManager`].
///
/// Dropping an attachment detaches it.
pub struct Attachment {
    manager: Arc<ProcessManager>,
    shared: Arc<Shared>,
}

impl Attachment {
    pub fn new(manager: Arc<ProcessManager>, sink: Arc<dyn ViewerSink>) -> Self {
        Self {
            manager,
            shared: Arc::new(Shared {
                state: Mutex::new(AttachState::Detached),
                generation: AtomicU64::new(0),
                sink,
            }),
        }
    }

    /// Attach to `session_id`, replaying its buffer before going live.
    ///
    /// Unknown sessions are ignored and any current attachment is kept.
    pub fn attach(&self, session_id: &str, cols: Option<u16>, rows: Option<u16>) {
        let Some(process) = self.manager.get(session_id) else {
            debug!(session_id, "attach to unknown session ignored");
            return;
        };

        self.detach();
        if let (Some(cols), Some(rows)) = (cols, rows) {
            process.resize(cols, rows);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let listener_id = ListenerId::next();
        *self.shared.state.lock() = AttachState::Replaying {
            session_id: session_id.to_string(),
            listener_id,
            generation,
            queue: Vec::new(),
        };

        let listener = Arc::new(AttachListener {
            shared: Arc::downgrade(&self.shared),
            session_id: session_id.to_string(),
            generation,
        });
        let snapshot = process.subscribe(listener_id, listener);
        debug!(session_id, chunks = snapshot.len(), "replaying buffer");

        for data in snapshot {
            // A concurrent detach abandons the replay.
            if !self.shared.is_current(generation) {
                return;
            }
            self.shared.emit(ViewerEvent::Output {
                session_id: session_id.to_string(),
                data,
            });
        }
        if !self.shared.is_current(generation) {
            return;
        }
        self.shared.emit(ViewerEvent::ReplayComplete {
            session_id: session_id.to_string(),
        });

        if !self.go_live(generation) {
            return;
        }

        // Registered after the switch so a viewer never sees Exited before
        // ReplayComplete. Runs at once if the session already exited.
        let shared = Arc::downgrade(&self.shared);
        let exited_id = session_id.to_string();
        let Some(hook_id) = process.on_exit(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                if shared.is_current(generation) {
                    shared.emit(ViewerEvent::Exited {
                        session_id: exited_id,
                    });
                }
            }
        })) else {
            return;
        };

        let stored = match &mut *self.shared.state.lock() {
            AttachState::Live {
                generation: current,
                exit_hook,
                ..
            } if *current == generation => {
                *exit_hook = Some(hook_id);
                true
            }
            _ => false,
        };
        // Detached or re-attached in the meantime.
        if !stored {
            process.remove_exit_hook(hook_id);
        }
    }

    /// Flush queued output and switch to live forwarding.
    fn go_live(&self, generation: u64) -> bool {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, AttachState::Detached) {
            AttachState::Replaying {
                session_id,
                listener_id,
                generation: current,
                queue,
            } if current == generation => {
                if !queue.is_empty() {
                    debug!(session_id = %session_id, chunks = queue.len(), "flushing output queued during replay");
                }
                for data in queue {
                    self.shared.emit(ViewerEvent::Output {
                        session_id: session_id.clone(),
                        data,
                    });
                }
                *state = AttachState::Live {
                    session_id,
                    listener_id,
                    generation,
                    exit_hook: None,
                };
                true
            }
            other => {
                *state = other;
                false
            }
        }
    }

    /// Remove the listener and exit hook from the attached session, if any.
    /// Idempotent.
    pub fn detach(&self) {
        let previous = std::mem::replace(&mut *self.shared.state.lock(), AttachState::Detached);
        let (session_id, listener_id, exit_hook) = match previous {
            AttachState::Detached => return,
            AttachState::Replaying {
                session_id,
                listener_id,
                ..
            } => (session_id, listener_id, None),
            AttachState::Live {
                session_id,
                listener_id,
                exit_hook,
                ..
            } => (session_id, listener_id, exit_hook),
        };
        self.manager.off_data(&session_id, listener_id);
        if let Some(hook_id) = exit_hook {
            self.manager.off_exit(&session_id, hook_id);
        }
        debug!(session_id = %session_id, "detached");
    }

    /// Keystrokes for the attached session. Dropped unless live.
    pub fn input(&self, data: &[u8]) {
        let target = match &*self.shared.state.lock() {
            AttachState::Live { session_id, .. } => Some(session_id.clone()),
            AttachState::Replaying { session_id, .. } => {
                debug!(session_id = %session_id, bytes = data.len(), "input during replay dropped");
                None
            }
            AttachState::Detached => None,
        };
        if let Some(session_id) = target {
            self.manager.write(&session_id, data);
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let target = self.attached_session();
        if let Some(session_id) = target {
            self.manager.resize(&session_id, cols, rows);
        }
    }

    /// The session this connection is attached to. Stays set after the
    /// session exits.
    pub fn attached_session(&self) -> Option<String> {
        self.shared.state.lock().session_id().map(str::to_string)
    }

    pub fn phase(&self) -> AttachPhase {
        self.shared.state.lock().phase()
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.detach();
    }
}
