//! termhub-server: PTY session manager with replay-on-attach.
//!
//! Runs shells and agent CLIs inside pseudo-terminals, keeps the most recent
//! output of each in a bounded buffer, and lets viewers attach, detach and
//! reattach over WebSocket. A viewer that attaches is sent the buffered
//! output, a replay-complete marker, and then live output with no gap or
//! repeat at the seam.
//!
//! ```no_run
//! use termhub_server::session::{ProcessManager, SpawnConfig};
//!
//! # fn example() -> termhub_core::HubResult<()> {
//! let manager = ProcessManager::default();
//! manager.spawn("build", SpawnConfig::command("/bin/sh", ["-c", "make"]))?;
//! for chunk in manager.get_buffer("build") {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! manager.destroy_all();
//! # Ok(())
//! # }
//! ```

pub mod attach;
pub mod config;
pub mod server;
pub mod session;
pub mod transport;

pub use attach::{AttachPhase, Attachment, ViewerEvent, ViewerSink};
pub use config::ServerConfig;
pub use server::HubServer;
pub use session::{ProcessManager, SpawnConfig};
