//! Session management: PTY lifecycle, output buffering and fan-out.

pub mod manager;
pub mod process;
pub mod pty;
pub mod resume;
pub mod ring_buffer;

pub use manager::{ProcessManager, SessionInfo};
pub use process::{
    ExitCallback, ExitHookId, ListenerId, OutputListener, ProcessState, ResumeTokenHandler,
    SessionProcess,
};
pub use pty::{PtyHandle, SpawnConfig};
pub use resume::ResumeTokenScanner;
pub use ring_buffer::RingBuffer;
