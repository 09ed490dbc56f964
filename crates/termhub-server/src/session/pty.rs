//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal, launches the configured program on its slave side
//! and keeps the master for input, resize and termination. The output reader
//! and the child are handed back separately so the session's pump thread can
//! own them.

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use termhub_core::{HubError, HubResult};
use tracing::{debug, info};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_RESUME_FLAG: &str = "--resume";

/// What to launch inside a session's PTY.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Working directory. Must exist and be a directory when set.
    pub cwd: Option<PathBuf>,
    /// Program to run; `$SHELL` (else `/bin/sh`) when `None`.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Passed to the program as `<resume_flag> <token>` after `args`.
    pub resume_token: Option<String>,
    pub resume_flag: String,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            command: None,
            args: Vec::new(),
            resume_token: None,
            resume_flag: DEFAULT_RESUME_FLAG.to_string(),
            env: HashMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl SpawnConfig {
    /// Run `command` with `args` in the default-sized terminal.
    pub fn command<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// The full argv this config launches, resume flag included.
    pub fn argv(&self) -> Vec<String> {
        let program = match &self.command {
            Some(command) => command.clone(),
            None => std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
        };
        let mut argv = vec![program];
        argv.extend(self.args.iter().cloned());
        if let Some(token) = &self.resume_token {
            argv.push(self.resume_flag.clone());
            argv.push(token.clone());
        }
        argv
    }

    fn pty_size(&self) -> PtySize {
        pty_size(self.cols, self.rows)
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// The master side of a running PTY.
pub struct PtyHandle {
    /// Mutex because `MasterPty` is not `Sync`.
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    size: Mutex<(u16, u16)>,
}

/// Everything produced by a successful spawn.
pub struct SpawnedPty {
    pub handle: PtyHandle,
    /// Blocking reader over the program's output.
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Open a PTY and launch `config` on it.
    pub fn spawn(config: &SpawnConfig) -> HubResult<SpawnedPty> {
        // portable-pty silently falls back to $HOME for a bad cwd.
        if let Some(cwd) = &config.cwd {
            if !cwd.is_dir() {
                return Err(HubError::Spawn(format!(
                    "working directory is not a directory: {}",
                    cwd.display()
                )));
            }
        }

        let argv = config.argv();
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let pair = native_pty_system()
            .openpty(config.pty_size())
            .map_err(|e| HubError::Spawn(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HubError::Spawn(format!("failed to spawn {}: {e}", argv[0])))?;
        // The parent's slave fd must close so reads see EOF once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HubError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HubError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let pid = child.process_id();
        info!(program = %argv[0], ?pid, cols = config.cols, rows = config.rows, "PTY spawned");

        Ok(SpawnedPty {
            handle: PtyHandle {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                killer: Mutex::new(child.clone_killer()),
                pid,
                size: Mutex::new((config.cols, config.rows)),
            },
            reader,
            child,
        })
    }

    /// Write to the program's input.
    pub fn write(&self, data: &[u8]) -> HubResult<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> HubResult<()> {
        self.master
            .lock()
            .resize(pty_size(cols, rows))
            .map_err(|e| HubError::Other(format!("PTY resize failed: {e}")))?;
        *self.size.lock() = (cols, rows);
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Forcefully terminate the child.
    pub fn kill(&self) -> HubResult<()> {
        self.killer.lock().kill()?;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }
}
