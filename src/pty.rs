//! PTY-backed child processes.
//!
//! Each session owns one [`PtyProcess`]: a child spawned under a
//! pseudoterminal with a dedicated OS thread pumping its output into a
//! bounded channel. The blocking PTY read never touches the async
//! runtime; the session side drains the channel from a tokio task.
//!
//! The PTY is the child's controlling terminal, so resize propagates as
//! SIGWINCH and TUI programs see a real tty.

use std::io::{Read, Write};
use std::path::Path;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// PTY read chunk size.
const READ_BUF_SIZE: usize = 4096;
/// Output channel depth (~1 MB of 4 KiB chunks).
const OUTPUT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to open PTY: {0}")]
    OpenFailed(String),
    #[error("failed to spawn child: {0}")]
    SpawnFailed(String),
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

/// Split a command line into argv.
///
/// Whitespace splitting only; shell metacharacters are passed through
/// verbatim to the child.
pub fn parse_argv(command_line: &str) -> Result<Vec<String>, PtyError> {
    let argv: Vec<String> = command_line
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if argv.is_empty() {
        return Err(PtyError::EmptyCommand);
    }
    Ok(argv)
}

/// A child process attached to a pseudoterminal.
///
/// The writer half carries client input to the child's stdin; the master
/// handle is kept for resize. Output arrives through the channel returned
/// by [`PtyProcess::spawn`], which closes when the child exits or the PTY
/// is dropped.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
}

impl PtyProcess {
    /// Spawn `command_line` under a fresh PTY of the given size.
    ///
    /// Returns the process handle and the receiver for its output
    /// chunks. `TERM=xterm-256color` is exported; everything else is
    /// inherited from the server environment.
    pub fn spawn(
        command_line: &str,
        rows: u16,
        cols: u16,
        cwd: Option<&Path>,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>), PtyError> {
        let argv = parse_argv(command_line)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", "xterm-256color");
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("take PTY writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("clone PTY reader: {e}")))?;

        // The slave end has done its job once the child holds it.
        drop(pair.slave);

        let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_DEPTH);
        let name = argv[0].clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{name}"))
            .spawn(move || {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            debug!(command = %name, error = %e, "PTY reader exiting");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| PtyError::SpawnFailed(format!("spawn reader thread: {e}")))?;

        Ok((
            PtyProcess {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                child: Mutex::new(Some(child)),
            },
            rx,
        ))
    }

    /// Write client input to the child's stdin and flush.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut writer = self.writer.lock();
        writer
            .write_all(bytes)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    /// Apply a new window size to the live PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Take ownership of the child handle.
    ///
    /// The caller is responsible for waiting on it; subsequent calls
    /// return `None` so the child is reaped exactly once.
    pub fn take_child(&self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.lock().take()
    }

    /// Best-effort kill + reap, run off the async runtime.
    ///
    /// No-op if the child was already taken.
    pub async fn kill_and_reap(&self) {
        if let Some(mut child) = self.take_child() {
            let _ = tokio::task::spawn_blocking(move || {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "failed to signal child");
                }
                let _ = child.wait();
            })
            .await;
        }
    }
}
