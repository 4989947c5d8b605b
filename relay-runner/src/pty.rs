//! Pseudo-terminal lifecycle: one child process attached to a PTY master.
//!
//! Reads, writes, resizes, and the exit wait may all run on different
//! threads. The reader has its own lock and nothing else ever takes it, so a
//! thread parked in the read syscall cannot block `close()`; closing kills
//! the child, which is what unblocks the parked read.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// A live PTY session: child process plus master descriptor.
pub struct Pty {
    session_id: String,
    /// Only the read path locks this, and the read path locks nothing else.
    reader: Mutex<Box<dyn Read + Send>>,
    /// Only the exit waiter locks this; `close()` kills through a pre-cloned
    /// killer instead.
    child: Mutex<Box<dyn Child + Send + Sync>>,
    control: Mutex<PtyControl>,
    closed: AtomicBool,
}

struct PtyControl {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl Pty {
    /// Spawn `command` attached to a fresh PTY. An empty command runs the
    /// host's default shell. The child inherits this process's environment
    /// plus `TERM` and `COLORTERM`.
    pub fn spawn(session_id: &str, command: &[String]) -> anyhow::Result<Self> {
        let argv: Vec<String> = if command.is_empty() {
            vec![default_shell()]
        } else {
            command.to_vec()
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: INITIAL_ROWS,
                cols: INITIAL_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", argv[0]))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;
        let killer = child.clone_killer();

        tracing::info!(session_id = %session_id, command = ?argv, "pty spawned");
        Ok(Self {
            session_id: session_id.to_string(),
            reader: Mutex::new(reader),
            child: Mutex::new(child),
            control: Mutex::new(PtyControl {
                master: Some(pair.master),
                writer: Some(writer),
                killer,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Blocking read of up to `buf.len()` output bytes. Returns `Ok(0)` at
    /// end of stream, including after `close()`.
    pub fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut reader = self.reader.lock().unwrap();
        match reader.read(buf) {
            Ok(n) => Ok(n),
            // The master read fails with EIO once the child is gone; after a
            // close that is the expected end of stream.
            Err(_) if self.closed.load(Ordering::SeqCst) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Write input bytes to the child's terminal.
    pub fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut control = self.control.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) || control.writer.is_none() {
            bail!("pty {} is closed", self.session_id);
        }
        let writer = control.writer.as_mut().unwrap();
        writer.write_all(data).context("pty write failed")?;
        writer.flush().context("pty flush failed")?;
        Ok(())
    }

    /// Change the terminal window size.
    pub fn resize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        let control = self.control.lock().unwrap();
        let Some(master) = control.master.as_ref() else {
            bail!("pty {} is closed", self.session_id);
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("pty resize failed")?;
        tracing::debug!(session_id = %self.session_id, rows, cols, "pty resized");
        Ok(())
    }

    /// Current (rows, cols), while the PTY is open.
    pub fn size(&self) -> Option<(u16, u16)> {
        let control = self.control.lock().unwrap();
        let master = control.master.as_ref()?;
        master.get_size().ok().map(|s| (s.rows, s.cols))
    }

    /// Block until the child exits and return its exit code; 1 when the wait
    /// itself fails.
    pub fn wait(&self) -> i32 {
        let mut child = self.child.lock().unwrap();
        match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "pty wait failed");
                1
            }
        }
    }

    /// Terminate the session: kill the child if it is still running and drop
    /// the master descriptor. Safe to call from any thread, any number of
    /// times; a reader parked in the read syscall is unblocked by the
    /// child's death.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut control = self.control.lock().unwrap();
        if let Err(err) = control.killer.kill() {
            tracing::debug!(session_id = %self.session_id, error = %err, "kill after exit");
        }
        control.writer.take();
        control.master.take();
        tracing::info!(session_id = %self.session_id, "pty closed");
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.close();
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}
