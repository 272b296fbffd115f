//! Child process management on a pseudo-terminal.
//!
//! Wraps `portable-pty`: one [`PtyProcess`] per client session, spawned
//! with the configured argv and `TERM=xterm-256color`. The raw master
//! reader/writer handles are handed to the session's blocking relay
//! threads; signalling goes straight to the child pid.

use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn {0}: {1}")]
    Spawn(String, #[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// A spawned child with its controlling PTY master.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `argv` attached to a fresh PTY of the given size.
    pub fn spawn(argv: &[String], rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(argv[0].clone(), e))?;
        // The parent has no use for the slave side once the child holds it.
        drop(pair.slave);

        let pid = child.process_id();
        Ok(Self {
            master: Mutex::new(pair.master),
            child,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master
            .lock()
            .unwrap()
            .try_clone_reader()
            .map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master
            .lock()
            .unwrap()
            .take_writer()
            .map_err(PtyError::TakeWriter)
    }

    /// Update the terminal window size. Callers treat a failure as
    /// non-fatal and log it.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Deliver a signal to the child process. A no-op if the pid is
    /// unknown.
    pub fn signal(&self, code: i32) -> std::io::Result<()> {
        match self.pid {
            Some(pid) => send_signal(pid, code),
            None => Ok(()),
        }
    }

    /// Block until the child is reaped. `portable-pty` retries past EINTR
    /// and decodes the raw wait status (normal exit vs. termination
    /// signal) into the returned [`ExitStatus`].
    pub fn wait(&mut self) -> Result<ExitStatus, PtyError> {
        Ok(self.child.wait()?)
    }
}

/// Deliver a signal to an arbitrary pid. Used for the SIGKILL escalation
/// after the process handle has been handed off to the blocking reap
/// task.
pub fn send_signal(pid: u32, code: i32) -> std::io::Result<()> {
    if pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("pid {pid} exceeds i32::MAX"),
        ));
    }
    // SAFETY: plain kill(2) on a pid we spawned.
    let rc = unsafe { libc::kill(pid as i32, code) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
