//! PTY Process Spawning
//!
//! Runs the remote shell client (normally `ssh`) inside a pseudoterminal so
//! that password prompts and the remote shell behave exactly as they would
//! for an operator at a terminal.

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

use super::streams::PtyStreams;
use crate::error::{Error, Result};

/// Lifecycle of the client process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtyState {
    #[default]
    Created,
    Running,
    Terminated,
}

/// Spawn configuration for the client process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Terminal size reported to the remote side
    pub size: PtySize,
    /// Extra environment for the client
    pub env_vars: HashMap<String, String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        let mut env_vars = HashMap::new();
        // Keep remote tools from emitting rich terminal sequences
        env_vars.insert("TERM".to_string(), "ansi".to_string());
        Self {
            size: PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            },
            env_vars,
        }
    }
}

/// A client process running inside a PTY
pub struct PtyProcess {
    program: String,
    pid: Option<u32>,
    state: PtyState,
    started_at: DateTime<Utc>,
    child: Box<dyn Child + Send + Sync>,
    // Held so the master side of the PTY stays open for the process lifetime
    _master: Box<dyn MasterPty + Send>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl PtyProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> PtyState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the child is still running; reaps it if it has exited
    pub fn is_running(&mut self) -> bool {
        if self.state != PtyState::Running {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited with {:?}", self.program, status);
                self.state = PtyState::Terminated;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll {}: {}", self.program, e);
                false
            }
        }
    }

    /// Kill the client if it is still running
    pub fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!("Failed to kill {} (pid {:?}): {}", self.program, self.pid, e);
        }
        let _ = self.child.try_wait();
        self.state = PtyState::Terminated;
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawn `program` with `args` inside a fresh PTY
pub async fn spawn_pty_process(
    program: &str,
    args: &[String],
    config: &SpawnConfig,
) -> Result<(PtyProcess, PtyStreams)> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(config.size)
        .map_err(|e| Error::PtyCreationFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    let mut cmd_builder = CommandBuilder::new(program);
    cmd_builder.args(args);
    for (key, value) in &config.env_vars {
        cmd_builder.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd_builder)
        .map_err(|e| Error::PtySpawnFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    let pid = child.process_id();
    debug!("Spawned {} (pid {:?}) in PTY", program, pid);

    let PtyPair { master, slave } = pair;
    // The child owns its end now; dropping ours lets EOF surface when it exits
    drop(slave);

    let streams = create_pty_streams(master.as_ref())?;

    let process = PtyProcess {
        program: program.to_string(),
        pid,
        state: PtyState::Running,
        started_at: Utc::now(),
        child,
        _master: master,
    };

    Ok((process, streams))
}

/// Bridge blocking PTY I/O to async code via channels and two threads
fn create_pty_streams(master: &(dyn MasterPty + Send)) -> Result<PtyStreams> {
    let mut master_reader = master.try_clone_reader().map_err(|e| Error::PtyIo {
        reason: format!("failed to clone PTY reader: {}", e),
    })?;
    let mut master_writer = master.take_writer().map_err(|e| Error::PtyIo {
        reason: format!("failed to take PTY writer: {}", e),
    })?;

    let (tx_out, rx_out) = unbounded_channel::<Vec<u8>>();
    let (tx_in, rx_in) = channel::<Vec<u8>>();

    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut consecutive_errors = 0;
        const MAX_CONSECUTIVE_ERRORS: u32 = 5;

        loop {
            match master_reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY read EOF");
                    break;
                }
                Ok(n) => {
                    consecutive_errors = 0;
                    if tx_out.send(buf[..n].to_vec()).is_err() {
                        debug!("PTY output receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => match e.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    _ => {
                        consecutive_errors += 1;
                        // EIO is how Linux reports a hung-up PTY
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS
                            || e.raw_os_error() == Some(5)
                        {
                            debug!("PTY reader stopping: {}", e);
                            break;
                        }
                        warn!(
                            "PTY read error ({}/{}): {}",
                            consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                        );
                        thread::sleep(Duration::from_millis(50));
                    }
                },
            }
        }
    });

    thread::spawn(move || {
        while let Ok(data) = rx_in.recv() {
            let written = loop {
                match master_writer.write_all(&data) {
                    Ok(()) => break Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            };
            if let Err(e) = written {
                warn!("PTY write failed, stopping writer: {}", e);
                return;
            }
            if let Err(e) = master_writer.flush() {
                debug!("PTY flush error: {}", e);
            }
        }
        debug!("PTY writer thread exiting");
    });

    Ok(PtyStreams::from_channels(rx_out, tx_in))
}
