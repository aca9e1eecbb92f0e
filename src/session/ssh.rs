//! OpenSSH client in a PTY, and an ICMP prober built on the system `ping`

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use super::transport::{Dialer, Prober, Received, Transport};
use super::{SessionOptions, Target};
use crate::error::{Error, Result};
use crate::pty::{spawn_pty_process, PtyProcess, PtyStreams, SpawnConfig, StreamRead};

static RECEIVED_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+(?:packets\s+)?received").expect("valid regex"));

/// [`Transport`] over a client process running in a PTY
pub struct PtyTransport {
    process: PtyProcess,
    streams: PtyStreams,
    closed: bool,
}

impl PtyTransport {
    pub fn new(process: PtyProcess, streams: PtyStreams) -> Self {
        Self {
            process,
            streams,
            closed: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.streams.write(data)
    }

    async fn recv(&mut self, wait: Duration) -> Result<Received> {
        if self.closed {
            return Ok(Received::Eof);
        }
        Ok(match self.streams.read_with_timeout(wait).await {
            StreamRead::Data(bytes) => Received::Data(bytes),
            StreamRead::Idle => Received::Idle,
            StreamRead::Closed => {
                self.closed = true;
                Received::Eof
            }
        })
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            let dropped = self.streams.drain_output();
            debug!(
                "Closing {} (pid {:?}), {} unread chunk(s) dropped",
                self.process.program(),
                self.process.pid(),
                dropped
            );
            self.closed = true;
        }
        self.process.terminate();
        Ok(())
    }
}

/// Dials targets by running an OpenSSH-compatible client
#[derive(Debug, Clone)]
pub struct SshDialer {
    program: String,
    options: Vec<String>,
    spawn: SpawnConfig,
}

impl Default for SshDialer {
    fn default() -> Self {
        Self::new(
            "ssh",
            vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
        )
    }
}

impl SshDialer {
    /// `options` are passed as `-o <option>` pairs
    pub fn new(program: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            program: program.into(),
            options,
            spawn: SpawnConfig::default(),
        }
    }

    /// Client arguments for one target
    pub fn arguments(&self, target: &Target, username: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.options.len() * 2 + 5);
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push("-l".to_string());
        args.push(username.to_string());
        args.push(target.host.clone());
        args
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        target: &Target,
        username: &str,
        _options: &SessionOptions,
    ) -> Result<Box<dyn Transport>> {
        let args = self.arguments(target, username);
        debug!("Dialing {}@{}:{}", username, target.host, target.port);
        let (process, streams) = spawn_pty_process(&self.program, &args, &self.spawn).await?;
        Ok(Box::new(PtyTransport::new(process, streams)))
    }
}

/// Runs `ping -c <count> <host>` and reads the received-count summary
#[derive(Debug, Clone)]
pub struct PingProber {
    program: String,
}

impl Default for PingProber {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }
}

impl PingProber {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Number of replies reported by a `ping` summary line
pub fn replies_received(output: &str) -> Option<u32> {
    RECEIVED_COUNT
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, host: &str, count: u32) -> Result<bool> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-c")
            .arg(count.to_string())
            .arg(host)
            .kill_on_drop(true)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let received = replies_received(&stdout).unwrap_or(0);
        debug!("{}: {}/{} probe replies", host, received, count);
        Ok(received > 0)
    }
}
