//! Scripted transports for exercising sessions without a network
//!
//! [`ScriptedHost`] plays the remote side of a login and answers commands
//! from a rule table shared by every transport it dials, so a script survives
//! reconnects. [`StaticProber`] answers liveness probes with a fixed verdict.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::transport::{Dialer, Prober, Received, Transport};
use super::{Connector, Credentials, SessionOptions, Target};
use crate::error::{Error, Result};
use crate::retry::Backoff;

/// How the scripted host answers one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Raw output, verbatim
    Output(String),
    /// Output followed by a fresh prompt line
    Prompted(String),
    /// Nothing at all; the waiting transaction times out
    Silence,
    /// Output, then the connection drops
    Hangup(String),
}

impl Reply {
    pub fn output(text: impl Into<String>) -> Self {
        Reply::Output(text.into())
    }

    pub fn prompted(text: impl Into<String>) -> Self {
        Reply::Prompted(text.into())
    }

    pub fn hangup(text: impl Into<String>) -> Self {
        Reply::Hangup(text.into())
    }
}

#[derive(Debug)]
struct Rule {
    trigger: String,
    replies: VecDeque<Reply>,
}

#[derive(Debug)]
struct HostState {
    prompt: String,
    password: String,
    banner: String,
    echo: bool,
    rejections: u32,
    rules: Vec<Rule>,
    sent: Vec<String>,
    dials: u32,
}

/// A fake remote host
#[derive(Debug, Clone)]
pub struct ScriptedHost {
    state: Arc<Mutex<HostState>>,
}

impl ScriptedHost {
    /// Host that logs in with `password` and shows `prompt`
    pub fn new(prompt: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                prompt: prompt.into(),
                password: password.into(),
                banner: "root@node's password: ".to_string(),
                echo: true,
                rejections: 0,
                rules: Vec::new(),
                sent: Vec::new(),
                dials: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer sends containing `trigger`, one reply per send, in order.
    /// Rules are consulted in registration order; an exhausted rule is skipped.
    pub fn on<I>(self, trigger: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator<Item = Reply>,
    {
        self.lock().rules.push(Rule {
            trigger: trigger.into(),
            replies: replies.into_iter().collect(),
        });
        self
    }

    /// Reject the first `count` password submissions
    pub fn reject_logins(self, count: u32) -> Self {
        self.lock().rejections = count;
        self
    }

    /// Replace the greeting shown on every dial
    pub fn with_banner(self, banner: impl Into<String>) -> Self {
        self.lock().banner = banner.into();
        self
    }

    /// Client fails before any login dialogue
    pub fn refuse_connections(self) -> Self {
        self.with_banner("ssh: connect to host node port 22: Connection refused\r\n")
    }

    /// Do not echo commands back
    pub fn without_echo(self) -> Self {
        self.lock().echo = false;
        self
    }

    pub fn prompt(&self) -> String {
        self.lock().prompt.clone()
    }

    /// Every send so far with line terminators trimmed
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Sends that contain `needle`
    pub fn count_sent(&self, needle: &str) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    pub fn dials(&self) -> u32 {
        self.lock().dials
    }

    /// Connector for `node` as root with fast defaults
    pub fn connector(&self, prober: StaticProber) -> Connector {
        self.connector_with(prober, fast_options())
    }

    pub fn connector_with(&self, prober: StaticProber, options: SessionOptions) -> Connector {
        let password = self.lock().password.clone();
        Connector::new(
            Target::new("node"),
            Credentials::new("root", password),
            options,
            Arc::new(self.clone()),
            Arc::new(prober),
        )
    }
}

/// Session options without backoff delays or capture
pub fn fast_options() -> SessionOptions {
    SessionOptions {
        backoff: Backoff::None,
        default_timeout: Duration::from_secs(5),
        ..SessionOptions::default()
    }
}

#[async_trait]
impl Dialer for ScriptedHost {
    async fn dial(
        &self,
        _target: &Target,
        _username: &str,
        _options: &SessionOptions,
    ) -> Result<Box<dyn Transport>> {
        let banner = {
            let mut state = self.lock();
            state.dials += 1;
            state.banner.clone()
        };
        let mut queue = VecDeque::new();
        queue.push_back(Some(banner));
        Ok(Box::new(ScriptedTransport {
            host: self.clone(),
            queue,
            open: true,
        }))
    }
}

/// Transport handed out by [`ScriptedHost`]
#[derive(Debug)]
pub struct ScriptedTransport {
    host: ScriptedHost,
    // `None` marks the hangup point
    queue: VecDeque<Option<String>>,
    open: bool,
}

impl ScriptedTransport {
    fn push_reply(&mut self, reply: Reply, prompt: &str) {
        match reply {
            Reply::Output(text) => self.queue.push_back(Some(text)),
            Reply::Prompted(text) => self
                .queue
                .push_back(Some(format!("{}\r\n{} ", text, prompt))),
            Reply::Silence => {}
            Reply::Hangup(text) => {
                self.queue.push_back(Some(text));
                self.queue.push_back(None);
            }
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::SessionClosed);
        }
        let text = String::from_utf8_lossy(data).to_string();
        let line = text.trim_end_matches(['\r', '\n']).to_string();

        let (reply, prompt) = {
            let host = self.host.clone();
            let mut state = host.lock();
            state.sent.push(line.clone());
            let prompt = state.prompt.clone();

            let reply = if line == state.password {
                if state.rejections > 0 {
                    state.rejections -= 1;
                    Reply::output("\r\nPermission denied, please try again.\r\nroot@node's password: ")
                } else {
                    Reply::output(format!("\r\nLast login: Sat Oct 17 09:12:44 2026\r\n{} ", prompt))
                }
            } else {
                if state.echo && !line.is_empty() {
                    self.queue.push_back(Some(text.replace('\n', "\r\n")));
                }
                let scripted = state
                    .rules
                    .iter_mut()
                    .find(|rule| line.contains(rule.trigger.as_str()) && !rule.replies.is_empty())
                    .and_then(|rule| rule.replies.pop_front());
                match scripted {
                    Some(reply) => reply,
                    None if line == "exit" => Reply::hangup("logout\r\n"),
                    None => Reply::output(format!("\r\n{} ", prompt)),
                }
            };
            (reply, prompt)
        };

        self.push_reply(reply, &prompt);
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Received> {
        match self.queue.pop_front() {
            Some(Some(text)) => Ok(Received::Data(text.into_bytes())),
            Some(None) => {
                self.open = false;
                Ok(Received::Eof)
            }
            None if !self.open => Ok(Received::Eof),
            None => {
                tokio::time::sleep(wait).await;
                Ok(Received::Idle)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.queue.clear();
        Ok(())
    }
}

/// Prober with a fixed answer that counts how often it was asked
#[derive(Debug, Clone)]
pub struct StaticProber {
    reachable: bool,
    probes: Arc<AtomicU32>,
}

impl StaticProber {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            probes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            probes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for StaticProber {
    async fn probe(&self, _host: &str, _count: u32) -> Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable)
    }
}
