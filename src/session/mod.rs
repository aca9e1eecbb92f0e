//! Session Channel
//!
//! A [`Session`] is one authenticated interactive shell on a remote host.
//! Setup runs in a fixed order: liveness probe, login dialogue, prompt
//! discovery. Credentials are never sent to a host that failed the probe.
//!
//! Everything read from the remote side is appended to the session's
//! capture log and to an in-memory buffer that the transaction engine
//! matches against.

pub mod ansi;
pub mod capture;
mod login;
pub mod ssh;
pub mod testing;
pub mod transport;

pub use ansi::{strip_ansi, AnsiStripper, Utf8Decoder};
pub use capture::CaptureLog;
pub use login::learn_prompt;
use login::LoginFailure;
pub use ssh::{PingProber, PtyTransport, SshDialer};
pub use transport::{Dialer, Prober, Received, Transport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::retry::{retry, Backoff, RetryPolicy};
use crate::transaction::{self, Transaction, TransactionResult};

/// Remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Login credentials; the password is wiped from memory on drop
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session tunables
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Per-attempt wait for each step of the login dialogue
    pub login_timeout: Duration,
    /// Transaction timeout when the transaction does not set one
    pub default_timeout: Duration,
    /// Transaction attempt budget when the transaction does not set one
    pub default_attempts: u32,
    /// Login attempts before giving up
    pub auth_attempts: u32,
    /// Run the liveness probe before logging in
    pub probe: bool,
    /// Echo requests per probe
    pub probe_count: u32,
    pub probe_attempts: u32,
    pub probe_timeout: Duration,
    /// Delay policy between probe and login attempts
    pub backoff: Backoff,
    /// Directory for capture logs; `None` disables capture
    pub capture_dir: Option<PathBuf>,
    pub line_terminator: String,
    /// Pattern that recognises the remote prompt before it is learned
    pub original_prompt: String,
    /// Remove terminal escape sequences before matching
    pub strip_ansi: bool,
    /// How long a fire-and-forget transaction waits for its echo
    pub echo_timeout: Duration,
    /// How long disconnect waits for the remote side to hang up
    pub logout_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(10),
            default_timeout: Duration::from_secs(30),
            default_attempts: 1,
            auth_attempts: 3,
            probe: true,
            probe_count: 4,
            probe_attempts: 3,
            probe_timeout: Duration::from_secs(10),
            backoff: Backoff::Fixed(Duration::from_millis(500)),
            capture_dir: None,
            line_terminator: "\n".to_string(),
            original_prompt: r"[#$]".to_string(),
            strip_ansi: true,
            echo_timeout: Duration::from_secs(1),
            logout_timeout: Duration::from_secs(2),
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// The transport broke; only `disconnect` is meaningful
    Faulted,
    Closed,
}

/// One authenticated shell on a remote host
pub struct Session {
    id: Uuid,
    target: Target,
    username: String,
    options: SessionOptions,
    state: SessionState,
    fault: Option<String>,
    prompt: Option<String>,
    transport: Option<Box<dyn Transport>>,
    pending: String,
    stripper: Option<AnsiStripper>,
    decoder: Utf8Decoder,
    capture: Option<CaptureLog>,
    cancel: CancellationToken,
    connected_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("username", &self.username)
            .field("state", &self.state)
            .field("prompt", &self.prompt)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        target: &Target,
        username: &str,
        options: &SessionOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let capture = match &options.capture_dir {
            Some(dir) => Some(CaptureLog::create_in(dir)?),
            None => None,
        };
        Ok(Self {
            id: Uuid::new_v4(),
            target: target.clone(),
            username: username.to_string(),
            options: options.clone(),
            state: SessionState::Disconnected,
            fault: None,
            prompt: None,
            transport: None,
            pending: String::new(),
            stripper: options.strip_ansi.then(AnsiStripper::new),
            decoder: Utf8Decoder::default(),
            capture,
            cancel,
            connected_at: None,
        })
    }

    /// Probe, log in, and learn the prompt
    pub async fn connect(
        target: &Target,
        credentials: &Credentials,
        options: &SessionOptions,
        dialer: &dyn Dialer,
        prober: &dyn Prober,
    ) -> Result<Session> {
        Self::connect_with_cancel(
            target,
            credentials,
            options,
            dialer,
            prober,
            CancellationToken::new(),
        )
        .await
    }

    /// [`Session::connect`] with a caller-supplied cancellation token
    pub async fn connect_with_cancel(
        target: &Target,
        credentials: &Credentials,
        options: &SessionOptions,
        dialer: &dyn Dialer,
        prober: &dyn Prober,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let host = target.host.as_str();

        if options.probe {
            let policy = RetryPolicy::new(options.probe_attempts, options.probe_timeout)
                .with_backoff(options.backoff);
            let count = options.probe_count;
            let probed = retry(&policy, |attempt| {
                debug!("{}: liveness probe {}/{}", host, attempt.number(), attempt.budget);
                async move {
                    match prober.probe(host, count).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err("no replies".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }
            })
            .await;
            if let Err(exhausted) = probed {
                warn!(
                    "{}: unreachable after {} probe(s): {}",
                    host,
                    exhausted.attempts,
                    exhausted
                        .last_error
                        .unwrap_or_else(|| "probe timed out".to_string())
                );
                return Err(Error::Connection {
                    host: host.to_string(),
                    probes: exhausted.attempts,
                });
            }
        }

        let mut session = Session::new(target, &credentials.username, options, cancel)?;
        session.state = SessionState::Connecting;

        let policy =
            RetryPolicy::new(options.auth_attempts, options.login_timeout).with_backoff(options.backoff);
        let mut attempts = policy.attempts();
        let mut unreachable = 0;

        while let Some(attempt) = attempts.next_attempt().await {
            info!(
                "{}: logging in as {} (attempt {}/{})",
                host,
                credentials.username,
                attempt.number(),
                attempt.budget
            );
            session.transport = Some(dialer.dial(target, &credentials.username, options).await?);
            session.state = SessionState::Connecting;
            session.fault = None;

            let verdict = match login::login(&mut session, credentials.password(), attempt.timeout)
                .await?
            {
                Ok(()) => match login::discover_prompt(&mut session).await {
                    Ok(prompt) => Ok(prompt),
                    Err(e @ Error::Cancelled { .. }) => return Err(e),
                    Err(e) => Err(LoginFailure::NoPrompt(e.to_string())),
                },
                Err(failure) => Err(failure),
            };

            match verdict {
                Ok(prompt) => {
                    debug!("{}: learned prompt {:?}", host, prompt);
                    session.prompt = Some(prompt);
                    session.state = SessionState::Connected;
                    session.connected_at = Some(Utc::now());
                    info!("{}: session {} connected", host, session.id);
                    return Ok(session);
                }
                Err(failure) => {
                    warn!("{}: login attempt {} failed: {}", host, attempt.number(), failure);
                    if failure.is_unreachable() {
                        unreachable += 1;
                    }
                    session.drop_transport().await;
                }
            }
        }

        session.state = SessionState::Closed;
        if unreachable == attempts.used() {
            Err(Error::Connection {
                host: host.to_string(),
                probes: attempts.used(),
            })
        } else {
            Err(Error::Auth {
                host: host.to_string(),
                attempts: attempts.used(),
            })
        }
    }

    /// Log out and release the transport. Never fails; a broken session is
    /// simply torn down.
    pub async fn disconnect(mut self) {
        if self.state == SessionState::Connected {
            let logout = format!("exit{}", self.options.line_terminator);
            if self.write(&logout).await.is_ok() {
                let deadline = tokio::time::Instant::now() + self.options.logout_timeout;
                while let Some(transport) = self.transport.as_mut() {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match transport.recv(deadline - now).await {
                        Ok(Received::Data(bytes)) => {
                            if let Some(capture) = self.capture.as_mut() {
                                capture.record(&bytes);
                            }
                        }
                        Ok(Received::Idle) => {}
                        Ok(Received::Eof) | Err(_) => break,
                    }
                }
            }
        } else if let Some(reason) = &self.fault {
            debug!("{}: disconnecting faulted session: {}", self.target.host, reason);
        }
        self.drop_transport().await;
        self.state = SessionState::Closed;
        info!("{}: session {} closed", self.target.host, self.id);
    }

    /// Run a transaction on this session
    pub async fn execute(&mut self, tx: &Transaction) -> Result<TransactionResult> {
        transaction::execute(self, tx).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// The prompt learned at login
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn capture_path(&self) -> Option<&Path> {
        self.capture.as_ref().map(|c| c.path())
    }

    /// Token that aborts any transaction currently waiting on this session
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match self.state {
            SessionState::Connecting | SessionState::Connected if self.transport.is_some() => {
                Ok(())
            }
            SessionState::Faulted => Err(Error::SessionFault {
                reason: self
                    .fault
                    .clone()
                    .unwrap_or_else(|| "transport failed".to_string()),
            }),
            _ => Err(Error::SessionClosed),
        }
    }

    fn mark_faulted(&mut self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        warn!("{}: session faulted: {}", self.target.host, reason);
        self.state = SessionState::Faulted;
        self.fault = Some(reason.clone());
        Error::SessionFault { reason }
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("{}: transport close failed: {}", self.target.host, e);
            }
        }
        self.pending.clear();
        self.decoder = Utf8Decoder::default();
    }

    /// Write raw text to the remote side
    pub(crate) async fn write(&mut self, text: &str) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(Error::SessionClosed)?;
        if let Err(e) = transport.send(text.as_bytes()).await {
            return Err(self.mark_faulted(format!("send failed: {}", e)));
        }
        Ok(())
    }

    pub(crate) async fn send_line(&mut self, text: &str) -> Result<()> {
        let line = Zeroizing::new(format!("{}{}", text, self.options.line_terminator));
        self.write(&line).await
    }

    /// Receive one chunk into the buffer. `Ok(false)` when nothing arrived.
    pub(crate) async fn fill(&mut self, wait: Duration) -> Result<bool> {
        let transport = self.transport.as_mut().ok_or(Error::SessionClosed)?;
        match transport.recv(wait).await {
            Ok(Received::Data(bytes)) => {
                if let Some(capture) = self.capture.as_mut() {
                    capture.record(&bytes);
                }
                match self.stripper.as_mut() {
                    Some(stripper) => self.pending.push_str(&stripper.feed(&bytes)),
                    None => self.pending.push_str(&self.decoder.feed(&bytes)),
                }
                Ok(true)
            }
            Ok(Received::Idle) => Ok(false),
            Ok(Received::Eof) => Err(self.mark_faulted("remote side closed the connection")),
            Err(e) => Err(self.mark_faulted(format!("receive failed: {}", e))),
        }
    }

    pub(crate) fn pending(&self) -> &str {
        &self.pending
    }

    /// Remove and return the buffer up to byte offset `end`
    pub(crate) fn consume(&mut self, end: usize) -> String {
        let rest = self.pending.split_off(end);
        std::mem::replace(&mut self.pending, rest)
    }

    pub(crate) fn take_pending(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn discard_pending(&mut self) -> usize {
        let len = self.pending.len();
        self.pending.clear();
        len
    }
}

/// Source of fresh sessions for one host, used to reconnect after reboots
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Session>;
}

/// Everything needed to (re)open a session to one host
#[derive(Clone)]
pub struct Connector {
    target: Target,
    credentials: Credentials,
    options: SessionOptions,
    dialer: Arc<dyn Dialer>,
    prober: Arc<dyn Prober>,
    cancel: CancellationToken,
}

impl Connector {
    pub fn new(
        target: Target,
        credentials: Credentials,
        options: SessionOptions,
        dialer: Arc<dyn Dialer>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            target,
            credentials,
            options,
            dialer,
            prober,
            cancel: CancellationToken::new(),
        }
    }

    /// Sessions from this connector observe `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }
}

#[async_trait]
impl SessionFactory for Connector {
    async fn connect(&self) -> Result<Session> {
        Session::connect_with_cancel(
            &self.target,
            &self.credentials,
            &self.options,
            self.dialer.as_ref(),
            self.prober.as_ref(),
            self.cancel.clone(),
        )
        .await
    }
}
