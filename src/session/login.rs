//! Login dialogue and prompt discovery

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::time::Duration;

use super::{strip_ansi, Session};
use crate::error::{Error, Result};
use crate::transaction::{self, Pattern, Transaction};

static HOST_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)are you sure you want to continue connecting").expect("valid regex")
});
static PASSWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:password:)|(?:passphrase for key)").expect("valid regex"));
static DENIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)permission denied").expect("valid regex"));
static UNREACHABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:connection refused|connection timed out|no route to host|could not resolve hostname|connection closed by)",
    )
    .expect("valid regex")
});

const MAX_LOGIN_ROUNDS: usize = 6;
const PROMPT_SYNC_TIMEOUT: Duration = Duration::from_secs(3);
const PROMPT_SYNC_ATTEMPTS: u32 = 3;

/// Why one login attempt did not reach a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoginFailure {
    /// The remote side never offered a login dialogue
    Unreachable(String),
    /// The remote side rejected the credentials
    Denied(String),
    /// Logged in, but the shell never showed a prompt
    NoPrompt(String),
}

impl LoginFailure {
    pub(crate) fn is_unreachable(&self) -> bool {
        matches!(self, LoginFailure::Unreachable(_))
    }
}

impl fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginFailure::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            LoginFailure::Denied(reason) => write!(f, "denied: {}", reason),
            LoginFailure::NoPrompt(reason) => write!(f, "no prompt: {}", reason),
        }
    }
}

/// Drive the client's login dialogue until a shell prompt appears.
///
/// The outer `Result` carries errors that end the whole connect (such as
/// cancellation); the inner one is the verdict for this attempt.
pub(crate) async fn login(
    session: &mut Session,
    password: &str,
    timeout: Duration,
) -> Result<std::result::Result<(), LoginFailure>> {
    let patterns = [
        Pattern::Regex(HOST_KEY.clone()),
        Pattern::Regex(PASSWORD.clone()),
        Pattern::Regex(DENIED.clone()),
        Pattern::Regex(UNREACHABLE.clone()),
        Pattern::regex(&session.options().original_prompt)?,
    ];
    let mut password_sent = false;

    for _ in 0..MAX_LOGIN_ROUNDS {
        let seen = match transaction::expect(session, &patterns, timeout).await {
            Ok(seen) => seen,
            Err(Error::Timeout { .. }) => {
                return Ok(Err(LoginFailure::Unreachable(
                    "no login dialogue before timeout".to_string(),
                )))
            }
            Err(e) if e.is_session_fault() => {
                return Ok(Err(LoginFailure::Unreachable(e.to_string())))
            }
            Err(e) => return Err(e),
        };

        match seen.index {
            0 => {
                debug!("{}: accepting host key", session.host());
                session.send_line("yes").await?;
            }
            1 if password_sent => {
                return Ok(Err(LoginFailure::Denied(
                    "password requested again".to_string(),
                )))
            }
            1 => {
                session.send_line(password).await?;
                password_sent = true;
            }
            2 => return Ok(Err(LoginFailure::Denied(seen.text))),
            3 => return Ok(Err(LoginFailure::Unreachable(seen.text))),
            _ => return Ok(Ok(())),
        }
    }

    Ok(Err(LoginFailure::Denied(
        "login dialogue did not reach a prompt".to_string(),
    )))
}

/// Last non-empty line of `buffer`, escape sequences removed
pub fn learn_prompt(buffer: &str) -> Option<String> {
    strip_ansi(buffer)
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}

/// Nudge the shell with a carriage return and record the prompt it prints
pub(crate) async fn discover_prompt(session: &mut Session) -> Result<String> {
    let tx = Transaction::keystroke("\r")
        .expect(Pattern::regex(&session.options().original_prompt)?)
        .timeout(PROMPT_SYNC_TIMEOUT)
        .attempts(PROMPT_SYNC_ATTEMPTS);
    let result = transaction::execute(session, &tx).await?;
    learn_prompt(&result.raw).ok_or_else(|| Error::SessionFault {
        reason: "could not learn the remote prompt".to_string(),
    })
}
