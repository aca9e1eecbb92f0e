//! Transaction Engine
//!
//! A transaction sends one command on a [`Session`] and waits for any of a
//! list of patterns to appear in the output. On timeout the command is sent
//! again, up to the attempt budget, and the receive buffer keeps everything
//! read so far, so a match may straddle two attempts.
//!
//! Matching follows the usual expect semantics: the pattern whose match
//! starts earliest in the buffer wins, ties go to the pattern listed first,
//! and text after the match stays buffered on the session.

pub mod pattern;

pub use pattern::{find_earliest, MatchMode, Pattern, PatternMatch, PatternSpec};

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::retry::{Backoff, RetryPolicy};
use crate::session::Session;

/// One command and the output that completes it
#[derive(Debug, Clone)]
pub struct Transaction {
    command: String,
    patterns: Vec<Pattern>,
    timeout: Option<Duration>,
    attempts: Option<u32>,
    backoff: Backoff,
    line: bool,
    cancel: Option<CancellationToken>,
}

impl Transaction {
    /// A command line; the session's line terminator is appended
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            patterns: Vec::new(),
            timeout: None,
            attempts: None,
            backoff: Backoff::None,
            line: true,
            cancel: None,
        }
    }

    /// Raw keystrokes sent without a line terminator
    pub fn keystroke(keys: impl Into<String>) -> Self {
        Self {
            line: false,
            ..Self::new(keys)
        }
    }

    pub fn expect(mut self, pattern: Pattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn expect_exact(self, text: impl Into<String>) -> Self {
        self.expect(Pattern::exact(text))
    }

    pub fn expect_regex(self, expr: &str) -> Result<Self> {
        Ok(self.expect(Pattern::regex(expr)?))
    }

    pub fn expect_prompt(self) -> Self {
        self.expect(Pattern::Prompt)
    }

    /// Add several patterns, all interpreted with `mode`
    pub fn expect_all<I, S>(mut self, patterns: I, mode: MatchMode) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.patterns.push(Pattern::parse(pattern.as_ref(), mode)?);
        }
        Ok(self)
    }

    /// Per-attempt timeout; defaults to the session's
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attempt budget; defaults to the session's
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Abort on this token instead of the session's
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// No patterns: send and only wait for the echo
    pub fn is_fire_and_forget(&self) -> bool {
        self.patterns.is_empty()
    }

    fn payload(&self, terminator: &str) -> String {
        if self.line {
            format!("{}{}", self.command, terminator)
        } else {
            self.command.clone()
        }
    }
}

/// Whether a transaction matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Success,
    TimedOut,
}

/// What a transaction saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub command: String,
    /// Index of the matched pattern; `None` for fire-and-forget or timeouts
    pub matched: Option<usize>,
    pub matched_text: Option<String>,
    /// Buffer up to and including the match, across all attempts
    pub raw: String,
    /// `raw` with the session prompt removed and surrounding whitespace trimmed
    pub output: String,
    /// Number of resends before the match
    pub retries: u32,
    pub outcome: TransactionOutcome,
}

impl TransactionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == TransactionOutcome::Success
    }

    /// `output` without the echoed command line
    pub fn body(&self) -> String {
        let command = self.command.trim();
        let mut lines = self.output.lines();
        match lines.next() {
            Some(first) if !command.is_empty() && first.trim().ends_with(command) => lines
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
            _ => self.output.clone(),
        }
    }
}

/// A single pattern wait without sending anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub index: usize,
    pub text: String,
    /// Buffer consumed up to the end of the match
    pub raw: String,
}

/// Remove every occurrence of the prompt and trim
pub fn normalize(raw: &str, prompt: Option<&str>) -> String {
    match prompt.filter(|p| !p.is_empty()) {
        Some(prompt) => raw.replace(prompt, "").trim().to_string(),
        None => raw.trim().to_string(),
    }
}

enum Wait {
    Matched(Expectation),
    Elapsed,
}

async fn wait_for(
    session: &mut Session,
    patterns: &[Pattern],
    timeout: Duration,
    cancel: &CancellationToken,
    command: &str,
) -> Result<Wait> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(found) = find_earliest(patterns, session.pending(), session.prompt()) {
            let raw = session.consume(found.range.end);
            let text = raw[found.range.clone()].to_string();
            return Ok(Wait::Matched(Expectation {
                index: found.index,
                text,
                raw,
            }));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(Wait::Elapsed);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    command: command.to_string(),
                });
            }
            received = session.fill(deadline - now) => {
                received?;
            }
        }
    }
}

/// Wait for any of `patterns` in output already flowing, without sending
pub async fn expect(
    session: &mut Session,
    patterns: &[Pattern],
    timeout: Duration,
) -> Result<Expectation> {
    session.ensure_usable()?;
    let cancel = session.cancellation();
    match wait_for(session, patterns, timeout, &cancel, "<expect>").await? {
        Wait::Matched(found) => Ok(found),
        Wait::Elapsed => Err(Error::Timeout {
            command: "<expect>".to_string(),
            retries: 0,
            partial: session.pending().to_string(),
        }),
    }
}

/// Send a transaction and wait for one of its patterns.
///
/// Output left over from earlier commands is discarded before sending.
/// Exhausting the attempt budget yields [`Error::Timeout`] carrying the
/// accumulated buffer.
pub async fn execute(session: &mut Session, tx: &Transaction) -> Result<TransactionResult> {
    session.ensure_usable()?;

    let options = session.options();
    let policy = RetryPolicy::new(
        tx.attempts.unwrap_or(options.default_attempts),
        tx.timeout.unwrap_or(options.default_timeout),
    )
    .with_backoff(tx.backoff);
    let echo_timeout = options.echo_timeout;
    let payload = tx.payload(&options.line_terminator);
    let cancel = tx.cancel.clone().unwrap_or_else(|| session.cancellation());

    let stale = session.discard_pending();
    if stale > 0 {
        trace!("Discarded {} stale byte(s) before '{}'", stale, tx.command);
    }

    if tx.is_fire_and_forget() {
        session.write(&payload).await?;
        let echo = [Pattern::exact(tx.command.trim())];
        let raw = match wait_for(session, &echo, echo_timeout, &cancel, &tx.command).await? {
            Wait::Matched(found) => found.raw,
            Wait::Elapsed => session.take_pending(),
        };
        return Ok(TransactionResult {
            command: tx.command.clone(),
            matched: None,
            matched_text: None,
            output: normalize(&raw, session.prompt()),
            raw,
            retries: 0,
            outcome: TransactionOutcome::Success,
        });
    }

    let mut attempts = policy.attempts();
    while let Some(attempt) = attempts.next_attempt().await {
        if attempt.index > 0 {
            debug!(
                "Resending '{}' (attempt {}/{})",
                tx.command,
                attempt.number(),
                attempt.budget
            );
        }
        session.write(&payload).await?;

        match wait_for(session, &tx.patterns, attempt.timeout, &cancel, &tx.command).await? {
            Wait::Matched(found) => {
                trace!(
                    "'{}' matched {} after {} retries",
                    tx.command,
                    tx.patterns[found.index],
                    attempt.index
                );
                return Ok(TransactionResult {
                    command: tx.command.clone(),
                    matched: Some(found.index),
                    matched_text: Some(found.text),
                    output: normalize(&found.raw, session.prompt()),
                    raw: found.raw,
                    retries: attempt.index,
                    outcome: TransactionOutcome::Success,
                });
            }
            Wait::Elapsed => {
                debug!(
                    "'{}' saw no match within {:?} (attempt {}/{})",
                    tx.command,
                    attempt.timeout,
                    attempt.number(),
                    attempt.budget
                );
            }
        }
    }

    let retries = attempts.used().saturating_sub(1);
    warn!("'{}' timed out after {} retries", tx.command, retries);
    Err(Error::Timeout {
        command: tx.command.clone(),
        retries,
        partial: session.take_pending(),
    })
}

/// Like [`execute`], but a timeout becomes a [`TransactionOutcome::TimedOut`]
/// result instead of an error
pub async fn execute_tolerant(
    session: &mut Session,
    tx: &Transaction,
) -> Result<TransactionResult> {
    match execute(session, tx).await {
        Err(Error::Timeout {
            command,
            retries,
            partial,
        }) => Ok(TransactionResult {
            command,
            matched: None,
            matched_text: None,
            output: normalize(&partial, session.prompt()),
            raw: partial,
            retries,
            outcome: TransactionOutcome::TimedOut,
        }),
        other => other,
    }
}
