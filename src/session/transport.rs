//! Transport seams
//!
//! A [`Transport`] is a byte pipe to one remote shell; a [`Dialer`] opens
//! one; a [`Prober`] checks liveness before any credentials are sent. The
//! production implementations live in [`super::ssh`], test doubles in
//! [`super::testing`].

use async_trait::async_trait;
use std::time::Duration;

use super::{SessionOptions, Target};
use crate::error::Result;

/// Outcome of a bounded receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Bytes from the remote side
    Data(Vec<u8>),
    /// Nothing arrived within the wait
    Idle,
    /// The remote side is gone
    Eof,
}

/// Byte-level connection to a remote interactive shell
#[async_trait]
pub trait Transport: Send {
    /// Write raw bytes to the remote side
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Wait up to `wait` for the next chunk of output
    async fn recv(&mut self, wait: Duration) -> Result<Received>;

    /// Tear the connection down; must be safe to call more than once
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to a target
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        target: &Target,
        username: &str,
        options: &SessionOptions,
    ) -> Result<Box<dyn Transport>>;
}

/// Liveness check run before the first login attempt
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send `count` echo requests; `true` when at least one was answered
    async fn probe(&self, host: &str, count: u32) -> Result<bool>;
}
