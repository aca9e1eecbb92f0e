//! fwpilot - firmware compatibility checks and updates over a remote shell
//!
//! The crate logs into a server over an interactive SSH session, reads the
//! installed firmware of one component family, compares it against policy
//! tables, and when needed drives the vendor flashing tool to completion.
//!
//! ## Module Organization
//!
//! ### Remote shell
//!
//! - [`pty`] - Spawning the SSH client in a pseudoterminal, byte streams
//! - [`session`] - Liveness probe, login, prompt discovery, capture log
//! - [`transaction`] - Send a command and wait for expected output, with retries
//! - [`retry`] - Bounded retry with per-attempt timeout and backoff
//!
//! ### Policy and decisions
//!
//! - [`policy`] - Preferred, acceptable, conflict and artifact tables
//! - [`decision`] - Pure functions from detected firmware to an update decision
//! - [`collector`] - Reading identity and version off a session
//!
//! ### Updating
//!
//! - [`orchestrator`] - Apply plans, completion markers, reboot and retry
//! - [`runner`] - One host, end to end
//! - [`fleet`] - Many hosts with bounded parallelism
//!
//! ### Support
//!
//! - [`config`] - Configuration file search, parsing and validation
//! - [`logging`] - tracing subscriber setup
//! - [`mod@error`] - Error types and Result aliases
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use fwpilot::collector::{CollectorConfig, CommandCollector};
//! use fwpilot::runner::UpdateJob;
//! use fwpilot::session::{Connector, Credentials, PingProber, SessionOptions, SshDialer, Target};
//! use fwpilot::{ApplyPlan, ComponentKind, PolicyCatalog};
//!
//! # async fn run() -> fwpilot::Result<()> {
//! let catalog = Arc::new(PolicyCatalog::load("policy.toml".as_ref(), None)?);
//! let collector = CommandCollector::from_config(
//!     &CollectorConfig::builtin(ComponentKind::Bmc).unwrap(),
//!     "/usr/bin",
//! )?;
//! let job = UpdateJob::new(
//!     ComponentKind::Bmc,
//!     catalog,
//!     Arc::new(collector),
//!     ApplyPlan::builtin(ComponentKind::Bmc),
//! );
//! let connector = Connector::new(
//!     Target::new("10.0.0.5"),
//!     Credentials::new("root", "secret"),
//!     SessionOptions::default(),
//!     Arc::new(SshDialer::default()),
//!     Arc::new(PingProber::default()),
//! );
//! let outcome = job.run(Arc::new(connector)).await?;
//! println!("{:?}", outcome.decision().outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Each session owns one SSH client running in a PTY. Reader and writer
//! threads bridge the PTY to async channels; everything above that is
//! async and single-owner. Hosts are independent: the policy catalog is
//! the only thing they share, and it is immutable once loaded.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod retry;

// Remote shell
pub mod pty;
pub mod session;
pub mod transaction;

// Policy and decisions
pub mod collector;
pub mod decision;
pub mod policy;

// Updating
pub mod fleet;
pub mod orchestrator;
pub mod runner;

// Support
pub mod config;
pub mod logging;

// Re-exports for core functionality
pub use config::{Config, ConfigLoader};
pub use decision::{decide, decide_forced, plan_forced, DecisionOutcome, UpdateDecision};
pub use error::{Error, Result};
pub use orchestrator::{ApplyPlan, ApplyReport, UpdateOrchestrator};
pub use policy::{
    ArtifactLocation, ComponentIdentity, ComponentKind, PolicyCatalog, PolicyRegistry, Version,
};
pub use retry::{Backoff, RetryPolicy};
pub use session::{Session, SessionOptions};
pub use transaction::{Transaction, TransactionResult};

/// The current version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The application name from Cargo.toml
pub const NAME: &str = env!("CARGO_PKG_NAME");
