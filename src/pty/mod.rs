//! Pseudoterminal (PTY) Management
//!
//! Spawns the remote shell client inside a PTY and exposes its output and
//! input as async channels.

pub mod process;
pub mod streams;

pub use process::{spawn_pty_process, PtyProcess, PtyState, SpawnConfig};
pub use streams::{PtyStreams, StreamRead};
