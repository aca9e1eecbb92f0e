//! PTY Streams
//!
//! Async-friendly view of the PTY master. Output arrives over a tokio
//! channel fed by the reader thread; input goes to the writer thread over a
//! std channel.

use crate::error::{Error, Result};
use std::sync::mpsc::Sender as StdSender;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Result of one bounded read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    /// A chunk of output
    Data(Vec<u8>),
    /// Nothing arrived within the wait
    Idle,
    /// The reader side is gone; the client exited
    Closed,
}

/// PTY I/O streams wrapper
pub struct PtyStreams {
    output_rx: UnboundedReceiver<Vec<u8>>,
    input_tx: StdSender<Vec<u8>>,
}

impl PtyStreams {
    pub fn from_channels(
        output_rx: UnboundedReceiver<Vec<u8>>,
        input_tx: StdSender<Vec<u8>>,
    ) -> Self {
        Self {
            output_rx,
            input_tx,
        }
    }

    /// Queue bytes for the PTY writer
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|e| Error::PtyIo {
                reason: format!("writer thread gone: {}", e),
            })
    }

    /// Wait up to `wait` for the next chunk of output
    pub async fn read_with_timeout(&mut self, wait: Duration) -> StreamRead {
        match tokio::time::timeout(wait, self.output_rx.recv()).await {
            Ok(Some(bytes)) => StreamRead::Data(bytes),
            Ok(None) => StreamRead::Closed,
            Err(_) => StreamRead::Idle,
        }
    }

    /// Discard whatever output is already queued
    pub fn drain_output(&mut self) -> usize {
        let mut count = 0;
        while self.output_rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}
