//! Result delivery.
//!
//! A pipeline reports to exactly one [`ResultSink`]. Calls arrive from a
//! single dispatcher task in admission order, so a sink never sees frame
//! 5 before frame 4. Sink methods must return quickly; anything slow
//! belongs behind a channel like [`ChannelSink`].

use super::pass::{PassError, Terminal};
use crate::stages::TranslationResult;
use serde::Serialize;
use tokio::sync::mpsc;

pub trait ResultSink: Send + Sync {
    fn on_result(&self, frame_sequence: u64, result: TranslationResult);

    /// Failures and non-failure reports such as ambiguous detection.
    fn on_error(&self, error: PassError);

    /// Every admitted frame ends here exactly once, cancelled ones included.
    fn on_pass_terminal(&self, _frame_sequence: u64, _terminal: Terminal) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    Result {
        frame_sequence: u64,
        result: TranslationResult,
    },
    Error {
        error: PassError,
    },
    Terminal {
        frame_sequence: u64,
        terminal: Terminal,
    },
}

/// Forwards every sink call into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Sink receiver dropped, discarding event");
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_result(&self, frame_sequence: u64, result: TranslationResult) {
        self.send(SinkEvent::Result {
            frame_sequence,
            result,
        });
    }

    fn on_error(&self, error: PassError) {
        self.send(SinkEvent::Error { error });
    }

    fn on_pass_terminal(&self, frame_sequence: u64, terminal: Terminal) {
        self.send(SinkEvent::Terminal {
            frame_sequence,
            terminal,
        });
    }
}
