//! Presentation events emitted by the runtime.
//!
//! Each event serializes to one self-describing JSON object
//! (`{"type": ..., ...}`); the bridge writes one per stdout line and
//! consumers treat the sequence as append-only and order-significant.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::{SegmentKind, StreamSegment};

/// Runtime status reported to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ready,
    Thinking,
    ExecutingTool,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status {
        content: Status,
    },
    /// Reasoning or source text.
    Thinking {
        content: String,
    },
    /// Visible answer text.
    Content {
        content: String,
    },
    Tokens {
        total: u64,
        prompt: u64,
        completion: u64,
    },
    Error {
        content: String,
    },
}

impl AgentEvent {
    pub fn status(status: Status) -> Self {
        AgentEvent::Status { content: status }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentEvent::Error {
            content: message.into(),
        }
    }

    /// Serializes the event as a single protocol line (no trailing newline).
    pub fn to_json_line(&self) -> String {
        // Every variant is a plain struct of strings and integers.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

impl From<StreamSegment> for AgentEvent {
    fn from(segment: StreamSegment) -> Self {
        match segment.kind {
            SegmentKind::Thinking => AgentEvent::Thinking {
                content: segment.text,
            },
            SegmentKind::Content => AgentEvent::Content {
                content: segment.text,
            },
        }
    }
}

/// Channel-based event sender (async, bounded).
pub type AgentEventTx = mpsc::Sender<AgentEvent>;

/// Channel-based event receiver (async, bounded).
pub type AgentEventRx = mpsc::Receiver<AgentEvent>;

/// Default channel capacity for event streams.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (AgentEventTx, AgentEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper used by the turn loop.
///
/// Every event is awaited into the channel: the protocol stream must be
/// complete, so deltas are never dropped under backpressure.
#[derive(Clone)]
pub struct EventSender {
    tx: AgentEventTx,
}

impl EventSender {
    pub fn new(tx: AgentEventTx) -> Self {
        Self { tx }
    }

    /// Sends one event.
    ///
    /// # Errors
    /// Returns an error if the presentation sink has gone away.
    pub async fn send(&self, event: AgentEvent) -> Result<()> {
        tracing::trace!(?event, "emit");
        self.tx
            .send(event)
            .await
            .map_err(|_closed| anyhow!("presentation sink closed"))
    }

    pub async fn status(&self, status: Status) -> Result<()> {
        self.send(AgentEvent::status(status)).await
    }

    /// Sends classified segments in order.
    ///
    /// # Errors
    /// Returns an error if the presentation sink has gone away.
    pub async fn segments(&self, segments: Vec<StreamSegment>) -> Result<()> {
        for segment in segments {
            self.send(segment.into()).await?;
        }
        Ok(())
    }
}
