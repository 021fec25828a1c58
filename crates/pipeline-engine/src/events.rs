//! Progress events for streaming run progress
//!
//! A run produces an ordered, append-only sequence of [`ProgressEvent`]s.
//! The [`ProgressEmitter`] stamps sequence numbers and hands events to a
//! bounded channel; the matching [`ProgressStream`] is the lazy consumer
//! side. A slow consumer back-pressures the run instead of losing events.
//!
//! [`EventSink`] abstracts over the transport that carries events to a
//! client (websocket, channel, stdout, ...).

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::{RequestId, Stage, TerminalOutcome};

/// What a progress event reports about its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Succeeded,
    Retrying,
    Failed,
    /// Last event of every run; carries the terminal outcome.
    Final,
}

/// One immutable progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    request_id: RequestId,
    sequence_number: u64,
    stage: Stage,
    kind: EventKind,
    message: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome: Option<TerminalOutcome>,
}

impl ProgressEvent {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Terminal outcome, present only on the final event.
    pub fn outcome(&self) -> Option<&TerminalOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_final(&self) -> bool {
        self.kind == EventKind::Final
    }
}

/// Error when sending events fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The consumer or transport went away
    #[error("Event consumer disconnected")]
    Disconnected,
}

/// Create the emitter/stream pair of one run.
///
/// `capacity` bounds how many events may be buffered before the emitter
/// waits for the consumer.
pub fn progress_channel(
    request_id: RequestId,
    capacity: usize,
) -> (ProgressEmitter, ProgressStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressEmitter {
            request_id,
            next_sequence: 0,
            last_stage: None,
            tx,
        },
        ProgressStream { rx },
    )
}

/// Producer side of a run's event sequence.
///
/// Sequence numbers start at 0 and increase by one per event. The final
/// event is emitted by [`ProgressEmitter::finish`], which consumes the
/// emitter, so nothing can follow it.
pub struct ProgressEmitter {
    request_id: RequestId,
    next_sequence: u64,
    last_stage: Option<Stage>,
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressEmitter {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Number of events handed off so far.
    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }

    /// Stage of the most recent event handed off.
    pub fn last_stage(&self) -> Option<Stage> {
        self.last_stage
    }

    /// Emit a non-final event, waiting while the buffer is full.
    pub async fn emit(
        &mut self,
        stage: Stage,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Result<(), EventError> {
        debug_assert!(kind != EventKind::Final, "final events go through finish()");
        let event = self.build(stage, kind, message.into(), None);
        self.deliver(event).await
    }

    /// Emit the final event carrying the run's outcome.
    pub async fn finish(mut self, outcome: TerminalOutcome) -> Result<(), EventError> {
        let message = match &outcome {
            TerminalOutcome::Success(_) => "Request completed".to_string(),
            TerminalOutcome::Failure(failure) => failure.detail.clone(),
        };
        let event = self.build(outcome.stage(), EventKind::Final, message, Some(outcome));
        self.deliver(event).await
    }

    fn build(
        &self,
        stage: Stage,
        kind: EventKind,
        message: String,
        outcome: Option<TerminalOutcome>,
    ) -> ProgressEvent {
        ProgressEvent {
            request_id: self.request_id,
            sequence_number: self.next_sequence,
            stage,
            kind,
            message,
            timestamp: Utc::now(),
            outcome,
        }
    }

    // The sequence only advances once the event is handed off, so an
    // abandoned send never leaves a gap.
    async fn deliver(&mut self, event: ProgressEvent) -> Result<(), EventError> {
        let stage = event.stage;
        self.tx
            .send(event)
            .await
            .map_err(|_| EventError::Disconnected)?;
        self.next_sequence += 1;
        self.last_stage = Some(stage);
        Ok(())
    }
}

/// Consumer side of a run's event sequence.
///
/// Yields events in sequence order and ends after the final event (or when
/// the run is dropped). It cannot be restarted.
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Receive the next event, or `None` once the run has ended.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event.
    pub async fn collect_all(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Trait for delivering progress events to a client
///
/// This abstracts over the transport mechanism (websocket, mpsc, stdout,
/// etc.) so the session service can be used in different hosts.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns [`EventError::Disconnected`] if the client is gone; the
    /// caller treats that as a cancellation of the run.
    async fn send(&self, event: ProgressEvent) -> Result<(), EventError>;
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for VecEventSink {
    async fn send(&self, event: ProgressEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
