//! Event sinks delivering progress events to a client transport

use async_trait::async_trait;
use pipeline_engine::{EventError, EventSink, ProgressEvent};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

/// Forwards events into a tokio channel.
///
/// A dropped receiver reports [`EventError::Disconnected`].
pub struct ChannelEventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver it feeds.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn send(&self, event: ProgressEvent) -> Result<(), EventError> {
        self.tx.send(event).await.map_err(|_| EventError::Disconnected)
    }
}

/// Writes each event as one line of JSON.
///
/// A failed write (closed pipe, for one) reports
/// [`EventError::Disconnected`].
pub struct JsonLinesEventSink<W> {
    writer: Mutex<W>,
}

impl JsonLinesEventSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for JsonLinesEventSink<W> {
    async fn send(&self, event: ProgressEvent) -> Result<(), EventError> {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to serialize progress event: {}", e);
                return Ok(());
            }
        };
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.map_err(closed)?;
        writer.flush().await.map_err(closed)
    }
}

fn closed(e: std::io::Error) -> EventError {
    log::warn!("Event writer closed: {}", e);
    EventError::Disconnected
}
