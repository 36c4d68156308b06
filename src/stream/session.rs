//! One streaming exchange for a single card.
//!
//! `StreamSession` feeds decoded frames into a [`Sequencer`] and resolves to a
//! [`StreamOutcome`] only once the server has signalled completion *and* every
//! accepted element has been resolved and delivered.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::asset::AssetResolver;
use crate::stream::client::{
    ConnectionEvent, StreamClientError, StreamConnection, StreamConnector,
};
use crate::stream::delivery::{DeliveryError, DeliverySink, ProgressObserver};
use crate::stream::proto::{decode_frame, ServerMessage, StreamRequest};
use crate::stream::sequencer::{Sequencer, SequencerError, SequencerReport, SequencerState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal value of a successful session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub delivered: usize,
    /// Elements delivered with their original locator after a failed import.
    pub degraded: usize,
    pub skipped: usize,
    pub declared_total: Option<u64>,
}

impl StreamOutcome {
    /// Whether the server's announced total matches what was delivered.
    pub fn matches_declared_total(&self) -> bool {
        self.declared_total
            .map_or(true, |total| total == self.delivered as u64)
    }
}

impl From<&SequencerReport> for StreamOutcome {
    fn from(report: &SequencerReport) -> Self {
        Self {
            delivered: report.delivered,
            degraded: report.degraded,
            skipped: report.skipped,
            declared_total: report.declared_total,
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open stream: {0}")]
    Connect(#[from] StreamClientError),

    #[error("server error: {message}")]
    Server { message: String },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("delivery of element {index} failed: {source}")]
    Delivery {
        index: u64,
        #[source]
        source: DeliveryError,
    },

    #[error("session already ran")]
    SessionReused,
}

impl StreamError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectionLost { .. })
    }
}

impl From<SequencerError> for StreamError {
    fn from(err: SequencerError) -> Self {
        match err {
            SequencerError::Delivery { index, source } => Self::Delivery { index, source },
        }
    }
}

pub struct StreamSession {
    resolver: Arc<dyn AssetResolver>,
    sink: Arc<dyn DeliverySink>,
    observer: Arc<dyn ProgressObserver>,
    state: SessionState,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    pub fn new(resolver: Arc<dyn AssetResolver>, sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            resolver,
            sink,
            observer: Arc::new(()),
            state: SessionState::Connecting,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connects, sends `request`, and streams until completion or failure.
    pub async fn open(
        &mut self,
        connector: &dyn StreamConnector,
        request: &StreamRequest,
    ) -> Result<StreamOutcome, StreamError> {
        if self.state != SessionState::Connecting {
            return Err(StreamError::SessionReused);
        }
        debug!(event = "session_connecting", title = %request.card.title);

        match connector.connect(request).await {
            Ok(connection) => self.run(connection).await,
            Err(err) => Err(self.fail(StreamError::Connect(err))),
        }
    }

    /// Streams from an already-open connection.
    pub async fn run(&mut self, connection: StreamConnection) -> Result<StreamOutcome, StreamError> {
        if self.state != SessionState::Connecting {
            return Err(StreamError::SessionReused);
        }
        self.transition(SessionState::Streaming);
        self.observer.on_progress(0, "Connected");

        let (sender, events) = connection.split();
        let mut sequencer = Sequencer::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.sink),
            Arc::clone(&self.observer),
        );

        let result = pump(&mut sequencer, events).await;
        let _ = sender.close();

        match result {
            Ok(()) => {
                let outcome = StreamOutcome::from(sequencer.report());
                self.transition(SessionState::Completed);
                info!(
                    event = "session_completed",
                    delivered = outcome.delivered,
                    degraded = outcome.degraded,
                    declared_total = outcome.declared_total
                );
                Ok(outcome)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        self.transition(SessionState::Failed);
        self.observer.on_error(&err.to_string());
        err
    }

    fn transition(&mut self, next: SessionState) {
        debug!(event = "session_state", from = %self.state, to = %next);
        self.state = next;
    }
}

/// Drives inbound events and deliveries until the sequencer completes.
///
/// Inbound events are polled first so that an already-received `error`
/// frame preempts any delivery that has not started yet.
async fn pump(
    sequencer: &mut Sequencer,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) -> Result<(), StreamError> {
    let mut channel_open = true;
    let mut terminal_seen = false;

    loop {
        if sequencer.state() == SequencerState::Completed {
            return Ok(());
        }

        tokio::select! {
            biased;
            event = events.recv(), if channel_open => {
                let closed_reason = match event {
                    Some(ConnectionEvent::Frame(frame)) => {
                        let message = match decode_frame(&frame) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(event = "frame_dropped", error = %err);
                                continue;
                            }
                        };
                        if terminal_seen {
                            warn!(event = "frame_after_terminal", message = ?message);
                            continue;
                        }
                        terminal_seen = message.is_terminal();
                        apply_message(sequencer, message)?;
                        continue;
                    }
                    Some(ConnectionEvent::Closed { code, reason }) => describe_close(code, &reason),
                    Some(ConnectionEvent::Failed(reason)) => reason,
                    None => "connection worker stopped".to_string(),
                };

                channel_open = false;
                if !sequencer.is_upstream_finished() {
                    sequencer.abort();
                    return Err(StreamError::ConnectionLost { reason: closed_reason });
                }
                debug!(
                    event = "channel_closed_after_complete",
                    reason = %closed_reason,
                    queued = sequencer.queued()
                );
            }
            step = sequencer.drive(), if sequencer.is_draining() => {
                step?;
            }
            else => {
                return Err(StreamError::ConnectionLost {
                    reason: "stream ended without completing".to_string(),
                });
            }
        }
    }
}

fn apply_message(sequencer: &mut Sequencer, message: ServerMessage) -> Result<(), StreamError> {
    match message {
        ServerMessage::Element { index, data } => {
            sequencer.enqueue(index, data);
            Ok(())
        }
        ServerMessage::Complete { total_elements } => {
            info!(
                event = "stream_complete_received",
                total_elements,
                delivered = sequencer.report().delivered,
                queued = sequencer.queued()
            );
            sequencer.finish_upstream(total_elements);
            Ok(())
        }
        ServerMessage::Error { message } => {
            sequencer.abort();
            Err(StreamError::Server { message })
        }
    }
}

fn describe_close(code: Option<u16>, reason: &str) -> String {
    match (code, reason.is_empty()) {
        (Some(code), false) => format!("closed with code {code}: {reason}"),
        (Some(code), true) => format!("closed with code {code}"),
        (None, false) => reason.to_string(),
        (None, true) => "closed".to_string(),
    }
}
