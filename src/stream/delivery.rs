//! Delivery sink and progress surfaces consumed by the sequencer.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::proto::ElementDescriptor;

/// Error returned by a [`DeliverySink`]. Always fatal to the current stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeliveryError {
    pub message: String,
}

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Destination for fully resolved elements.
///
/// Calls are strictly sequential per stream: `deliver` for element N returns
/// before element N+1 is handed over.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, element: &ElementDescriptor) -> Result<(), DeliveryError>;
}

/// Sink that keeps delivered elements in memory, in delivery order.
#[derive(Debug, Default)]
pub struct ElementBuffer {
    elements: Mutex<Vec<ElementDescriptor>>,
}

impl ElementBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything buffered so far.
    pub fn take(&self) -> Vec<ElementDescriptor> {
        self.elements
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeliverySink for ElementBuffer {
    async fn deliver(&self, element: &ElementDescriptor) -> Result<(), DeliveryError> {
        let mut guard = self
            .elements
            .lock()
            .map_err(|_| DeliveryError::new("element buffer lock poisoned"))?;
        guard.push(element.clone());
        Ok(())
    }
}

/// Progress notification mirrored from [`ProgressObserver`] calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress { delivered: usize, status: String },
    Error { message: String },
}

/// Caller-facing progress callbacks.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, delivered: usize, status: &str);

    fn on_error(&self, _message: &str) {}
}

/// Discards all progress.
impl ProgressObserver for () {
    fn on_progress(&self, _delivered: usize, _status: &str) {}
}

/// Forwards progress into a channel; a closed receiver is ignored.
impl ProgressObserver for mpsc::UnboundedSender<ProgressEvent> {
    fn on_progress(&self, delivered: usize, status: &str) {
        let _ = self.send(ProgressEvent::Progress {
            delivered,
            status: status.to_string(),
        });
    }

    fn on_error(&self, message: &str) {
        let _ = self.send(ProgressEvent::Error {
            message: message.to_string(),
        });
    }
}
