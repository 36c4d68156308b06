//! Ordered delivery of streamed elements.
//!
//! The sequencer owns a FIFO of decoded elements and a single in-flight
//! delivery. Element N is resolved and handed to the sink, and the sink call
//! returns, before element N+1 leaves the queue. That keeps the host's
//! stacking order identical to the server's emission order regardless of how
//! long individual asset imports take.
//!
//! The sequencer does not spawn. The in-flight delivery is a boxed future that
//! the owner polls through [`Sequencer::drive`]; `drive` is cancel-safe, so the
//! owner can race it against inbound frames and call it again later.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::{AssetResolver, MediaKind};
use crate::stream::delivery::{DeliveryError, DeliverySink, ProgressObserver};
use crate::stream::proto::{ElementDescriptor, ElementKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    /// Nothing in flight; waiting for more elements or for the end of stream.
    Idle,
    /// One element is being resolved or delivered.
    Draining,
    /// Upstream finished and every accepted element was delivered.
    Completed,
    /// A delivery failed or the stream was aborted.
    Failed,
}

impl SequencerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Queue entry awaiting its turn.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingElement {
    pub index: u64,
    pub descriptor: ElementDescriptor,
}

/// Result of one completed delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredElement {
    pub index: u64,
    pub kind: ElementKind,
    /// The asset import failed and the original locator was delivered.
    pub degraded: bool,
}

/// Counters accumulated over the life of a sequencer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequencerReport {
    pub delivered: usize,
    pub degraded: usize,
    /// Duplicate indices dropped on arrival.
    pub skipped: usize,
    /// `total_elements` announced by the server, once known.
    pub declared_total: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("delivery of element {index} failed: {source}")]
    Delivery {
        index: u64,
        #[source]
        source: DeliveryError,
    },
}

type InFlight = BoxFuture<'static, Result<DeliveredElement, SequencerError>>;

pub struct Sequencer {
    resolver: Arc<dyn AssetResolver>,
    sink: Arc<dyn DeliverySink>,
    observer: Arc<dyn ProgressObserver>,
    queue: VecDeque<PendingElement>,
    in_flight: Option<InFlight>,
    state: SequencerState,
    upstream_finished: bool,
    next_index: u64,
    report: SequencerReport,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight.is_some())
            .field("upstream_finished", &self.upstream_finished)
            .field("report", &self.report)
            .finish()
    }
}

impl Sequencer {
    pub fn new(
        resolver: Arc<dyn AssetResolver>,
        sink: Arc<dyn DeliverySink>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            resolver,
            sink,
            observer,
            queue: VecDeque::new(),
            in_flight: None,
            state: SequencerState::Idle,
            upstream_finished: false,
            next_index: 0,
            report: SequencerReport::default(),
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn report(&self) -> &SequencerReport {
        &self.report
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether a delivery is in flight and [`Sequencer::drive`] has work.
    pub fn is_draining(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_upstream_finished(&self) -> bool {
        self.upstream_finished
    }

    /// Appends an element at the tail and starts draining if idle.
    ///
    /// Returns `false` when the element was not accepted: a duplicate index,
    /// or the sequencer already reached a terminal state.
    pub fn enqueue(&mut self, index: u64, descriptor: ElementDescriptor) -> bool {
        if self.state.is_terminal() || self.upstream_finished {
            warn!(event = "element_after_end", index, state = %self.state);
            return false;
        }

        if index < self.next_index {
            warn!(
                event = "duplicate_element_skipped",
                index,
                expected = self.next_index
            );
            self.report.skipped += 1;
            return false;
        }
        let Some(next_index) = index.checked_add(1) else {
            warn!(event = "element_index_out_of_range", index);
            return false;
        };
        if index > self.next_index {
            warn!(event = "element_index_gap", index, expected = self.next_index);
        }
        self.next_index = next_index;

        debug!(
            event = "element_enqueued",
            index,
            kind = %descriptor.kind,
            queued = self.queue.len()
        );
        self.queue.push_back(PendingElement { index, descriptor });
        if self.in_flight.is_none() {
            self.start_next();
        }
        true
    }

    /// Marks the upstream as finished.
    ///
    /// Completion happens now if nothing is queued or in flight, otherwise
    /// once the last queued element has been delivered.
    pub fn finish_upstream(&mut self, declared_total: u64) {
        if self.state.is_terminal() {
            return;
        }
        self.upstream_finished = true;
        self.report.declared_total = Some(declared_total);
        if self.in_flight.is_none() && self.queue.is_empty() {
            self.complete();
        }
    }

    /// Awaits the in-flight delivery and advances to the next element.
    ///
    /// Cancel-safe: dropping the returned future leaves the in-flight
    /// delivery in place for the next call.
    pub async fn drive(&mut self) -> Result<SequencerState, SequencerError> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(self.state);
        };
        let result = in_flight.await;
        self.in_flight = None;

        match result {
            Ok(delivered) => {
                self.record(delivered);
                if !self.queue.is_empty() {
                    self.start_next();
                } else if self.upstream_finished {
                    self.complete();
                } else {
                    self.state = SequencerState::Idle;
                }
                Ok(self.state)
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    /// Drops the queue and any in-flight delivery.
    pub fn abort(&mut self) {
        if self.state == SequencerState::Completed {
            return;
        }
        if self.in_flight.is_some() || !self.queue.is_empty() {
            debug!(
                event = "sequencer_aborted",
                queued = self.queue.len(),
                in_flight = self.in_flight.is_some()
            );
        }
        self.fail();
    }

    fn start_next(&mut self) {
        let Some(entry) = self.queue.pop_front() else {
            return;
        };
        let resolver = Arc::clone(&self.resolver);
        let sink = Arc::clone(&self.sink);
        self.in_flight = Some(Box::pin(process_element(entry, resolver, sink)));
        self.state = SequencerState::Draining;
    }

    fn record(&mut self, delivered: DeliveredElement) {
        self.report.delivered += 1;
        if delivered.degraded {
            self.report.degraded += 1;
        }
        debug!(
            event = "element_delivered",
            index = delivered.index,
            kind = %delivered.kind,
            degraded = delivered.degraded,
            delivered = self.report.delivered
        );
        self.observer.on_progress(
            self.report.delivered,
            &format!("Placed {} element", delivered.kind),
        );
    }

    fn complete(&mut self) {
        self.state = SequencerState::Completed;
        if let Some(total) = self.report.declared_total {
            if total != self.report.delivered as u64 {
                warn!(
                    event = "element_total_mismatch",
                    declared_total = total,
                    delivered = self.report.delivered,
                    skipped = self.report.skipped
                );
            }
        }
        self.observer.on_progress(self.report.delivered, "Complete");
    }

    fn fail(&mut self) {
        self.in_flight = None;
        self.queue.clear();
        self.state = SequencerState::Failed;
    }
}

async fn process_element(
    entry: PendingElement,
    resolver: Arc<dyn AssetResolver>,
    sink: Arc<dyn DeliverySink>,
) -> Result<DeliveredElement, SequencerError> {
    let PendingElement {
        index,
        mut descriptor,
    } = entry;
    let mut degraded = false;

    let media = descriptor
        .resource_locator()
        .map(str::to_string)
        .zip(MediaKind::for_element(descriptor.kind));
    if let Some((locator, kind)) = media {
        match resolver.resolve(&locator, kind).await {
            Ok(asset) => descriptor.resource = Some(asset.into_string()),
            Err(err) => {
                warn!(
                    event = "asset_resolution_degraded",
                    index,
                    locator = %locator,
                    error = %err
                );
                degraded = true;
            }
        }
    }

    sink.deliver(&descriptor)
        .await
        .map_err(|source| SequencerError::Delivery { index, source })?;

    Ok(DeliveredElement {
        index,
        kind: descriptor.kind,
        degraded,
    })
}
