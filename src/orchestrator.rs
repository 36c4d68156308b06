//! Batch streaming of generated cards onto host pages.
//!
//! Cards run one after another. Each card gets its own [`StreamSession`]; a
//! failed card is recorded in the [`BatchReport`] and the batch moves on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::asset::AssetResolver;
use crate::cards_api::Card;
use crate::design::{DesignSurface, PageId, PageSink, SurfaceError};
use crate::stream::client::StreamConnector;
use crate::stream::delivery::{DeliveryError, DeliverySink, ElementBuffer, ProgressObserver};
use crate::stream::proto::{CardMsg, ElementDescriptor, PageDimensionsMsg, StreamRequest};
use crate::stream::session::{StreamOutcome, StreamSession};

/// How streamed elements reach the host page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// Place each element as soon as it is delivered. A failed card leaves
    /// whatever was already placed on its page.
    #[default]
    Incremental,
    /// Buffer the whole card and create its page only after the stream
    /// completes. A failed card creates nothing.
    Atomic,
}

/// Where each card's elements go in [`CommitMode::Incremental`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PagePlan {
    /// Card `i` uses slot `i`; cards past the last slot get a new page.
    ReuseSlots(Vec<PageId>),
    /// Each card gets a page created on its first placed element. A card that
    /// succeeds with no elements gets an empty page; one that fails first gets
    /// none.
    #[default]
    NewPagePerCard,
}

#[derive(Clone, Debug, Default)]
pub struct BatchOptions {
    pub commit_mode: CommitMode,
    pub page_plan: PagePlan,
}

impl BatchOptions {
    pub fn with_commit_mode(mut self, commit_mode: CommitMode) -> Self {
        self.commit_mode = commit_mode;
        self
    }

    pub fn with_page_plan(mut self, page_plan: PagePlan) -> Self {
        self.page_plan = page_plan;
        self
    }
}

pub type CardOutcome = StreamOutcome;

#[derive(Clone, Debug, PartialEq)]
pub struct CardReport {
    pub card_index: usize,
    pub title: String,
    /// Page the card was written to, if one was reached.
    pub page: Option<PageId>,
    /// Elements actually placed on the page, also on failure.
    pub placed: usize,
    pub outcome: Result<CardOutcome, String>,
}

impl CardReport {
    fn new(card_index: usize, title: &str) -> Self {
        Self {
            card_index,
            title: title.to_string(),
            page: None,
            placed: 0,
            outcome: Err("not started".to_string()),
        }
    }

    fn failed(mut self, message: impl Into<String>) -> Self {
        self.outcome = Err(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    /// One entry per input card, in input order.
    pub cards: Vec<CardReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &CardReport> {
        self.cards.iter().filter(|card| card.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &CardReport> {
        self.cards.iter().filter(|card| !card.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.cards.iter().all(CardReport::is_success)
    }
}

/// Per-card progress callbacks for a batch.
pub trait BatchObserver: Send + Sync {
    fn on_card_started(&self, _card_index: usize, _title: &str) {}

    fn on_card_progress(&self, _card_index: usize, _delivered: usize, _status: &str) {}

    fn on_card_finished(&self, _card_index: usize, _outcome: &CardOutcome) {}

    fn on_card_failed(&self, _card_index: usize, _message: &str) {}
}

impl BatchObserver for () {}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to read page dimensions: {0}")]
    PageDimensions(#[source] SurfaceError),
}

pub struct DeckOrchestrator {
    connector: Arc<dyn StreamConnector>,
    resolver: Arc<dyn AssetResolver>,
    surface: Arc<dyn DesignSurface>,
    observer: Arc<dyn BatchObserver>,
    options: BatchOptions,
}

impl fmt::Debug for DeckOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeckOrchestrator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DeckOrchestrator {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        resolver: Arc<dyn AssetResolver>,
        surface: Arc<dyn DesignSurface>,
    ) -> Self {
        Self {
            connector,
            resolver,
            surface,
            observer: Arc::new(()),
            options: BatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Streams every card in order.
    ///
    /// Only a failure to read the page context fails the batch as a whole;
    /// per-card failures are reported in [`BatchReport::cards`].
    pub async fn run_batch(&self, cards: &[Card]) -> Result<BatchReport, BatchError> {
        let dimensions = self
            .surface
            .page_dimensions()
            .await
            .map_err(BatchError::PageDimensions)?;
        info!(
            event = "batch_started",
            cards = cards.len(),
            commit_mode = ?self.options.commit_mode
        );

        let mut report = BatchReport::default();
        for (card_index, card) in cards.iter().enumerate() {
            self.observer.on_card_started(card_index, &card.title);
            let card_report = self.run_card(card_index, card, &dimensions).await;

            match &card_report.outcome {
                Ok(outcome) => {
                    info!(
                        event = "card_finished",
                        card_index,
                        delivered = outcome.delivered,
                        degraded = outcome.degraded
                    );
                    self.observer.on_card_finished(card_index, outcome);
                }
                Err(message) => {
                    warn!(
                        event = "card_failed",
                        card_index,
                        placed = card_report.placed,
                        error = %message
                    );
                    self.observer.on_card_failed(card_index, message);
                }
            }
            report.cards.push(card_report);
        }

        info!(
            event = "batch_finished",
            succeeded = report.succeeded().count(),
            failed = report.failed().count()
        );
        Ok(report)
    }

    async fn run_card(
        &self,
        card_index: usize,
        card: &Card,
        dimensions: &PageDimensionsMsg,
    ) -> CardReport {
        let request = StreamRequest::new(CardMsg::from(card), *dimensions);
        let progress: Arc<dyn ProgressObserver> = Arc::new(CardProgress {
            card_index,
            observer: Arc::clone(&self.observer),
        });
        let report = CardReport::new(card_index, &card.title);

        match self.options.commit_mode {
            CommitMode::Incremental => self.stream_incremental(report, &request, progress).await,
            CommitMode::Atomic => self.stream_atomic(report, &request, progress).await,
        }
    }

    async fn stream_incremental(
        &self,
        mut report: CardReport,
        request: &StreamRequest,
        progress: Arc<dyn ProgressObserver>,
    ) -> CardReport {
        let slot = match &self.options.page_plan {
            PagePlan::ReuseSlots(slots) => slots.get(report.card_index).cloned(),
            PagePlan::NewPagePerCard => None,
        };
        let sink = Arc::new(CardPageSink::new(
            Arc::clone(&self.surface),
            &report.title,
            slot,
        ));
        let result = StreamSession::new(
            Arc::clone(&self.resolver),
            Arc::clone(&sink) as Arc<dyn DeliverySink>,
        )
        .with_observer(progress)
        .open(self.connector.as_ref(), request)
        .await;

        report.placed = sink.placed();
        let outcome = match result {
            Ok(outcome) => match sink.page_sink().await {
                Ok(_) => Ok(outcome),
                Err(err) => Err(format!("failed to create page: {err}")),
            },
            Err(err) => Err(err.to_string()),
        };
        report.page = sink.page();
        report.outcome = outcome;
        report
    }

    async fn stream_atomic(
        &self,
        mut report: CardReport,
        request: &StreamRequest,
        progress: Arc<dyn ProgressObserver>,
    ) -> CardReport {
        let buffer = Arc::new(ElementBuffer::new());
        let result = StreamSession::new(
            Arc::clone(&self.resolver),
            Arc::clone(&buffer) as Arc<dyn DeliverySink>,
        )
        .with_observer(progress)
        .open(self.connector.as_ref(), request)
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(
                    event = "card_buffer_discarded",
                    card_index = report.card_index,
                    buffered = buffer.len()
                );
                return report.failed(err.to_string());
            }
        };

        let elements = buffer.take();
        match self.surface.create_page(&report.title, &elements).await {
            Ok(page) => {
                report.page = Some(page);
                report.placed = elements.len();
                report.outcome = Ok(outcome);
                report
            }
            Err(err) => report.failed(format!("failed to create page: {err}")),
        }
    }
}

/// Scopes session progress to one card of the batch.
struct CardProgress {
    card_index: usize,
    observer: Arc<dyn BatchObserver>,
}

impl ProgressObserver for CardProgress {
    fn on_progress(&self, delivered: usize, status: &str) {
        self.observer
            .on_card_progress(self.card_index, delivered, status);
    }
}

/// Places one card's elements on its page and counts what landed.
///
/// Without a reusable slot the page is created on the first delivery, so a
/// card that fails before placing anything leaves no page behind.
struct CardPageSink {
    surface: Arc<dyn DesignSurface>,
    title: String,
    page: OnceCell<PageSink>,
    placed: AtomicUsize,
}

impl CardPageSink {
    fn new(surface: Arc<dyn DesignSurface>, title: &str, slot: Option<PageId>) -> Self {
        let page = OnceCell::new_with(slot.map(|page| PageSink::new(Arc::clone(&surface), page)));
        Self {
            surface,
            title: title.to_string(),
            page,
            placed: AtomicUsize::new(0),
        }
    }

    fn page(&self) -> Option<PageId> {
        self.page.get().map(|sink| sink.page().clone())
    }

    fn placed(&self) -> usize {
        self.placed.load(Ordering::Acquire)
    }

    async fn page_sink(&self) -> Result<&PageSink, SurfaceError> {
        self.page
            .get_or_try_init(|| async {
                let page = self.surface.create_page(&self.title, &[]).await?;
                debug!(event = "card_page_created", title = %self.title, page = %page);
                Ok::<_, SurfaceError>(PageSink::new(Arc::clone(&self.surface), page))
            })
            .await
    }
}

#[async_trait]
impl DeliverySink for CardPageSink {
    async fn deliver(&self, element: &ElementDescriptor) -> Result<(), DeliveryError> {
        let sink = self
            .page_sink()
            .await
            .map_err(|err| DeliveryError::new(format!("failed to create page: {err}")))?;
        sink.deliver(element).await?;
        self.placed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::design::InMemorySurface;
    use crate::stream::client::{
        ConnectionEvent, StreamClientError, StreamConnection, StreamSender,
    };
    use crate::stream::proto::{ServerMessage, StreamFrame};
    use crate::stream::testing::FakeResolver;

    enum Script {
        Frames(Vec<ServerMessage>),
        FramesThenDrop(Vec<ServerMessage>),
        Refuse,
    }

    /// Hands out one scripted connection per `connect` call.
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::default(),
            }
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(
            &self,
            request: &StreamRequest,
        ) -> Result<StreamConnection, StreamClientError> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            let script = self
                .scripts
                .lock()
                .expect("scripts lock")
                .pop_front()
                .expect("script for every card");

            let (messages, close) = match script {
                Script::Refuse => {
                    return Err(StreamClientError::Protocol("handshake refused".to_string()))
                }
                Script::Frames(messages) => (messages, false),
                Script::FramesThenDrop(messages) => (messages, true),
            };

            let (command_tx, _command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            for message in messages {
                let text = message.to_text().expect("encode");
                event_tx
                    .send(ConnectionEvent::Frame(StreamFrame::Text(text)))
                    .expect("queue");
            }
            if close {
                // Lands after the queued frames have been placed.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = event_tx.send(ConnectionEvent::Failed("connection reset".to_string()));
                });
            }
            Ok(StreamConnection::from_channels(
                StreamSender::new(command_tx),
                event_rx,
            ))
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn push(&self, event: String) {
            self.events.lock().expect("events lock").push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events lock").clone()
        }
    }

    impl BatchObserver for RecordingObserver {
        fn on_card_started(&self, card_index: usize, title: &str) {
            self.push(format!("started {card_index} {title}"));
        }

        fn on_card_progress(&self, card_index: usize, delivered: usize, status: &str) {
            self.push(format!("progress {card_index} {delivered} {status}"));
        }

        fn on_card_finished(&self, card_index: usize, outcome: &CardOutcome) {
            self.push(format!("finished {card_index} {}", outcome.delivered));
        }

        fn on_card_failed(&self, card_index: usize, message: &str) {
            self.push(format!("failed {card_index} {message}"));
        }
    }

    fn element(index: u64, text: &str) -> ServerMessage {
        ServerMessage::Element {
            index,
            data: ElementDescriptor::text([text]),
        }
    }

    fn complete(total_elements: u64) -> ServerMessage {
        ServerMessage::Complete { total_elements }
    }

    fn cards(titles: &[&str]) -> Vec<Card> {
        titles
            .iter()
            .map(|title| Card::new(*title, format!("about {title}")))
            .collect()
    }

    fn surface() -> Arc<InMemorySurface> {
        Arc::new(InMemorySurface::new(PageDimensionsMsg::new(1280.0, 720.0)))
    }

    fn orchestrator(
        connector: &Arc<ScriptedConnector>,
        surface: &Arc<InMemorySurface>,
    ) -> DeckOrchestrator {
        DeckOrchestrator::new(
            Arc::clone(connector) as Arc<dyn StreamConnector>,
            Arc::new(FakeResolver::default()),
            Arc::clone(surface) as Arc<dyn DesignSurface>,
        )
    }

    fn texts(page: &crate::design::MemoryPage) -> Vec<String> {
        page.elements
            .iter()
            .map(|element| element.children.join(" "))
            .collect()
    }

    #[tokio::test]
    async fn streams_each_card_onto_its_own_page() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::Frames(vec![element(0, "a0"), element(1, "a1"), complete(2)]),
            Script::Frames(vec![element(0, "b0"), complete(1)]),
        ]));
        let surface = surface();

        let report = orchestrator(&connector, &surface)
            .run_batch(&cards(&["Alpha", "Beta"]))
            .await
            .expect("batch");

        assert!(report.all_succeeded());
        let pages = surface.pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].title, "Alpha");
        assert_eq!(texts(&pages[0]), vec!["a0", "a1"]);
        assert_eq!(texts(&pages[1]), vec!["b0"]);
        assert_eq!(report.cards[0].placed, 2);
        assert_eq!(report.cards[1].page, Some(pages[1].id.clone()));

        let requests = connector.requests();
        assert_eq!(requests[0].card.title, "Alpha");
        assert_eq!(requests[1].card.description, "about Beta");
        assert_eq!(requests[0].page_dimensions, PageDimensionsMsg::new(1280.0, 720.0));
    }

    #[tokio::test]
    async fn failed_card_does_not_abort_batch() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::Frames(vec![element(0, "a0"), complete(1)]),
            Script::Frames(vec![ServerMessage::Error {
                message: "quota exceeded".to_string(),
            }]),
            Script::Frames(vec![element(0, "c0"), complete(1)]),
        ]));
        let surface = surface();
        let observer = Arc::new(RecordingObserver::default());

        let report = orchestrator(&connector, &surface)
            .with_observer(Arc::clone(&observer) as Arc<dyn BatchObserver>)
            .run_batch(&cards(&["A", "B", "C"]))
            .await
            .expect("batch");

        assert_eq!(report.succeeded().count(), 2);
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].card_index, 1);
        assert_eq!(
            failed[0].outcome,
            Err("server error: quota exceeded".to_string())
        );

        let events = observer.events();
        assert!(events.contains(&"failed 1 server error: quota exceeded".to_string()));
        assert_eq!(events.last(), Some(&"finished 2 1".to_string()));
        assert_eq!(
            events.iter().filter(|e| e.starts_with("failed")).count(),
            1
        );
    }

    #[tokio::test]
    async fn reports_card_scoped_progress() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Frames(vec![
            element(0, "only"),
            complete(1),
        ])]));
        let surface = surface();
        let observer = Arc::new(RecordingObserver::default());

        orchestrator(&connector, &surface)
            .with_observer(Arc::clone(&observer) as Arc<dyn BatchObserver>)
            .run_batch(&cards(&["Solo"]))
            .await
            .expect("batch");

        assert_eq!(
            observer.events(),
            vec![
                "started 0 Solo",
                "progress 0 0 Connected",
                "progress 0 1 Placed text element",
                "progress 0 1 Complete",
                "finished 0 1",
            ]
        );
    }

    #[tokio::test]
    async fn reuses_page_slots_then_creates_pages() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::Frames(vec![element(0, "first"), complete(1)]),
            Script::Frames(vec![element(0, "second"), complete(1)]),
        ]));
        let surface = Arc::new(
            InMemorySurface::new(PageDimensionsMsg::new(1280.0, 720.0)).with_page("Existing"),
        );
        let slot = surface.page_ids()[0].clone();

        let report = orchestrator(&connector, &surface)
            .with_options(
                BatchOptions::default().with_page_plan(PagePlan::ReuseSlots(vec![slot.clone()])),
            )
            .run_batch(&cards(&["One", "Two"]))
            .await
            .expect("batch");

        assert_eq!(report.cards[0].page, Some(slot.clone()));
        let pages = surface.pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].title, "Existing");
        assert_eq!(texts(&pages[0]), vec!["first"]);
        assert_eq!(pages[1].title, "Two");
        assert_eq!(texts(&pages[1]), vec!["second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_failure_leaves_partial_page() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::FramesThenDrop(vec![
            element(0, "kept"),
            element(1, "also kept"),
        ])]));
        let surface = surface();

        let report = orchestrator(&connector, &surface)
            .run_batch(&cards(&["Partial"]))
            .await
            .expect("batch");

        let card = &report.cards[0];
        assert!(!card.is_success());
        assert!(card
            .outcome
            .as_ref()
            .expect_err("connection lost")
            .starts_with("connection lost"));
        assert_eq!(card.placed, 2);
        let page = surface.page(card.page.as_ref().expect("page")).expect("page");
        assert_eq!(texts(&page), vec!["kept", "also kept"]);
    }

    #[tokio::test(start_paused = true)]
    async fn atomic_mode_creates_page_only_on_success() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::FramesThenDrop(vec![element(0, "discarded")]),
            Script::Frames(vec![element(0, "x"), element(1, "y"), complete(2)]),
        ]));
        let surface = surface();

        let report = orchestrator(&connector, &surface)
            .with_options(BatchOptions::default().with_commit_mode(CommitMode::Atomic))
            .run_batch(&cards(&["Broken", "Whole"]))
            .await
            .expect("batch");

        assert!(!report.cards[0].is_success());
        assert_eq!(report.cards[0].page, None);
        assert_eq!(report.cards[0].placed, 0);

        let pages = surface.pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title, "Whole");
        assert_eq!(texts(&pages[0]), vec!["x", "y"]);
        assert_eq!(report.cards[1].placed, 2);
    }

    #[tokio::test]
    async fn connect_failure_is_recorded_per_card() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::Refuse,
            Script::Frames(vec![complete(0)]),
        ]));
        let surface = surface();

        let report = orchestrator(&connector, &surface)
            .run_batch(&cards(&["Offline", "Online"]))
            .await
            .expect("batch");

        let message = report.cards[0].outcome.as_ref().expect_err("refused");
        assert!(message.starts_with("failed to open stream"));
        assert_eq!(report.cards[0].page, None);
        assert!(report.cards[1].is_success());

        let pages = surface.pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title, "Online");
        assert!(pages[0].elements.is_empty());
        assert_eq!(report.cards[1].page, Some(pages[0].id.clone()));
    }

    #[tokio::test]
    async fn error_before_first_element_creates_no_page() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Frames(vec![
            ServerMessage::Error {
                message: "model unavailable".to_string(),
            },
        ])]));
        let surface = surface();

        let report = orchestrator(&connector, &surface)
            .run_batch(&cards(&["Empty"]))
            .await
            .expect("batch");

        assert!(!report.cards[0].is_success());
        assert_eq!(report.cards[0].page, None);
        assert_eq!(report.cards[0].placed, 0);
        assert!(surface.pages().is_empty());
    }

    struct UnavailableSurface;

    #[async_trait]
    impl DesignSurface for UnavailableSurface {
        async fn page_dimensions(&self) -> Result<PageDimensionsMsg, SurfaceError> {
            Err(SurfaceError::Unavailable("no design open".to_string()))
        }

        async fn add_element(
            &self,
            page: &PageId,
            _element: &ElementDescriptor,
        ) -> Result<(), SurfaceError> {
            Err(SurfaceError::PageNotFound(page.clone()))
        }

        async fn create_page(
            &self,
            _title: &str,
            _elements: &[ElementDescriptor],
        ) -> Result<PageId, SurfaceError> {
            Err(SurfaceError::Unavailable("no design open".to_string()))
        }
    }

    #[tokio::test]
    async fn missing_page_context_fails_the_batch() {
        let connector = Arc::new(ScriptedConnector::default());
        let orchestrator = DeckOrchestrator::new(
            connector,
            Arc::new(FakeResolver::default()),
            Arc::new(UnavailableSurface),
        );

        let err = orchestrator
            .run_batch(&cards(&["Any"]))
            .await
            .expect_err("no page context");
        assert!(matches!(err, BatchError::PageDimensions(_)));
    }
}
