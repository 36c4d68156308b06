//! Generate cards from a prompt and stream each onto its own page.
//!
//! Before running:
//! - Replace the API key placeholder.
//! - Pass the prompt as arguments, e.g. `cargo run --example generate_deck -- rooftop solar`.
//!
//! Pages are kept in memory and printed at the end; `--atomic` only creates
//! pages for cards that streamed completely.

use std::error::Error;
use std::sync::Arc;

use deckstream_sdk::asset::HttpAssetResolver;
use deckstream_sdk::cards_api::CardsApiClient;
use deckstream_sdk::design::{DesignSurface, InMemorySurface};
use deckstream_sdk::orchestrator::{
    BatchObserver, BatchOptions, CardOutcome, CommitMode, DeckOrchestrator,
};
use deckstream_sdk::stream::client::StreamClient;
use deckstream_sdk::stream::proto::PageDimensionsMsg;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

struct PrintObserver;

impl BatchObserver for PrintObserver {
    fn on_card_started(&self, card_index: usize, title: &str) {
        println!("card {card_index}: {title}");
    }

    fn on_card_progress(&self, card_index: usize, delivered: usize, status: &str) {
        println!("  card {card_index} [{delivered}] {status}");
    }

    fn on_card_finished(&self, card_index: usize, outcome: &CardOutcome) {
        println!("card {card_index} done, {} elements", outcome.delivered);
    }

    fn on_card_failed(&self, card_index: usize, message: &str) {
        println!("card {card_index} failed: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let atomic = std::env::args().any(|arg| arg == "--atomic");
    let prompt = std::env::args()
        .skip(1)
        .filter(|arg| !arg.starts_with("--"))
        .collect::<Vec<_>>()
        .join(" ");

    let cards_api = CardsApiClient::with_api_key(SecretString::new(api_key.clone()))?;
    let created = cards_api.create_cards(&prompt).await?;
    println!("session_id={} cards={}", created.session_id, created.cards.len());

    let surface = Arc::new(InMemorySurface::new(PageDimensionsMsg::new(1920.0, 1080.0)));
    let commit_mode = if atomic {
        CommitMode::Atomic
    } else {
        CommitMode::Incremental
    };
    let orchestrator = DeckOrchestrator::new(
        Arc::new(StreamClient::new().with_api_key(SecretString::new(api_key.clone()))),
        Arc::new(HttpAssetResolver::with_api_key(SecretString::new(api_key))?),
        Arc::clone(&surface) as Arc<dyn DesignSurface>,
    )
    .with_options(BatchOptions::default().with_commit_mode(commit_mode))
    .with_observer(Arc::new(PrintObserver));

    let report = orchestrator.run_batch(&created.cards).await?;
    println!(
        "succeeded={} failed={}",
        report.succeeded().count(),
        report.failed().count()
    );
    for page in surface.pages() {
        println!("{} \"{}\": {} elements", page.id, page.title, page.elements.len());
    }
    Ok(())
}
