//! Stream one card into memory and print each placed element.
//!
//! Before running:
//! - Replace the API key placeholder.
//! - Set `RUST_LOG=deckstream_sdk=debug` to watch the sequencer.
//!
//! Pass `--local` to target a backend on `localhost:8000`.

use std::error::Error;
use std::sync::Arc;

use deckstream_sdk::asset::HttpAssetResolver;
use deckstream_sdk::stream::client::StreamClient;
use deckstream_sdk::stream::delivery::{DeliverySink, ElementBuffer, ProgressEvent};
use deckstream_sdk::stream::proto::{CardMsg, PageDimensionsMsg, StreamRequest};
use deckstream_sdk::stream::session::StreamSession;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let local = std::env::args().any(|arg| arg == "--local");

    let client = StreamClient::new()
        .with_api_key(SecretString::new(api_key.clone()))
        .with_local_mode(local);
    let resolver = HttpAssetResolver::with_api_key(SecretString::new(api_key))?.with_local_mode(local);
    let buffer = Arc::new(ElementBuffer::new());
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();

    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            match event {
                ProgressEvent::Progress { delivered, status } => {
                    println!("[{delivered}] {status}");
                }
                ProgressEvent::Error { message } => println!("error: {message}"),
            }
        }
    });

    let request = StreamRequest::new(
        CardMsg {
            title: "The rise of rooftop solar".to_string(),
            description: "Costs, adoption, and what changed in the last decade".to_string(),
        },
        PageDimensionsMsg::new(1920.0, 1080.0),
    );
    let mut session = StreamSession::new(
        Arc::new(resolver),
        Arc::clone(&buffer) as Arc<dyn DeliverySink>,
    )
    .with_observer(Arc::new(progress_tx));

    let outcome = session.open(&client, &request).await;
    drop(session);
    let _ = printer.await;

    let outcome = outcome?;
    println!(
        "delivered={} degraded={} declared_total={:?}",
        outcome.delivered, outcome.degraded, outcome.declared_total
    );
    for element in buffer.take() {
        println!("{}", serde_json::to_string(&element)?);
    }
    Ok(())
}
