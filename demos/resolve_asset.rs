//! Import one remote image and print the host reference.
//!
//! Usage: `cargo run --example resolve_asset -- https://example.com/photo.jpg`

use std::error::Error;

use deckstream_sdk::asset::{AssetResolver, HttpAssetResolver, MediaKind};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let locator = std::env::args()
        .nth(1)
        .ok_or("usage: resolve_asset <image-url>")?;

    let resolver = HttpAssetResolver::with_api_key(SecretString::new(api_key))?;
    let asset = resolver.resolve(&locator, MediaKind::Image).await?;
    println!("ref={asset}");
    Ok(())
}
