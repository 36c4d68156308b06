//! Rust SDK for streaming generated slide elements onto a design surface.
//!
//! The crate is organized by surface:
//! - `stream`: websocket client, element codec, ordered sequencer, and the
//!   per-card session.
//! - `asset`: import of remote images and videos into host references.
//! - `design`: the host design surface seam and page-bound sinks.
//! - `orchestrator`: batch driver that streams one card per page.
//! - `cards_api`: HTTP client for the card generation backend.
//! - `retry`: shared retry and timeout utilities.

/// Remote asset resolution.
pub mod asset;
/// Card generation backend client.
pub mod cards_api;
/// Host design surface and page sinks.
pub mod design;
/// Batch orchestration across cards.
pub mod orchestrator;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime element stream client, protocol types, and session.
pub mod stream;
