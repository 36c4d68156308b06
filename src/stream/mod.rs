//! Realtime element stream modules.
//!
//! - `client`: websocket transport and close handling.
//! - `proto`: request and server messages shared with the stream service.
//! - `delivery`: sink and progress seams toward the host design surface.
//! - `sequencer`: strictly ordered resolve-then-deliver queue.
//! - `session`: one card's stream from connect to completion.

/// Websocket connection and command sender.
pub mod client;
/// Delivery sink and progress observer traits.
pub mod delivery;
/// Stream protocol messages.
pub mod proto;
/// Ordered delivery queue.
pub mod sequencer;
/// Session wrapper that owns one streaming exchange.
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
