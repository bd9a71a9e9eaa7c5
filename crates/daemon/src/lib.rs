//! Supervisor for short-lived slide deck preview renderers.
//!
//! A request for a deck leases a port from the shared registry, starts a
//! renderer on it and hands back the URL. Renderers that sit idle are stopped
//! and their ports returned.

pub mod api;
pub mod config;
pub mod db;
pub mod deck;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod source;
pub mod supervisor;

#[cfg(all(test, unix))]
mod test_util;

pub use deck::DeckId;
pub use error::{PreviewError, Result};
pub use supervisor::Supervisor;
