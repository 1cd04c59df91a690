//! jukebox library crate.
//!
//! Worker processes compete for exclusive ownership of playback channels,
//! drain each owned channel's job queue through a per-channel actor, and
//! react to control events published by producers. Everything is
//! coordinated through a shared [`store::Store`].

pub mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod feedback;
pub mod logging;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod store;
pub mod track;
pub mod transport;
pub mod worker;

pub use error::{Error, Result};
