//! # Rooms
//!
//! A room groups the clients that share one translation session. It owns
//! the backend connection for its language pair, fans translated text and
//! audio out to every member, and forwards member audio to the backend.
//!
//! ## Key Components:
//! - **Client**: a member's id and outbound queue
//! - **Room**: the per-room event loop
//! - **Registry**: room lookup and lazy creation by id

pub mod client;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod room;

use crate::config::AppConfig;
use crate::monitor::Monitor;
use crate::store::MessageStore;
use crate::translation::reverse::ReverseTranslator;
use std::sync::Arc;

pub use registry::RoomRegistry;
pub use room::Room;

/// Process-wide services every room is built from.
#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn MessageStore>,
    pub translator: Arc<dyn ReverseTranslator>,
    pub monitor: Arc<Monitor>,
}
