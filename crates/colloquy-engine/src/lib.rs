//! # colloquy-engine
//!
//! The scheduler and connection manager: the single-writer run loop that
//! owns the operation queues, opens and closes peer links, dispatches
//! operations as IQs, applies inbound IQs into the store, and emits
//! lifecycle events.
//!
//! One engine instance per process. Public calls and transport callbacks
//! are all serialized through one command channel consumed by the run
//! loop task; persistence mutations happen inside that task only.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod events;
mod handlers;
pub mod scheduler;

pub use config::EngineConfig;
pub use engine::{Engine, LinkFactory};
pub use events::{EngineEvent, EventBus};
