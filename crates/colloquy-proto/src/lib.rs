//! # colloquy-proto
//!
//! The IQ wire protocol and the operation set.
//!
//! Every packet exchanged over a peer link is an IQ: a schema header, a
//! request id, and family-specific fields, correlated request-to-response
//! by `(conversation, request_id)` within one link. Operations are the
//! durable outgoing intents that, when executed against an open link,
//! become one or more IQs.

pub mod chunk;
pub mod iq;
pub mod link;
pub mod operation;
pub mod versions;

pub use chunk::{ChunkAssembly, ChunkTransfer};
pub use iq::Iq;
pub use link::{LinkState, PeerLink};
pub use operation::{ExecuteContext, OperationContent, PendingOperation};
