//! # colloquy-model
//!
//! The descriptor model: tagged variants over a common envelope, their
//! wire/storage serialization keyed by `(schema_id, schema_version)`, and
//! the conversation/group-member entities they hang off.
//!
//! Serialization evolves along two axes. Each variant owns one schema id;
//! the schema version selects the envelope generation (version 3 frames
//! lack the expiration/addressing extensions that version 4 added). The
//! registry in [`schema`] is the single place that maps a header pair to a
//! decoder; unknown pairs are dropped, not crashed on.

pub mod annotation;
pub mod conversation;
pub mod descriptor;
pub mod envelope;
pub mod schema;

pub use annotation::{Annotation, AnnotationSummary};
pub use conversation::{Conversation, ConversationKind};
pub use descriptor::{
    CallDescriptor, ClearDescriptor, Descriptor, FileDescriptor, FileInfo, GeolocationDescriptor,
    InvitationDescriptor, ObjectDescriptor, TwincodeDescriptor,
};
pub use envelope::Envelope;
pub use schema::{ENVELOPE_VERSION_3, ENVELOPE_VERSION_4};
