//! Wire protocol: the envelope model and its framings.
//!
//! One logical [`envelope::Envelope`] is carried either as a single NDJSON
//! line (stdio, HTTP streaming) or as the `data:` payload of a server-sent
//! event. Both framings live in [`codec`].

pub mod codec;
pub mod envelope;
pub mod types;

pub use codec::{NdjsonDecoder, SseDecoder};
pub use envelope::{Envelope, EnvelopeKind, ErrorObject, RequestId};
