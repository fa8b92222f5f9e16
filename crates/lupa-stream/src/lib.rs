//! Streaming protocol: a connection-oriented, append-only, typed event
//! stream from the coordinator to the client.
//!
//! Event grammar per connection:
//! `start progress* (intent agent_selected)? (text|audio|progress|warning)* (done|error)`.
//! Ordering is strictly preserved; the emitter enforces the grammar and the
//! bounded-buffer backpressure contract.

pub mod chunking;
pub mod emitter;
pub mod events;
pub mod sse;

pub use chunking::{chunk_audio, chunk_text_by_words, DEFAULT_AUDIO_CHUNK_BYTES, DEFAULT_TEXT_CHUNK_WORDS};
pub use emitter::{stream_channel, StreamConfig, StreamEmitter, StreamError, StreamReceiver};
pub use events::StreamEvent;
pub use sse::to_sse_frame;
