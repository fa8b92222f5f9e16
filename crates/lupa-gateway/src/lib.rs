//! HTTP surface: chat, streaming, investigations, agent listing, health.
//!
//! Graceful partial failures answer 200 with a typed body; hard errors map
//! to 4xx/5xx. The SSE endpoint serializes the typed stream events defined
//! in `lupa-stream`.

pub mod server;

pub use server::{build_gateway_router, run_gateway_server, GatewayState};
