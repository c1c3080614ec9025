//! mosschat server: HTTP/WebSocket API, the inference runtime and its
//! wiring. The `mosschat` binary in `main.rs` is a thin shell around this
//! library.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
