//! Shared domain types for mosschat: errors, configuration, the persisted
//! data model, and the wire frames exchanged with clients and backends.

pub mod config;
pub mod error;
pub mod frame;
pub mod model;
pub mod stream;
pub mod tool;
pub mod trace;
