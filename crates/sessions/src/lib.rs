//! Persistence for mosschat.
//!
//! A JSON-file backed store of users, chats, records, the offense log and
//! the site config, plus offense accounting with automatic bans.

pub mod offense;
pub mod store;

pub use offense::OffenseAccounting;
pub use store::ChatStore;
