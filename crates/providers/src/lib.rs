pub mod moss;
pub mod openai_compat;
pub mod registry;
pub mod sensitive;
pub mod traits;
pub(crate) mod sse;
pub(crate) mod util;

// Re-exports for convenience.
pub use registry::ProviderRegistry;
pub use sensitive::SensitiveChecker;
pub use traits::{
    BackendResolver, ChatStreamRequest, ChatStreamer, MossBackend, MossRequest, MossResponse,
};
pub use util::resolve_api_key;
