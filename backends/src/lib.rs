pub mod local;
pub mod retry;

pub use cairn_core::{Backend, BackendType, MemoryBackend};
pub use local::LocalBackend;
pub use retry::{RetryConfig, RetryingBackend, Retryable, retry_with_backoff};
