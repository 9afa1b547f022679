use std::fmt;
use std::time::Duration;

/// Error surface of the key-value store. Every call site picks an explicit
/// fallback instead of swallowing failures.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The backing store cannot be reached or opened.
    Unavailable(String),
    /// The store answered but the operation failed.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::Backend(msg) => write!(f, "store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Increment/expire/get contract shared by the durable store and the
/// in-process fallback. All keyed state is self-expiring: an entry whose
/// TTL has lapsed reads back as absent.
pub trait KvStore: Send + Sync {
    /// Atomically add `delta` to the integer at `key` (missing or expired
    /// keys count from zero) and return the new value.
    fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Re-arm the TTL of an existing key. A missing key is not an error.
    fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remaining lifetime of `key`, if it exists and carries a TTL.
    fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}
