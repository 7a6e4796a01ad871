//! Durable key-value storage for session state.
//!
//! The session survives restarts by writing a handful of string values
//! (the bearer credential and the serialized user) to one of these backends:
//! - `FileStore`: a JSON document in the cache directory
//! - `KeyringStore`: the OS keychain via `keyring`
//! - `MemoryStore`: process-local, used for tests and `"storage": "memory"` configs

pub mod file;
pub mod keychain;
pub mod memory;

use anyhow::Result;

pub use self::file::FileStore;
pub use self::keychain::KeyringStore;
pub use self::memory::MemoryStore;

/// A string key-value medium that outlives the process.
///
/// Calls are short and blocking and are made directly from async code,
/// often while the session lock is held. Implementations must not block for long.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}
