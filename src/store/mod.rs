//! Contracts for the collaborators the core relies on: durable key/certificate
//! storage, a serial allocator and the holder of the current CRL.
//!
//! Two families of implementations ship with the crate: [`memory`] for tests
//! and embedding, [`fs`] for a single host keeping its PKI in a directory.

pub mod fs;
pub mod memory;

use num_bigint::BigUint;

use crate::error::StoreError;
use crate::pair::KeyCertPair;

pub use fs::{DirKeyStorage, FileCrlStore, FileSerialAllocator};
pub use memory::{MemoryCrlStore, MemoryKeyStorage, MemorySerialAllocator};

/// Durable mapping from common name to every pair issued under it.
pub trait KeyStorage: Send + Sync {
    /// Stores `pair` under its common name and serial.
    fn put(&self, pair: &KeyCertPair) -> Result<(), StoreError>;

    /// Most recently stored pair for `common_name`, or `StoreError::NotFound`.
    fn get_last_by_cn(&self, common_name: &str) -> Result<KeyCertPair, StoreError>;

    /// Every pair ever stored for `common_name`, or `StoreError::NotFound` if there is none.
    fn get_by_cn(&self, common_name: &str) -> Result<Vec<KeyCertPair>, StoreError>;
}

/// Source of serial numbers. Concurrent calls must never return the same value,
/// and a value must never be handed out twice over the lifetime of the storage.
pub trait SerialAllocator: Send + Sync {
    fn next(&self) -> Result<BigUint, StoreError>;
}

/// Holder of the single current signed CRL (PEM bytes).
pub trait CrlStore: Send + Sync {
    /// Current CRL, or `StoreError::NotFound` if none was ever written.
    fn get(&self) -> Result<Vec<u8>, StoreError>;

    /// Replaces the stored CRL. On failure the previous CRL must stay intact.
    fn put(&self, crl_pem: Vec<u8>) -> Result<(), StoreError>;

    /// Replaces the stored CRL only if it still equals `expected` (`None` meaning
    /// "no CRL yet"), failing with `StoreError::Conflict` otherwise.
    ///
    /// The default is a plain check-then-put and is only atomic against writers
    /// sharing the caller's lock; stores reachable from several processes should
    /// override it.
    fn compare_and_put(&self, expected: Option<&[u8]>, crl_pem: Vec<u8>) -> Result<(), StoreError> {
        let current = match self.get() {
            Ok(current) => Some(current),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        };
        if current.as_deref() != expected {
            return Err(StoreError::Conflict);
        }
        self.put(crl_pem)
    }
}
