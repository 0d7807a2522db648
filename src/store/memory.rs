use std::collections::{HashMap, HashSet};

use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};

use super::{CrlStore, KeyStorage, SerialAllocator};
use crate::error::StoreError;
use crate::pair::KeyCertPair;

#[derive(Default)]
struct Pairs {
    by_cn: HashMap<String, Vec<KeyCertPair>>,
    serials: HashSet<BigUint>,
}

/// Process-local key storage. Pairs for a common name are kept in insertion order.
#[derive(Default)]
pub struct MemoryKeyStorage {
    pairs: RwLock<Pairs>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored pairs across all common names.
    pub fn len(&self) -> usize {
        self.pairs.read().serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn put(&self, pair: &KeyCertPair) -> Result<(), StoreError> {
        let mut pairs = self.pairs.write();
        if !pairs.serials.insert(pair.serial().clone()) {
            return Err(StoreError::Invalid(format!(
                "serial {} already stored",
                pair.serial()
            )));
        }
        pairs
            .by_cn
            .entry(pair.common_name().to_string())
            .or_default()
            .push(pair.clone());
        Ok(())
    }

    fn get_last_by_cn(&self, common_name: &str) -> Result<KeyCertPair, StoreError> {
        self.pairs
            .read()
            .by_cn
            .get(common_name)
            .and_then(|pairs| pairs.last())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_by_cn(&self, common_name: &str) -> Result<Vec<KeyCertPair>, StoreError> {
        match self.pairs.read().by_cn.get(common_name) {
            Some(pairs) if !pairs.is_empty() => Ok(pairs.clone()),
            _ => Err(StoreError::NotFound),
        }
    }
}

/// Counter-backed allocator; every call returns the previous value plus one.
pub struct MemorySerialAllocator {
    next: Mutex<BigUint>,
}

impl Default for MemorySerialAllocator {
    fn default() -> Self {
        Self::starting_at(BigUint::from(1u32))
    }
}

impl MemorySerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: BigUint) -> Self {
        Self {
            next: Mutex::new(first),
        }
    }
}

impl SerialAllocator for MemorySerialAllocator {
    fn next(&self) -> Result<BigUint, StoreError> {
        let mut next = self.next.lock();
        let serial = next.clone();
        *next += 1u32;
        Ok(serial)
    }
}

/// Process-local CRL holder.
#[derive(Default)]
pub struct MemoryCrlStore {
    current: RwLock<Option<Vec<u8>>>,
}

impl MemoryCrlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CrlStore for MemoryCrlStore {
    fn get(&self) -> Result<Vec<u8>, StoreError> {
        self.current.read().clone().ok_or(StoreError::NotFound)
    }

    fn put(&self, crl_pem: Vec<u8>) -> Result<(), StoreError> {
        *self.current.write() = Some(crl_pem);
        Ok(())
    }

    fn compare_and_put(&self, expected: Option<&[u8]>, crl_pem: Vec<u8>) -> Result<(), StoreError> {
        let mut current = self.current.write();
        if current.as_deref() != expected {
            return Err(StoreError::Conflict);
        }
        *current = Some(crl_pem);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pair(cn: &str, serial: u32) -> KeyCertPair {
        KeyCertPair::new(
            format!("key-{serial}").into_bytes(),
            format!("cert-{serial}").into_bytes(),
            cn,
            BigUint::from(serial),
        )
    }

    #[test]
    fn last_by_cn_follows_insertion_order() {
        let storage = MemoryKeyStorage::new();
        storage.put(&pair("ca", 9)).unwrap();
        storage.put(&pair("ca", 3)).unwrap();
        assert_eq!(storage.get_last_by_cn("ca").unwrap().serial(), &BigUint::from(3u32));
        assert_eq!(storage.get_by_cn("ca").unwrap().len(), 2);
    }

    #[test]
    fn unknown_cn_is_not_found() {
        let storage = MemoryKeyStorage::new();
        assert!(matches!(storage.get_last_by_cn("nobody"), Err(StoreError::NotFound)));
        assert!(matches!(storage.get_by_cn("nobody"), Err(StoreError::NotFound)));
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let storage = MemoryKeyStorage::new();
        storage.put(&pair("a", 1)).unwrap();
        assert!(matches!(storage.put(&pair("b", 1)), Err(StoreError::Invalid(_))));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let allocator = Arc::new(MemorySerialAllocator::new());
        let mut all = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let allocator = Arc::clone(&allocator);
                    s.spawn(move || {
                        (0..100)
                            .map(|_| allocator.next().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
        });
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(unique.len(), 800);
    }

    #[test]
    fn crl_store_compare_and_put() {
        let store = MemoryCrlStore::new();
        assert!(matches!(store.get(), Err(StoreError::NotFound)));
        store.compare_and_put(None, b"one".to_vec()).unwrap();
        assert!(matches!(
            store.compare_and_put(None, b"two".to_vec()),
            Err(StoreError::Conflict)
        ));
        store.compare_and_put(Some(b"one".as_slice()), b"two".to_vec()).unwrap();
        assert_eq!(store.get().unwrap(), b"two".to_vec());
    }
}
