//! `AutocertCache`: the three-method (`Get`/`Put`/`Delete`) cache the ACME
//! client needs for challenge artifacts (spec.md §6). It is nothing more
//! than a `SecureStorage`-backed map under one logical file — no crypto of
//! its own beyond what `SecureStorage` already provides for every logical
//! file.

use crate::error::{VaultError, VaultResult};
use crate::storage::SecureStorage;
use std::collections::HashMap;
use std::sync::Arc;

const LOGICAL_PATH: &str = "autocert-cache.dat";

pub struct AutocertCache {
    storage: Arc<SecureStorage>,
}

impl AutocertCache {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        AutocertCache { storage }
    }

    fn load(&self) -> VaultResult<HashMap<String, Vec<u8>>> {
        match self.storage.read_data_file(LOGICAL_PATH) {
            Ok(map) => Ok(map),
            Err(VaultError::NotFound(_)) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, key: &str) -> VaultResult<Vec<u8>> {
        self.load()?
            .remove(key)
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    pub fn put(&self, key: &str, data: Vec<u8>) -> VaultResult<()> {
        self.storage.update_data_file::<HashMap<String, Vec<u8>>, _, ()>(
            LOGICAL_PATH,
            |map| {
                map.insert(key.to_string(), data);
                Ok(())
            },
        )
    }

    pub fn delete(&self, key: &str) -> VaultResult<()> {
        self.storage.update_data_file::<HashMap<String, Vec<u8>>, _, ()>(
            LOGICAL_PATH,
            |map| {
                map.remove(key);
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvault::MasterKey;

    fn cache() -> (tempfile::TempDir, AutocertCache) {
        let dir = tempfile::tempdir().unwrap();
        let mk = MasterKey::generate();
        let storage = Arc::new(SecureStorage::open(dir.path(), Some(mk)).unwrap());
        (dir, AutocertCache::new(storage))
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_dir, cache) = cache();
        assert!(matches!(cache.get("challenge/foo"), Err(VaultError::NotFound(_))));

        cache.put("challenge/foo", b"token-bytes".to_vec()).unwrap();
        assert_eq!(cache.get("challenge/foo").unwrap(), b"token-bytes");

        cache.delete("challenge/foo").unwrap();
        assert!(matches!(cache.get("challenge/foo"), Err(VaultError::NotFound(_))));
    }
}
