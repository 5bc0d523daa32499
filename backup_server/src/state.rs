use std::path::Path;
use std::sync::Arc;
use vault_core::{AutocertCache, BlobEngine, MetadataEngine, SecureStorage};

/// Shared application state: one database root, opened once at startup,
/// wired into the three engines every handler needs.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<SecureStorage>,
    pub metadata: Arc<MetadataEngine>,
    pub blobs: Arc<BlobEngine>,
    pub autocert: Arc<AutocertCache>,
}

impl AppState {
    pub fn open(root: &Path, passphrase: &str) -> anyhow::Result<Self> {
        let master_key = vault_core::keyvault::MasterKey::load(passphrase, &root.join("master.key"))
            .or_else(|_| -> anyhow::Result<_> {
                let mk = vault_core::keyvault::MasterKey::generate();
                mk.save(passphrase, &root.join("master.key"))?;
                Ok(mk)
            })?;
        let storage = Arc::new(SecureStorage::open(root, Some(master_key))?);
        let metadata = Arc::new(MetadataEngine::new(storage.clone()));
        let blobs = Arc::new(BlobEngine::new(storage.clone()));
        let autocert = Arc::new(AutocertCache::new(storage.clone()));
        Ok(AppState {
            storage,
            metadata,
            blobs,
            autocert,
        })
    }
}
