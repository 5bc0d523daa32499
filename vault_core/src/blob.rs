//! Content blobs with reference counts: addition, cross-set moves, trash
//! eviction, and the orphan scanner (spec.md §4.5).

use crate::error::{VaultError, VaultResult};
use crate::metadata::{
    contacts_path, BlobSpec, DeleteEvent, DeleteKind, FileSet, FileSpec, Quotas, SetKind,
};
use crate::storage::{SecureStorage, TxPath};
use log::warn;
use rand::{rngs::OsRng, RngCore};
use std::collections::HashSet;
use std::sync::Arc;

fn random_blob_path() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("blobs/{}/{}", hex::encode(&bytes[0..1]), hex::encode(&bytes[1..]))
}

/// The `.ref` sidecar path for a content-addressed blob. Shared with the
/// master-key rotation walk in [`crate::admin`], which needs the same
/// addressing without constructing a `BlobEngine`.
pub(crate) fn ref_path(blob_path: &str) -> String {
    format!("{blob_path}.ref")
}

pub struct NewBlob {
    pub content_temp: String,
    pub thumb_temp: String,
    pub content_size: u64,
    pub thumb_size: u64,
    pub headers: Vec<u8>,
}

pub struct BlobEngine {
    storage: Arc<SecureStorage>,
}

impl BlobEngine {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        BlobEngine { storage }
    }

    fn space_used(&self, _owner: crate::metadata::UserId) -> VaultResult<u64> {
        // BlobEngine only needs to check quota at AddFile time; delegating
        // to MetadataEngine would create a dependency cycle, so the sum is
        // recomputed here the same way MetadataEngine::space_used does.
        crate::metadata::MetadataEngine::new(self.storage.clone()).space_used(_owner)
    }

    fn quota(&self, owner: crate::metadata::UserId) -> VaultResult<u64> {
        let quotas: Quotas = self.storage.read_data_file("quotas.dat").unwrap_or_default();
        match quotas.limits.get(&owner) {
            Some(limit) => Ok(crate::metadata::normalize_quota(limit.value, &limit.unit)),
            None => Ok(crate::metadata::normalize_quota(quotas.default_limit, &quotas.default_limit_unit)),
        }
    }

    /// Renames the two just-written temp files into content-addressed
    /// blob storage, creates their `.ref` sidecars at `ref_count=1`, and
    /// inserts the FileSpec into `storage_path`'s FileSet — all one
    /// transaction alongside the two new ref files. Quota is checked
    /// first so a rejected upload never touches the filesystem beyond the
    /// temp files it already owns.
    pub fn add_file(
        &self,
        owner: crate::metadata::UserId,
        storage_path: &str,
        filename: &str,
        new_blob: NewBlob,
        now_ms: i64,
    ) -> VaultResult<()> {
        let used = self.space_used(owner)?;
        let quota = self.quota(owner)?;
        let incoming = new_blob.content_size + new_blob.thumb_size;
        if used + incoming > quota {
            let _ = self.storage.remove_blob(&new_blob.content_temp);
            let _ = self.storage.remove_blob(&new_blob.thumb_temp);
            return Err(VaultError::QuotaExceeded);
        }

        let content_path = random_blob_path();
        let thumb_path = random_blob_path();
        self.storage.rename_blob(&new_blob.content_temp, &content_path)?;
        self.storage.rename_blob(&new_blob.thumb_temp, &thumb_path)?;

        let spec = FileSpec {
            headers: new_blob.headers,
            date_created: now_ms,
            date_modified: now_ms,
            version: 1,
            store_file_path: content_path.clone(),
            store_file_size: new_blob.content_size,
            store_thumb_path: thumb_path.clone(),
            store_thumb_size: new_blob.thumb_size,
        };

        let storage_path_owned = storage_path.to_string();
        let filename_owned = filename.to_string();
        let content_ref = ref_path(&content_path);
        let thumb_ref = ref_path(&thumb_path);

        let result = self.storage.update_many(
            &[
                TxPath::meta(&storage_path_owned),
                TxPath::blob(&content_ref),
                TxPath::blob(&thumb_ref),
            ],
            |values| {
                let mut fs: FileSet = match values.get(&storage_path_owned) {
                    Some(bytes) => serde_json::from_slice(bytes)?,
                    None => FileSet::default(),
                };
                fs.files.insert(filename_owned.clone(), spec.clone());
                values.insert(storage_path_owned.clone(), serde_json::to_vec(&fs)?);
                values.insert(content_ref.clone(), serde_json::to_vec(&BlobSpec { ref_count: 1 })?);
                values.insert(thumb_ref.clone(), serde_json::to_vec(&BlobSpec { ref_count: 1 })?);
                Ok(())
            },
        );

        if result.is_err() {
            let _ = self.storage.remove_blob(&content_path);
            let _ = self.storage.remove_blob(&thumb_path);
        }
        result
    }

    /// Adjusts a blob's `.ref` sidecar by `delta`, removing both the
    /// sidecar and the blob itself in the same transaction once the count
    /// reaches zero. `delta` of 0 is a no-op (used when a move target
    /// already referenced the blob).
    fn adjust_ref(&self, blob_path: &str, delta: i64) -> VaultResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let ref_key = ref_path(blob_path);
        let blob_path_owned = blob_path.to_string();
        let removed = self.storage.update_many(&[TxPath::blob(&ref_key)], |values| {
            let mut spec: BlobSpec = match values.get(&ref_key) {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => BlobSpec::default(),
            };
            spec.ref_count += delta;
            if spec.ref_count < 0 {
                panic!("ref count underflow for {blob_path_owned}");
            }
            if spec.ref_count == 0 {
                values.remove(&ref_key);
                Ok(true)
            } else {
                values.insert(ref_key.clone(), serde_json::to_vec(&spec)?);
                Ok(false)
            }
        })?;
        if removed {
            self.storage.remove_blob(blob_path)?;
        }
        Ok(())
    }

    pub fn incref(&self, blob_path: &str) -> VaultResult<()> {
        self.adjust_ref(blob_path, 1)
    }

    pub fn unref(&self, blob_path: &str) -> VaultResult<()> {
        self.adjust_ref(blob_path, -1)
    }

    /// Ref-count delta table from spec.md §4.5: whether a blob already
    /// present at `to` changes the charge for a copy vs. a move.
    fn move_delta(is_move: bool, already_in_target: bool) -> i64 {
        match (is_move, already_in_target) {
            (false, false) => 1,
            (false, true) => 0,
            (true, false) => 0,
            (true, true) => -1,
        }
    }

    /// Moves or copies `filename` from `from_path`'s FileSet into
    /// `to_path`'s, optionally rewriting the recipient's header view.
    /// Same-set-same-album "moves" are forced to copy semantics per spec.
    pub fn move_file(
        &self,
        from_path: &str,
        to_path: &str,
        filename: &str,
        new_headers: Option<Vec<u8>>,
        is_move: bool,
        source_event_kind: DeleteKind,
        now_ms: i64,
    ) -> VaultResult<()> {
        let is_move = is_move && from_path != to_path;
        let from_owned = from_path.to_string();
        let to_owned = to_path.to_string();
        let filename_owned = filename.to_string();

        let (content_path, thumb_path, content_delta, thumb_delta) = self.storage.update_many(
            &[TxPath::meta(&from_owned), TxPath::meta(&to_owned)],
            |values| {
                let mut from_fs: FileSet = match values.get(&from_owned) {
                    Some(bytes) => serde_json::from_slice(bytes)?,
                    None => return Err(VaultError::NotFound(from_owned.clone())),
                };
                let mut to_fs: FileSet = match values.get(&to_owned) {
                    Some(bytes) => serde_json::from_slice(bytes)?,
                    None => FileSet::default(),
                };

                let mut spec = from_fs
                    .files
                    .get(&filename_owned)
                    .cloned()
                    .ok_or_else(|| VaultError::NotFound(filename_owned.clone()))?;

                let already_in_target = to_fs.files.contains_key(&filename_owned);
                let content_delta = Self::move_delta(is_move, already_in_target);
                let thumb_delta = content_delta;

                if let Some(headers) = new_headers {
                    spec.headers = headers;
                }
                spec.date_modified = now_ms;
                let content_path = spec.store_file_path.clone();
                let thumb_path = spec.store_thumb_path.clone();
                to_fs.files.insert(filename_owned.clone(), spec);

                if is_move {
                    from_fs.files.remove(&filename_owned);
                    push_event(
                        &mut from_fs.deletes,
                        &mut from_fs.delete_horizon_ms,
                        DeleteEvent {
                            file: Some(filename_owned.clone()),
                            album_id: None,
                            kind: source_event_kind,
                            date_ms: now_ms,
                        },
                        now_ms,
                    );
                }

                values.insert(from_owned.clone(), serde_json::to_vec(&from_fs)?);
                values.insert(to_owned.clone(), serde_json::to_vec(&to_fs)?);
                Ok((content_path, thumb_path, content_delta, thumb_delta))
            },
        )?;

        self.adjust_ref(&content_path, content_delta)?;
        self.adjust_ref(&thumb_path, thumb_delta)?;
        Ok(())
    }

    /// Deletes trash entries whose `date_modified <= before_ms`.
    pub fn empty_trash(&self, trash_path: &str, before_ms: i64, now_ms: i64) -> VaultResult<()> {
        let trash_owned = trash_path.to_string();
        let removed: Vec<FileSpec> = self.storage.update_many(&[TxPath::meta(&trash_owned)], |values| {
            let mut fs: FileSet = match values.get(&trash_owned) {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => FileSet::default(),
            };
            let expired: Vec<String> = fs
                .files
                .iter()
                .filter(|(_, spec)| spec.date_modified <= before_ms)
                .map(|(name, _)| name.clone())
                .collect();
            let mut removed = Vec::with_capacity(expired.len());
            for name in expired {
                if let Some(spec) = fs.files.remove(&name) {
                    push_event(
                        &mut fs.deletes,
                        &mut fs.delete_horizon_ms,
                        DeleteEvent {
                            file: Some(name),
                            album_id: None,
                            kind: DeleteKind::TrashDelete,
                            date_ms: now_ms,
                        },
                        now_ms,
                    );
                    removed.push(spec);
                }
            }
            values.insert(trash_owned.clone(), serde_json::to_vec(&fs)?);
            Ok(removed)
        })?;

        for spec in removed {
            self.unref(&spec.store_file_path)?;
            self.unref(&spec.store_thumb_path)?;
        }
        Ok(())
    }

    /// Deletes named trash entries unconditionally.
    pub fn delete_files(&self, trash_path: &str, names: &[String], now_ms: i64) -> VaultResult<()> {
        let trash_owned = trash_path.to_string();
        let names_owned = names.to_vec();
        let removed: Vec<FileSpec> = self.storage.update_many(&[TxPath::meta(&trash_owned)], |values| {
            let mut fs: FileSet = match values.get(&trash_owned) {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => FileSet::default(),
            };
            let mut removed = Vec::with_capacity(names_owned.len());
            for name in &names_owned {
                if let Some(spec) = fs.files.remove(name) {
                    push_event(
                        &mut fs.deletes,
                        &mut fs.delete_horizon_ms,
                        DeleteEvent {
                            file: Some(name.clone()),
                            album_id: None,
                            kind: DeleteKind::TrashDelete,
                            date_ms: now_ms,
                        },
                        now_ms,
                    );
                    removed.push(spec);
                }
            }
            values.insert(trash_owned.clone(), serde_json::to_vec(&fs)?);
            Ok(removed)
        })?;

        for spec in removed {
            self.unref(&spec.store_file_path)?;
            self.unref(&spec.store_thumb_path)?;
        }
        Ok(())
    }

    /// Walks every on-disk file and returns those unreachable from
    /// `users.dat` via user → home → manifest → fileset → blob traversal;
    /// `delete` removes them instead of only reporting. `master.key` is
    /// never touched. Shared albums are visited once regardless of how
    /// many members' manifests reference the same storage path, since the
    /// reachable set is a `HashSet` keyed on storage path, not a per-member
    /// walk.
    pub fn scan_orphans(&self, delete: bool) -> VaultResult<Vec<std::path::PathBuf>> {
        let mut reachable: HashSet<std::path::PathBuf> = HashSet::new();
        reachable.insert(std::path::PathBuf::from("master.key"));

        let users: crate::metadata::UserList = self.storage.read_data_file("users.dat").unwrap_or_default();
        reachable.insert(self.storage.on_disk_path("users.dat"));
        reachable.insert(self.storage.on_disk_path("quotas.dat"));
        reachable.insert(self.storage.on_disk_path("autocert-cache.dat"));
        reachable.insert(self.storage.on_disk_path("push-services.dat"));

        let mut visited_storage_paths: HashSet<String> = HashSet::new();
        for id in users.by_email.values().copied() {
            reachable.insert(self.storage.on_disk_path(&crate::metadata::user_path(id)));
            reachable.insert(self.storage.on_disk_path(&contacts_path(id)));
            let manifest_path = crate::metadata::album_manifest_path(id);
            reachable.insert(self.storage.on_disk_path(&manifest_path));

            let manifest: crate::metadata::AlbumManifest =
                self.storage.read_data_file(&manifest_path).unwrap_or_default();
            for aref in manifest.albums.values() {
                if !visited_storage_paths.insert(aref.storage_path.clone()) {
                    continue;
                }
                reachable.insert(self.storage.on_disk_path(&aref.storage_path));
                if let Ok(fs) = self.storage.read_data_file::<FileSet>(&aref.storage_path) {
                    mark_fileset_reachable(self.storage.as_ref(), &fs, &mut reachable);
                }
            }

            for set in [SetKind::Gallery, SetKind::Trash] {
                let path = crate::metadata::fileset_path(id, set);
                reachable.insert(self.storage.on_disk_path(&path));
                if let Ok(fs) = self.storage.read_data_file::<FileSet>(&path) {
                    mark_fileset_reachable(self.storage.as_ref(), &fs, &mut reachable);
                }
            }
        }

        let mut orphans = Vec::new();
        for path in self.storage.walk_all_files()? {
            let absolute = self.storage.root().join(&path);
            if path.starts_with("pending") {
                continue;
            }
            if !reachable.contains(&absolute) {
                orphans.push(path.clone());
                if delete {
                    if let Err(e) = std::fs::remove_file(&absolute) {
                        warn!("scan_orphans: failed to delete {path:?}: {e}");
                    }
                }
            }
        }
        Ok(orphans)
    }
}

fn mark_fileset_reachable(storage: &SecureStorage, fs: &FileSet, reachable: &mut HashSet<std::path::PathBuf>) {
    for spec in fs.files.values() {
        reachable.insert(storage.blob_path(&spec.store_file_path));
        reachable.insert(storage.blob_path(&ref_path(&spec.store_file_path)));
        reachable.insert(storage.blob_path(&spec.store_thumb_path));
        reachable.insert(storage.blob_path(&ref_path(&spec.store_thumb_path)));
    }
}

fn push_event(
    deletes: &mut std::collections::VecDeque<DeleteEvent>,
    horizon: &mut i64,
    event: DeleteEvent,
    now_ms: i64,
) {
    const HORIZON_MS: i64 = 180 * 24 * 60 * 60 * 1000;
    deletes.push_back(event);
    let cutoff = now_ms - HORIZON_MS;
    let mut pruned = false;
    while let Some(front) = deletes.front() {
        if front.date_ms < cutoff {
            deletes.pop_front();
            pruned = true;
        } else {
            break;
        }
    }
    if pruned {
        *horizon = cutoff;
    }
}
