//! Passphrase rotation and full master-key rotation (spec.md §4.7).
//!
//! `change_passphrase` only ever touches `master.key` — no stored object is
//! re-encrypted. `rotate_master_key` is the one-shot "re-encrypt everything
//! under a new master key" tool: every logical file is read under the old
//! key and rewritten under the new one, and every blob's wrapped per-file
//! `SubKey` header is rewrapped in place. The blob's actual chunk stream is
//! never touched — it's encrypted with the per-blob `SubKey`, which is
//! independent of the master key, so rotation is cheap even for large
//! libraries.

use crate::blob::ref_path;
use crate::error::{VaultError, VaultResult};
use crate::keyvault::MasterKey;
use crate::metadata::{
    album_manifest_path, contacts_path, fileset_path, user_path, AlbumManifest, BlobSpec, FileSet,
    SetKind, User, UserList,
};
use crate::storage::SecureStorage;
use log::info;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

const MASTER_KEY_FILE: &str = "master.key";
const NEW_MASTER_KEY_FILE: &str = "master.key.new";

/// Re-saves `master.key` under `new_passphrase`, possibly with new
/// PBKDF2 iterations/salt. No stored object is re-encrypted.
pub fn change_passphrase(root: &Path, old_passphrase: &str, new_passphrase: &str) -> VaultResult<()> {
    let master_path = root.join(MASTER_KEY_FILE);
    let mk = MasterKey::load(old_passphrase, &master_path)?;
    let tmp_path = root.join(NEW_MASTER_KEY_FILE);
    mk.save(new_passphrase, &tmp_path)?;
    fs::rename(&tmp_path, &master_path)?;
    Ok(())
}

/// Every logical path this database may hold, discovered the same way
/// [`crate::blob::BlobEngine::scan_orphans`] discovers reachability — by
/// walking `users.dat` → home → manifests/filesets/albums — except here we
/// keep the *logical* names (not on-disk paths), since the whole point of
/// rotation is that the on-disk location changes for every metadata file.
struct Inventory {
    /// Plain metadata logical paths with no master-key-wrapped secrets
    /// nested inside their JSON (re-encrypted as opaque JSON values).
    opaque: Vec<String>,
    /// Users, handled specially because `server_secret_key`/`token_key`/
    /// decoy passwords are themselves wrapped with the master key and must
    /// be unwrapped and rewrapped, not just blindly reserialized.
    user_ids: Vec<crate::metadata::UserId>,
    /// Content/thumbnail blob logical paths (literal; never renamed).
    blobs: Vec<String>,
}

fn collect_inventory(old_storage: &SecureStorage) -> VaultResult<Inventory> {
    let mut opaque = vec![
        "users.dat".to_string(),
        "quotas.dat".to_string(),
        "autocert-cache.dat".to_string(),
        "push-services.dat".to_string(),
    ];
    let mut blobs = Vec::new();
    let mut visited_albums: HashSet<String> = HashSet::new();

    let users: UserList = old_storage.read_data_file("users.dat").unwrap_or_default();
    let user_ids: Vec<_> = users.by_email.values().copied().collect();

    let mut collect_fileset = |path: &str, opaque: &mut Vec<String>, blobs: &mut Vec<String>| {
        opaque.push(path.to_string());
        if let Ok(fs) = old_storage.read_data_file::<FileSet>(path) {
            for spec in fs.files.values() {
                blobs.push(spec.store_file_path.clone());
                blobs.push(spec.store_thumb_path.clone());
            }
        }
    };

    for id in &user_ids {
        opaque.push(user_path(*id));
        opaque.push(contacts_path(*id));
        opaque.push(album_manifest_path(*id));
        collect_fileset(&fileset_path(*id, SetKind::Gallery), &mut opaque, &mut blobs);
        collect_fileset(&fileset_path(*id, SetKind::Trash), &mut opaque, &mut blobs);

        let manifest: AlbumManifest = old_storage
            .read_data_file(&album_manifest_path(*id))
            .unwrap_or_default();
        for aref in manifest.albums.values() {
            if visited_albums.insert(aref.storage_path.clone()) {
                collect_fileset(&aref.storage_path, &mut opaque, &mut blobs);
            }
        }
    }

    Ok(Inventory {
        opaque,
        user_ids,
        blobs,
    })
}

/// Rewraps the 93-byte master-key-wrapped `SubKey` header at the front of
/// a blob file, leaving its chunk stream untouched.
fn rewrap_blob_header(root: &Path, old_mk: &MasterKey, new_mk: &MasterKey, logical: &str) -> VaultResult<()> {
    use std::io::{Seek, SeekFrom};
    let path = root.join(logical);
    let mut file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
    let sub = old_mk.read_encrypted_key(&mut file)?;
    file.seek(SeekFrom::Start(0))?;
    new_mk.write_encrypted_key(&mut file, &sub)?;
    Ok(())
}

fn migrate_opaque(old_storage: &SecureStorage, new_storage: &SecureStorage, logical: &str) -> VaultResult<()> {
    match old_storage.read_data_file::<serde_json::Value>(logical) {
        Ok(value) => {
            new_storage.save_data_file(logical, &value)?;
            let old_path = old_storage.on_disk_path(logical);
            let new_path = new_storage.on_disk_path(logical);
            if old_path != new_path {
                if let Err(e) = fs::remove_file(&old_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
            Ok(())
        }
        Err(VaultError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn migrate_user(old_mk: &MasterKey, new_mk: &MasterKey, old_storage: &SecureStorage, new_storage: &SecureStorage, id: crate::metadata::UserId) -> VaultResult<()> {
    let path = user_path(id);
    let mut user: User = match old_storage.read_data_file::<User>(&path) {
        Ok(u) => u,
        Err(VaultError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    user.server_secret_key = new_mk.encrypt(&old_mk.decrypt(&user.server_secret_key)?)?;
    user.token_key = new_mk.encrypt(&old_mk.decrypt(&user.token_key)?)?;
    for decoy in &mut user.decoys {
        decoy.encrypted_password = new_mk.encrypt(&old_mk.decrypt(&decoy.encrypted_password)?)?;
    }

    new_storage.save_data_file(&path, &user)?;
    let old_path = old_storage.on_disk_path(&path);
    let new_path = new_storage.on_disk_path(&path);
    if old_path != new_path {
        if let Err(e) = fs::remove_file(&old_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn migrate_blob(root: &Path, old_mk: &MasterKey, new_mk: &MasterKey, old_storage: &SecureStorage, new_storage: &SecureStorage, logical: &str) -> VaultResult<()> {
    if root.join(logical).exists() {
        rewrap_blob_header(root, old_mk, new_mk, logical)?;
    }
    let ref_logical = ref_path(logical);
    match old_storage.read_blob_meta::<BlobSpec>(&ref_logical) {
        Ok(spec) => new_storage.save_blob_meta(&ref_logical, &spec),
        Err(VaultError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Full re-encryption under a freshly generated master key (spec.md §4.7).
/// Progress is crash-safe in the sense that old files are only removed
/// after their new-key copy has been durably written; re-running rotation
/// after an interruption re-migrates every logical path, which is always
/// safe since `migrate_*` is idempotent (it re-derives the new on-disk
/// path and overwrites it). The swap to `master.key` happens last, after
/// every other file has a new-key copy, so a crash before that point still
/// leaves the database fully readable under the *old* key.
pub fn rotate_master_key(root: &Path, old_passphrase: &str, new_passphrase: &str) -> VaultResult<()> {
    let master_path = root.join(MASTER_KEY_FILE);
    let old_mk = MasterKey::load(old_passphrase, &master_path)?;
    let old_storage = SecureStorage::open(root, Some(old_mk))?;

    let new_mk = MasterKey::generate();
    let new_key_path = root.join(NEW_MASTER_KEY_FILE);
    new_mk.save(new_passphrase, &new_key_path)?;

    let inventory = collect_inventory(&old_storage)?;

    // Re-derive both keys from disk so the migration loop below borrows
    // neither `old_storage` nor a moved `new_mk` — `SecureStorage` owns its
    // key and we still need `old_mk`/`new_mk` standalone for blob rewraps.
    let old_mk_for_blobs = MasterKey::load(old_passphrase, &master_path)?;
    let new_mk_for_blobs = MasterKey::load(new_passphrase, &new_key_path)?;
    let new_storage = SecureStorage::open(root, Some(new_mk))?;

    for logical in &inventory.opaque {
        migrate_opaque(&old_storage, &new_storage, logical)?;
    }
    for id in &inventory.user_ids {
        migrate_user(&old_mk_for_blobs, &new_mk_for_blobs, &old_storage, &new_storage, *id)?;
    }
    for blob in &inventory.blobs {
        migrate_blob(root, &old_mk_for_blobs, &new_mk_for_blobs, &old_storage, &new_storage, blob)?;
    }

    fs::rename(&new_key_path, &master_path)?;
    info!(
        "master key rotated: {} metadata files, {} users, {} blobs re-encrypted",
        inventory.opaque.len(),
        inventory.user_ids.len(),
        inventory.blobs.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataEngine, SetKind};
    use std::sync::Arc;

    #[test]
    fn change_passphrase_preserves_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let master_path = dir.path().join("master.key");
        let mk = MasterKey::generate();
        let expected = mk.use_key(|k| *k);
        mk.save("old pass", &master_path).unwrap();

        change_passphrase(dir.path(), "old pass", "new pass").unwrap();

        let reloaded = MasterKey::load("new pass", &master_path).unwrap();
        assert_eq!(reloaded.use_key(|k| *k), expected);
        assert!(MasterKey::load("old pass", &master_path).is_err());
    }

    #[test]
    fn rotate_master_key_round_trips_users_and_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let mk = MasterKey::generate();
        mk.save("old pass", &dir.path().join("master.key")).unwrap();
        let storage = Arc::new(SecureStorage::open(dir.path(), Some(mk)).unwrap());
        let meta = MetadataEngine::new(storage.clone());
        let blob_engine = crate::blob::BlobEngine::new(storage.clone());

        let owner = meta
            .add_user("a@example.com", vec![1, 2], vec![3], vec![4], vec![5], false, 0)
            .unwrap();
        let gallery_path = fileset_path(owner, SetKind::Gallery);

        {
            let mut w = storage.open_blob_write("tmp/content").unwrap();
            w.write_all(b"photo bytes").unwrap();
            w.finish().unwrap();
            let mut w = storage.open_blob_write("tmp/thumb").unwrap();
            w.write_all(b"thumb bytes").unwrap();
            w.finish().unwrap();
        }
        blob_engine
            .add_file(
                owner,
                &gallery_path,
                "file0",
                crate::blob::NewBlob {
                    content_temp: "tmp/content".into(),
                    thumb_temp: "tmp/thumb".into(),
                    content_size: 11,
                    thumb_size: 11,
                    headers: vec![9, 9],
                },
                0,
            )
            .unwrap();

        // Drop every live handle so rotation (which opens its own
        // SecureStorage instances against the same root) isn't racing a
        // lock table it doesn't share.
        drop(meta);
        drop(blob_engine);
        drop(storage);

        rotate_master_key(dir.path(), "old pass", "new pass").unwrap();

        let new_mk = MasterKey::load("new pass", &dir.path().join("master.key")).unwrap();
        let new_storage = Arc::new(SecureStorage::open(dir.path(), Some(new_mk)).unwrap());
        let new_meta = MetadataEngine::new(new_storage.clone());

        let user = new_meta.user_by_id(owner).unwrap();
        assert_eq!(user.email, "a@example.com");
        let token_key = new_meta.user_token_key(&user).unwrap();
        assert_eq!(token_key.len(), 32);

        let fs: FileSet = new_storage.read_data_file(&gallery_path).unwrap();
        let spec = &fs.files["file0"];
        let (mut reader, _start) = new_storage.open_blob_read(&spec.store_file_path).unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"photo bytes");

        assert!(MasterKey::load("old pass", &dir.path().join("master.key")).is_err());
    }
}
