//! End-to-end engine scenarios (spec.md §8) exercising KeyVault,
//! SecureStorage, MetadataEngine, and BlobEngine together the way a real
//! request handler would.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use vault_core::blob::NewBlob;
use vault_core::keyvault::MasterKey;
use vault_core::metadata::{
    fileset_path, DeleteKind, MetadataEngine, QuotaLimit, Quotas, SetKind,
};
use vault_core::storage::SecureStorage;
use vault_core::BlobEngine;

fn write_temp(storage: &SecureStorage, name: &str, content: &[u8]) {
    let mut w = storage.open_blob_write(name).unwrap();
    w.write_all(content).unwrap();
    w.finish().unwrap();
}

fn fresh() -> (tempfile::TempDir, Arc<SecureStorage>, MetadataEngine, BlobEngine) {
    let dir = tempfile::tempdir().unwrap();
    let mk = MasterKey::generate();
    let storage = Arc::new(SecureStorage::open(dir.path(), Some(mk)).unwrap());
    let meta = MetadataEngine::new(storage.clone());
    let blob = BlobEngine::new(storage.clone());
    (dir, storage, meta, blob)
}

/// Scenario 1: quota-blocked upload leaves no trace.
#[test]
fn quota_blocked_upload_leaves_no_trace() {
    let (_dir, storage, meta, blob) = fresh();
    let owner = meta
        .add_user("a@example.com", vec![], vec![], vec![], vec![], false, 0)
        .unwrap();
    storage
        .save_data_file(
            "quotas.dat",
            &Quotas {
                limits: HashMap::from([(owner, QuotaLimit { value: 1, unit: "m".into() })]),
                default_limit: 100,
                default_limit_unit: "t".into(),
            },
        )
        .unwrap();

    write_temp(&storage, "tmp/big-content", &vec![0u8; 2 * 1024 * 1024]);
    write_temp(&storage, "tmp/big-thumb", &vec![0u8; 1]);

    let gallery = fileset_path(owner, SetKind::Gallery);
    let before = meta.space_used(owner).unwrap();
    let result = blob.add_file(
        owner,
        &gallery,
        "too-big.jpg",
        NewBlob {
            content_temp: "tmp/big-content".into(),
            thumb_temp: "tmp/big-thumb".into(),
            content_size: 2 * 1024 * 1024,
            thumb_size: 1,
            headers: vec![],
        },
        0,
    );

    assert!(matches!(result, Err(vault_core::VaultError::QuotaExceeded)));
    assert!(storage.blob_size("tmp/big-content").is_err());
    assert!(storage.blob_size("tmp/big-thumb").is_err());
    assert_eq!(meta.space_used(owner).unwrap(), before);

    let blobs_dir = storage.root().join("blobs");
    let has_any_blob = walkdir(&blobs_dir);
    assert!(!has_any_blob, "no blob should have landed under blobs/");
}

fn walkdir(dir: &std::path::Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if walkdir(&path) {
                return true;
            }
        } else if !path.to_string_lossy().ends_with(".ref") {
            // tmp/big-content and tmp/big-thumb were never renamed under blobs/
            if path.to_string_lossy().contains("blobs") {
                return true;
            }
        }
    }
    false
}

/// Scenario 2: move-to-trash then empty removes the underlying blobs.
#[test]
fn move_to_trash_then_empty_removes_blobs() {
    let (_dir, storage, meta, blob) = fresh();
    let owner = meta
        .add_user("a@example.com", vec![], vec![], vec![], vec![], false, 0)
        .unwrap();
    let gallery = fileset_path(owner, SetKind::Gallery);
    let trash = fileset_path(owner, SetKind::Trash);

    let mut blob_paths = Vec::new();
    for i in 0..10 {
        write_temp(&storage, &format!("tmp/c{i}"), format!("content-{i}").as_bytes());
        write_temp(&storage, &format!("tmp/t{i}"), format!("thumb-{i}").as_bytes());
        blob.add_file(
            owner,
            &gallery,
            &format!("file{i}.jpg"),
            NewBlob {
                content_temp: format!("tmp/c{i}"),
                thumb_temp: format!("tmp/t{i}"),
                content_size: 9,
                thumb_size: 7,
                headers: vec![],
            },
            0,
        )
        .unwrap();
    }
    let fs = meta.gallery(owner).unwrap();
    for i in 1..=4 {
        blob_paths.push(fs.files[&format!("file{i}.jpg")].store_file_path.clone());
    }

    for i in 1..=4 {
        blob.move_file(&gallery, &trash, &format!("file{i}.jpg"), None, true, DeleteKind::Gallery, 5)
            .unwrap();
    }
    assert_eq!(meta.gallery(owner).unwrap().files.len(), 6);
    assert_eq!(meta.trash(owner).unwrap().files.len(), 4);

    blob.delete_files(&trash, &["file1.jpg".to_string(), "file2.jpg".to_string()], 6)
        .unwrap();
    assert_eq!(meta.trash(owner).unwrap().files.len(), 2);

    blob.empty_trash(&trash, 100, 7).unwrap();
    assert!(meta.trash(owner).unwrap().files.is_empty());

    for path in &blob_paths {
        assert!(storage.blob_size(path).is_err(), "blob {path} should be gone");
        let ref_result: Result<vault_core::metadata::BlobSpec, _> =
            storage.read_blob_meta(&format!("{path}.ref"));
        assert!(ref_result.is_err(), ".ref sidecar for {path} should be gone");
    }
}

/// Scenario 3: Alice shares an album with Bob; Bob sees the same 4 files
/// and his sharing key, not Alice's owner key.
#[test]
fn share_album_grants_bob_matching_access() {
    let (_dir, storage, meta, blob) = fresh();
    let alice = meta
        .add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 0)
        .unwrap();
    let bob = meta
        .add_user("bob@example.com", vec![], vec![], vec![], vec![], false, 0)
        .unwrap();

    let album_id = meta
        .add_album(alice, b"alice-private".to_vec(), b"album-pub".to_vec(), vec![], 0)
        .unwrap();
    let manifest = storage
        .read_data_file::<vault_core::metadata::AlbumManifest>(&vault_core::metadata::album_manifest_path(alice))
        .unwrap();
    let storage_path = manifest.albums[&album_id].storage_path.clone();

    for i in 0..4 {
        write_temp(&storage, &format!("tmp/ac{i}"), format!("c{i}").as_bytes());
        write_temp(&storage, &format!("tmp/at{i}"), format!("t{i}").as_bytes());
        blob.add_file(
            alice,
            &storage_path,
            &format!("pic{i}.jpg"),
            NewBlob {
                content_temp: format!("tmp/ac{i}"),
                thumb_temp: format!("tmp/at{i}"),
                content_size: 2,
                thumb_size: 2,
                headers: vec![],
            },
            0,
        )
        .unwrap();
    }

    let sharing_keys = HashMap::from([(bob, b"bobs-wrapped-key".to_vec())]);
    meta.share_album(alice, album_id, &storage_path, &[bob], sharing_keys, 10)
        .unwrap();

    let bob_updates = meta.album_updates(bob, 0).unwrap();
    assert_eq!(bob_updates.len(), 1);
    assert!(!bob_updates[0].is_owner);
    assert_eq!(bob_updates[0].enc_private_key, b"bobs-wrapped-key");

    let bob_fileset = meta.fileset(&bob_updates[0].storage_path).unwrap();
    assert_eq!(bob_fileset.files.len(), 4);
    assert_eq!(bob_fileset.files.keys().collect::<std::collections::HashSet<_>>().len(), 4);
}

/// Scenario 4: deleting Alice cascades a Contact event and an Album event
/// to Bob.
#[test]
fn delete_user_cascades_to_peer() {
    let (_dir, storage, meta, _blob) = fresh();
    let alice = meta
        .add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 0)
        .unwrap();
    let bob = meta
        .add_user("bob@example.com", vec![], vec![], vec![], vec![], false, 0)
        .unwrap();
    meta.add_contact(alice, bob, 1).unwrap();

    let album_id = meta
        .add_album(alice, b"k".to_vec(), b"p".to_vec(), vec![], 2)
        .unwrap();
    let manifest = storage
        .read_data_file::<vault_core::metadata::AlbumManifest>(&vault_core::metadata::album_manifest_path(alice))
        .unwrap();
    let storage_path = manifest.albums[&album_id].storage_path.clone();
    meta.share_album(alice, album_id, &storage_path, &[bob], HashMap::from([(bob, vec![1u8])]), 3)
        .unwrap();

    meta.delete_user(alice, 4).unwrap();

    let events = meta.delete_updates(bob, 0).unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == DeleteKind::Contact && e.file == Some(alice.to_string()))
            .count(),
        1
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == DeleteKind::Album && e.album_id == Some(album_id))
            .count(),
        1
    );
}

/// Scenario 5: master-key rotation re-encrypts every blob and metadata
/// file such that a fresh instance under the new passphrase reads
/// everything back verbatim.
#[test]
fn master_key_rotation_preserves_every_blob_and_user() {
    let dir = tempfile::tempdir().unwrap();
    let mk = MasterKey::generate();
    mk.save("old passphrase", &dir.path().join("master.key")).unwrap();

    let storage = Arc::new(SecureStorage::open(dir.path(), Some(mk)).unwrap());
    let meta = MetadataEngine::new(storage.clone());
    let blob = BlobEngine::new(storage.clone());

    let mut owners = Vec::new();
    for n in 0..5 {
        let owner = meta
            .add_user(&format!("user{n}@example.com"), vec![], vec![], vec![], vec![], false, 0)
            .unwrap();
        let gallery = fileset_path(owner, SetKind::Gallery);
        for i in 0..4 {
            write_temp(&storage, &format!("tmp/{n}-{i}-c"), format!("content-{n}-{i}").as_bytes());
            write_temp(&storage, &format!("tmp/{n}-{i}-t"), format!("thumb-{n}-{i}").as_bytes());
            blob.add_file(
                owner,
                &gallery,
                &format!("file{i}.jpg"),
                NewBlob {
                    content_temp: format!("tmp/{n}-{i}-c"),
                    thumb_temp: format!("tmp/{n}-{i}-t"),
                    content_size: 12,
                    thumb_size: 10,
                    headers: vec![n as u8],
                },
                0,
            )
            .unwrap();
        }
        owners.push(owner);
    }

    drop(blob);
    drop(meta);
    drop(storage);

    vault_core::admin::rotate_master_key(dir.path(), "old passphrase", "new passphrase").unwrap();
    assert!(MasterKey::load("old passphrase", &dir.path().join("master.key")).is_err());

    let new_mk = MasterKey::load("new passphrase", &dir.path().join("master.key")).unwrap();
    let new_storage = Arc::new(SecureStorage::open(dir.path(), Some(new_mk)).unwrap());
    let new_meta = MetadataEngine::new(new_storage.clone());

    for (n, owner) in owners.iter().enumerate() {
        let user = new_meta.user_by_id(*owner).unwrap();
        assert_eq!(user.email, format!("user{n}@example.com"));
        let fs = new_meta.gallery(*owner).unwrap();
        assert_eq!(fs.files.len(), 4);
        for (name, spec) in &fs.files {
            let (mut reader, _start) = new_storage.open_blob_read(&spec.store_file_path).unwrap();
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert!(out.starts_with(b"content-"), "blob for {name} decrypts under the new key");
        }
    }
}
