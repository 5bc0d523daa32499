//! Typed accessors for users, contacts, albums, filesets, quotas, and
//! delete-event journals; enforces the cross-entity invariants that make
//! every engine mutation atomic (spec.md §3, §4.4).

use crate::error::{VaultError, VaultResult};
use crate::keyvault::sealed_box;
use crate::storage::{SecureStorage, TxPath};
use log::warn;
use rand::{rngs::OsRng, Rng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub type UserId = i64;

const DELETE_HORIZON_MS: i64 = 180 * 24 * 60 * 60 * 1000;
const MIN_USER_ID: i64 = 1_000_000;
const MAX_USER_ID: i64 = 1 << 31;
const FILESET_CACHE_CAPACITY: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetKind {
    Gallery,
    Trash,
    Album,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "PascalCase")]
pub enum DeleteKind {
    Gallery,
    Trash,
    TrashDelete,
    Album,
    AlbumFile,
    Contact,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeleteEvent {
    pub file: Option<String>,
    pub album_id: Option<i64>,
    pub kind: DeleteKind,
    pub date_ms: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Decoy {
    pub user_id: UserId,
    pub encrypted_password: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct User {
    pub user_id: UserId,
    pub email: String,
    pub hashed_password: Vec<u8>,
    pub salt: Vec<u8>,
    pub key_bundle: Vec<u8>,
    pub is_backup_flag: bool,
    /// MasterKey-wrapped X25519 secret.
    pub server_secret_key: Vec<u8>,
    pub server_public_key: Vec<u8>,
    pub public_key: Vec<u8>,
    /// MasterKey-wrapped 32-byte session token key.
    pub token_key: Vec<u8>,
    pub valid_tokens: HashSet<String>,
    pub otp_key: Option<Vec<u8>>,
    pub decoys: Vec<Decoy>,
    pub date_created: i64,
    pub date_modified: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserList {
    pub by_email: HashMap<String, UserId>,
    pub admin_id: Option<UserId>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AlbumRef {
    pub album_id: i64,
    pub storage_path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AlbumManifest {
    pub albums: HashMap<i64, AlbumRef>,
    pub deletes: VecDeque<DeleteEvent>,
    pub delete_horizon_ms: i64,
}

/// 4-character permission bitmap. Bit order (documented here since the
/// original wire layout is opaque to this engine): share, upload, delete,
/// manage.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Permissions(pub String);

impl Permissions {
    pub fn none() -> Self {
        Permissions("0000".to_string())
    }

    fn bit(&self, idx: usize) -> bool {
        self.0.as_bytes().get(idx).map(|b| *b == b'1').unwrap_or(false)
    }

    pub fn allow_share(&self) -> bool {
        self.bit(0)
    }

    pub fn allow_upload(&self) -> bool {
        self.bit(1)
    }

    pub fn allow_delete(&self) -> bool {
        self.bit(2)
    }

    pub fn allow_manage(&self) -> bool {
        self.bit(3)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AlbumSpec {
    pub owner_id: UserId,
    pub album_id: i64,
    pub date_created: i64,
    pub date_modified: i64,
    pub enc_private_key: Vec<u8>,
    pub metadata: Vec<u8>,
    pub public_key: Vec<u8>,
    pub is_shared: bool,
    pub is_hidden: bool,
    pub is_locked: bool,
    pub permissions: Permissions,
    pub cover: Option<String>,
    pub members: HashSet<UserId>,
    pub sharing_keys: HashMap<UserId, Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileSpec {
    pub headers: Vec<u8>,
    pub date_created: i64,
    pub date_modified: i64,
    pub version: i64,
    pub store_file_path: String,
    pub store_file_size: u64,
    pub store_thumb_path: String,
    pub store_thumb_size: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FileSet {
    pub album: Option<AlbumSpec>,
    pub files: HashMap<String, FileSpec>,
    pub deletes: VecDeque<DeleteEvent>,
    pub delete_horizon_ms: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BlobSpec {
    pub ref_count: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Contact {
    pub user_id: UserId,
    pub email: String,
    pub public_key: Vec<u8>,
    pub date_added: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ContactList {
    pub contacts: HashMap<UserId, Contact>,
    /// Back-pointer set: every user who has added *this* account as a
    /// contact. Lets `RenameUser` find exactly which owners' lists need
    /// their `Contact.email` rewritten without scanning every account.
    #[serde(rename = "in")]
    pub in_: HashSet<UserId>,
    pub deletes: VecDeque<DeleteEvent>,
    pub delete_horizon_ms: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QuotaLimit {
    pub value: u64,
    pub unit: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Quotas {
    pub limits: HashMap<UserId, QuotaLimit>,
    pub default_limit: u64,
    pub default_limit_unit: String,
}

/// Base-1024 unit normalization per spec.md §3; an unknown unit is bytes.
pub fn normalize_quota(value: u64, unit: &str) -> u64 {
    let shift = match unit {
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        _ => 0,
    };
    value << shift
}

/// A single registered push-notification endpoint. Dispatch itself is out
/// of scope (spec.md §1); this is just the typed shape of the config slot
/// admins read and write through `AdminData`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PushServiceConfig {
    pub name: String,
    pub endpoint: String,
    pub shared_secret: Vec<u8>,
}

/// The server-wide admin tuple (spec.md §6 `AdminData`): the registered
/// push endpoints backing `push-services.dat`, read and written under
/// optimistic concurrency via a SHA-1 tag of its marshalled bytes rather
/// than a lock, since admin edits are rare and racing writers should see
/// `Outdated` instead of silently clobbering each other.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AdminData {
    pub push_services: Vec<PushServiceConfig>,
}

const ADMIN_DATA_PATH: &str = "push-services.dat";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AlbumUpdate {
    pub album_id: i64,
    pub storage_path: String,
    pub is_owner: bool,
    pub enc_private_key: Vec<u8>,
    pub date_modified: i64,
}

fn json_of<T: DeserializeOwned>(values: &HashMap<String, Vec<u8>>, key: &str) -> VaultResult<Option<T>> {
    match values.get(key) {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        None => Ok(None),
    }
}

fn json_or_default<T: DeserializeOwned + Default>(values: &HashMap<String, Vec<u8>>, key: &str) -> VaultResult<T> {
    Ok(json_of(values, key)?.unwrap_or_default())
}

fn put_json<T: Serialize>(values: &mut HashMap<String, Vec<u8>>, key: &str, value: &T) -> VaultResult<()> {
    values.insert(key.to_string(), serde_json::to_vec(value)?);
    Ok(())
}

fn prune_delete_events(deletes: &mut VecDeque<DeleteEvent>, horizon: &mut i64, now_ms: i64) {
    let cutoff = now_ms - DELETE_HORIZON_MS;
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

fn push_delete_event(deletes: &mut VecDeque<DeleteEvent>, horizon: &mut i64, event: DeleteEvent, now_ms: i64) {
    deletes.push_back(event);
    prune_delete_events(deletes, horizon, now_ms);
}

pub fn user_path(id: UserId) -> String {
    format!("home/{id}/user.dat")
}

pub fn contacts_path(id: UserId) -> String {
    format!("home/{id}/contact-list.dat")
}

pub fn album_manifest_path(id: UserId) -> String {
    format!("home/{id}/album-manifest")
}

pub fn fileset_path(id: UserId, set: SetKind) -> String {
    match set {
        SetKind::Gallery => format!("home/{id}/fileset-0"),
        SetKind::Trash => format!("home/{id}/fileset-1"),
        SetKind::Album => panic!("album filesets are addressed by AlbumRef.storage_path, not by user/set"),
    }
}

fn random_album_storage_path() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("albums/{}", hex::encode(bytes))
}

struct FileSetCacheInner {
    map: HashMap<(PathBuf, i64), FileSet>,
    order: VecDeque<(PathBuf, i64)>,
    capacity: usize,
}

/// FileSet cache keyed by `(on_disk_path, mtime_ns)` so a writer's commit
/// rename (which always advances mtime) makes stale entries unreachable
/// without any explicit invalidation (spec.md §4.4, §5).
struct FileSetCache {
    inner: Mutex<FileSetCacheInner>,
}

impl FileSetCache {
    fn new() -> Self {
        FileSetCache {
            inner: Mutex::new(FileSetCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity: FILESET_CACHE_CAPACITY,
            }),
        }
    }

    fn get(&self, key: &(PathBuf, i64)) -> Option<FileSet> {
        let inner = self.inner.lock().expect("fileset cache poisoned");
        inner.map.get(key).cloned()
    }

    fn insert(&self, key: (PathBuf, i64), value: FileSet) {
        let mut inner = self.inner.lock().expect("fileset cache poisoned");
        if !inner.map.contains_key(&key) {
            inner.order.push_back(key.clone());
        }
        inner.map.insert(key.clone(), value);
        while inner.order.len() > inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
    }
}

pub struct MetadataEngine {
    storage: Arc<SecureStorage>,
    fileset_cache: FileSetCache,
}

impl MetadataEngine {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        MetadataEngine {
            storage,
            fileset_cache: FileSetCache::new(),
        }
    }

    pub fn storage(&self) -> &Arc<SecureStorage> {
        &self.storage
    }

    fn wrap_secret(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        match self.storage.master_key() {
            Some(mk) => mk.encrypt(plaintext),
            None => Ok(plaintext.to_vec()),
        }
    }

    fn unwrap_secret(&self, wrapped: &[u8]) -> VaultResult<Vec<u8>> {
        match self.storage.master_key() {
            Some(mk) => mk.decrypt(wrapped),
            None => Ok(wrapped.to_vec()),
        }
    }

    /// Unwraps a user's server-side X25519 secret for use with
    /// [`crate::keyvault::sealed_box`].
    pub fn user_server_secret_key(&self, user: &User) -> VaultResult<Vec<u8>> {
        self.unwrap_secret(&user.server_secret_key)
    }

    /// Unwraps a user's session token key for use with
    /// [`crate::token::TokenMint`].
    pub fn user_token_key(&self, user: &User) -> VaultResult<[u8; 32]> {
        let bytes = self.unwrap_secret(&user.token_key)?;
        bytes
            .try_into()
            .map_err(|_| VaultError::Internal("token key length mismatch".into()))
    }

    /// Allocates a random id in `[10^6, 2^31)`, generates the server
    /// keypair and token key, creates the user's home files, and inserts
    /// the email mapping — all as one transaction over the new (and
    /// therefore uncontended) home paths plus `users.dat`.
    pub fn add_user(
        &self,
        email: &str,
        hashed_password: Vec<u8>,
        salt: Vec<u8>,
        key_bundle: Vec<u8>,
        public_key: Vec<u8>,
        is_backup_flag: bool,
        now_ms: i64,
    ) -> VaultResult<UserId> {
        let existing: UserList = self.storage.read_data_file("users.dat").unwrap_or_default();
        if existing.by_email.contains_key(email) {
            return Err(VaultError::AlreadyExists(email.to_string()));
        }
        let mut id = OsRng.gen_range(MIN_USER_ID..MAX_USER_ID);
        while existing.by_email.values().any(|v| *v == id) {
            id = OsRng.gen_range(MIN_USER_ID..MAX_USER_ID);
        }

        let (server_secret, server_public) = sealed_box::generate_keypair();
        let server_secret_key = self.wrap_secret(server_secret.to_bytes().as_slice())?;
        let mut token_key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut token_key_bytes);
        let token_key = self.wrap_secret(&token_key_bytes)?;

        let user = User {
            user_id: id,
            email: email.to_string(),
            hashed_password,
            salt,
            key_bundle,
            is_backup_flag,
            server_secret_key,
            server_public_key: server_public.as_bytes().to_vec(),
            public_key,
            token_key,
            valid_tokens: HashSet::new(),
            otp_key: None,
            decoys: Vec::new(),
            date_created: now_ms,
            date_modified: now_ms,
        };

        let email_owned = email.to_string();
        self.storage.update_many(&[TxPath::meta("users.dat")], |values| {
            let mut list: UserList = json_or_default(values, "users.dat")?;
            if list.by_email.contains_key(&email_owned) {
                return Err(VaultError::AlreadyExists(email_owned.clone()));
            }
            let is_admin = list.by_email.is_empty();
            if is_admin {
                list.admin_id = Some(id);
            }
            list.by_email.insert(email_owned.clone(), id);
            put_json(values, "users.dat", &list)
        })?;

        // The home paths are brand new under a freshly reserved id, so no
        // other transaction can be racing us for them.
        self.storage.save_data_file(&user_path(id), &user)?;
        self.storage.create_empty_file(&contacts_path(id), &ContactList::default())?;
        self.storage.create_empty_file(&album_manifest_path(id), &AlbumManifest::default())?;
        self.storage.create_empty_file(&fileset_path(id, SetKind::Gallery), &FileSet::default())?;
        self.storage.create_empty_file(&fileset_path(id, SetKind::Trash), &FileSet::default())?;
        Ok(id)
    }

    pub fn user(&self, email: &str) -> VaultResult<User> {
        let list: UserList = self.storage.read_data_file("users.dat")?;
        let id = list
            .by_email
            .get(email)
            .ok_or_else(|| VaultError::NotFound(email.to_string()))?;
        self.user_by_id(*id)
    }

    pub fn user_by_id(&self, id: UserId) -> VaultResult<User> {
        self.storage.read_data_file(&user_path(id))
    }

    pub fn update_user<F>(&self, id: UserId, f: F) -> VaultResult<User>
    where
        F: FnOnce(&mut User) -> VaultResult<()>,
    {
        let key = user_path(id);
        self.storage.update_many(&[TxPath::meta(&key)], |values| {
            let mut user: User = json_of(values, &key)?.ok_or_else(|| VaultError::NotFound(key.clone()))?;
            f(&mut user)?;
            put_json(values, &key, &user)?;
            Ok(user)
        })
    }

    /// Rewrites `id`'s email, rejecting duplicates, and atomically
    /// rewrites every contact-list entry that names it (found via its own
    /// `ContactList.in` back-pointer set).
    pub fn rename_user(&self, id: UserId, new_email: &str, now_ms: i64) -> VaultResult<()> {
        let back_refs: ContactList = self.storage.read_data_file(&contacts_path(id)).unwrap_or_default();
        let user_key = user_path(id);
        let mut path_names = vec!["users.dat".to_string(), user_key.clone()];
        for owner in &back_refs.in_ {
            path_names.push(contacts_path(*owner));
        }
        let paths: Vec<TxPath> = path_names.iter().map(|p| TxPath::meta(p)).collect();
        let new_email_owned = new_email.to_string();

        self.storage.update_many(&paths, |values| {
            let mut list: UserList = json_or_default(values, "users.dat")?;
            if list.by_email.contains_key(&new_email_owned) {
                return Err(VaultError::AlreadyExists(new_email_owned.clone()));
            }
            let mut user: User = json_of(values, &user_key)?.ok_or_else(|| VaultError::NotFound(user_key.clone()))?;
            list.by_email.remove(&user.email);
            list.by_email.insert(new_email_owned.clone(), id);
            user.email = new_email_owned.clone();
            user.date_modified = now_ms;
            put_json(values, "users.dat", &list)?;
            put_json(values, &user_key, &user)?;

            for owner in &back_refs.in_ {
                let key = contacts_path(*owner);
                if let Some(mut cl) = json_of::<ContactList>(values, &key)? {
                    if let Some(contact) = cl.contacts.get_mut(&id) {
                        contact.email = new_email_owned.clone();
                    }
                    put_json(values, &key, &cl)?;
                }
            }
            Ok(())
        })
    }

    /// Cascading account teardown. Not a single cross-cutting transaction
    /// (the set of albums and contacts touched is only discovered mid-walk)
    /// but every individual step is itself transactional, and ref-count
    /// decrements always commit together with the FileSet mutation that
    /// drops the last reference.
    pub fn delete_user(&self, id: UserId, now_ms: i64) -> VaultResult<()> {
        let contacts: ContactList = self.storage.read_data_file(&contacts_path(id)).unwrap_or_default();
        for peer_id in contacts.contacts.keys().copied().collect::<Vec<_>>() {
            let key = contacts_path(peer_id);
            let result = self.storage.update_many(&[TxPath::meta(&key)], |values| {
                let mut cl: ContactList = json_or_default(values, &key)?;
                cl.contacts.remove(&id);
                cl.in_.remove(&id);
                push_delete_event(
                    &mut cl.deletes,
                    &mut cl.delete_horizon_ms,
                    DeleteEvent {
                        file: Some(id.to_string()),
                        album_id: None,
                        kind: DeleteKind::Contact,
                        date_ms: now_ms,
                    },
                    now_ms,
                );
                put_json(values, &key, &cl)
            });
            if let Err(e) = result {
                warn!("delete_user({id}): failed to unlink contact {peer_id}: {e}");
            }
        }

        let manifest: AlbumManifest = self.storage.read_data_file(&album_manifest_path(id)).unwrap_or_default();
        for (album_id, album_ref) in manifest.albums.clone() {
            let is_owner = self
                .storage
                .read_data_file::<FileSet>(&album_ref.storage_path)
                .ok()
                .and_then(|fs| fs.album.map(|a| a.owner_id == id))
                .unwrap_or(false);
            let result = if is_owner {
                self.delete_album(id, album_id, &album_ref.storage_path, now_ms)
            } else {
                self.remove_album_member(id, album_id, &album_ref.storage_path, id, now_ms)
            };
            if let Err(e) = result {
                warn!("delete_user({id}): failed to unwind album {album_id}: {e}");
            }
        }

        for set in [SetKind::Gallery, SetKind::Trash] {
            let path = fileset_path(id, set);
            if let Ok(fs) = self.storage.read_data_file::<FileSet>(&path) {
                for spec in fs.files.values() {
                    let _ = crate::blob::BlobEngine::new(self.storage.clone()).unref(&spec.store_file_path);
                    let _ = crate::blob::BlobEngine::new(self.storage.clone()).unref(&spec.store_thumb_path);
                }
            }
        }

        let email = self.storage.read_data_file::<User>(&user_path(id)).ok().map(|u| u.email);
        self.storage.update_many(&[TxPath::meta("users.dat")], |values| {
            let mut list: UserList = json_or_default(values, "users.dat")?;
            if let Some(email) = &email {
                list.by_email.remove(email);
            }
            put_json(values, "users.dat", &list)
        })?;

        for path in [
            user_path(id),
            contacts_path(id),
            album_manifest_path(id),
            fileset_path(id, SetKind::Gallery),
            fileset_path(id, SetKind::Trash),
        ] {
            self.storage.update_many(&[TxPath::meta(&path)], |values| {
                values.remove(&path);
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn add_album(
        &self,
        owner: UserId,
        enc_private_key: Vec<u8>,
        public_key: Vec<u8>,
        metadata: Vec<u8>,
        now_ms: i64,
    ) -> VaultResult<i64> {
        let album_id = OsRng.gen_range(1i64..i64::MAX);
        let storage_path = random_album_storage_path();
        let album = AlbumSpec {
            owner_id: owner,
            album_id,
            date_created: now_ms,
            date_modified: now_ms,
            enc_private_key,
            metadata,
            public_key,
            is_shared: false,
            is_hidden: false,
            is_locked: false,
            permissions: Permissions::none(),
            cover: None,
            members: HashSet::from([owner]),
            sharing_keys: HashMap::new(),
        };
        let fileset = FileSet {
            album: Some(album),
            files: HashMap::new(),
            deletes: VecDeque::new(),
            delete_horizon_ms: 0,
        };

        let manifest_key = album_manifest_path(owner);
        self.storage.update_many(
            &[TxPath::meta(&manifest_key), TxPath::meta(&storage_path)],
            |values| {
                let mut manifest: AlbumManifest = json_or_default(values, &manifest_key)?;
                manifest.albums.insert(
                    album_id,
                    AlbumRef {
                        album_id,
                        storage_path: storage_path.clone(),
                    },
                );
                put_json(values, &manifest_key, &manifest)?;
                put_json(values, &storage_path, &fileset)?;
                Ok(())
            },
        )?;
        Ok(album_id)
    }

    fn with_album<F, R>(&self, owner: UserId, album_id: i64, storage_path: &str, now_ms: i64, f: F) -> VaultResult<R>
    where
        F: FnOnce(&mut AlbumSpec) -> VaultResult<R>,
    {
        let storage_path = storage_path.to_string();
        self.storage.update_many(&[TxPath::meta(&storage_path)], |values| {
            let mut fs: FileSet = json_of(values, &storage_path)?.ok_or_else(|| VaultError::NotFound(storage_path.clone()))?;
            let album = fs.album.as_mut().ok_or_else(|| VaultError::Invalid("not an album".into()))?;
            if album.owner_id != owner && !album.members.contains(&owner) {
                return Err(VaultError::Invalid("not a member of this album".into()));
            }
            if album.album_id != album_id {
                return Err(VaultError::Invalid("album id mismatch".into()));
            }
            let result = f(album)?;
            album.date_modified = now_ms;
            put_json(values, &storage_path, &fs)?;
            Ok(result)
        })
    }

    pub fn change_album_cover(&self, owner: UserId, album_id: i64, storage_path: &str, cover: Option<String>, now_ms: i64) -> VaultResult<()> {
        self.with_album(owner, album_id, storage_path, now_ms, |album| {
            album.cover = cover;
            Ok(())
        })
    }

    pub fn change_metadata(&self, owner: UserId, album_id: i64, storage_path: &str, metadata: Vec<u8>, now_ms: i64) -> VaultResult<()> {
        self.with_album(owner, album_id, storage_path, now_ms, |album| {
            album.metadata = metadata;
            Ok(())
        })
    }

    pub fn update_perms(&self, owner: UserId, album_id: i64, storage_path: &str, permissions: Permissions, now_ms: i64) -> VaultResult<()> {
        self.with_album(owner, album_id, storage_path, now_ms, |album| {
            if album.owner_id != owner {
                return Err(VaultError::Invalid("only the owner may change permissions".into()));
            }
            album.permissions = permissions;
            Ok(())
        })
    }

    /// Owner may set `is_shared`/`is_hidden`/`is_locked`/`permissions`; a
    /// non-owner may only add members, and only if the album is already
    /// shared, they're a member, and `permissions.allow_share()`.
    pub fn share_album(
        &self,
        user: UserId,
        album_id: i64,
        storage_path: &str,
        new_members: &[UserId],
        sharing_keys: HashMap<UserId, Vec<u8>>,
        now_ms: i64,
    ) -> VaultResult<()> {
        let storage_path_owned = storage_path.to_string();
        let (owner, added): (UserId, Vec<UserId>) = self.storage.update_many(&[TxPath::meta(&storage_path_owned)], |values| {
            let mut fs: FileSet = json_of(values, &storage_path_owned)?.ok_or_else(|| VaultError::NotFound(storage_path_owned.clone()))?;
            let album = fs.album.as_mut().ok_or_else(|| VaultError::Invalid("not an album".into()))?;
            let is_owner = album.owner_id == user;
            if !is_owner {
                if !(album.is_shared && album.members.contains(&user) && album.permissions.allow_share()) {
                    return Err(VaultError::Invalid("not permitted to share this album".into()));
                }
            } else {
                album.is_shared = true;
            }
            let mut added = Vec::new();
            for member in new_members {
                if album.members.insert(*member) {
                    added.push(*member);
                }
                if let Some(key) = sharing_keys.get(member) {
                    album.sharing_keys.insert(*member, key.clone());
                }
            }
            album.date_modified = now_ms;
            let owner = album.owner_id;
            put_json(values, &storage_path_owned, &fs)?;
            Ok((owner, added))
        })?;

        for member in &added {
            let manifest_key = album_manifest_path(*member);
            let result = self.storage.update_many(&[TxPath::meta(&manifest_key)], |values| {
                let mut manifest: AlbumManifest = json_or_default(values, &manifest_key)?;
                manifest.albums.insert(
                    album_id,
                    AlbumRef {
                        album_id,
                        storage_path: storage_path.to_string(),
                    },
                );
                put_json(values, &manifest_key, &manifest)
            });
            if let Err(e) = result {
                warn!("share_album({album_id}): failed to add manifest ref for {member}: {e}");
            }
            let _ = self.add_contact_pair(owner, *member, now_ms);
        }
        Ok(())
    }

    /// Owner-only. Drops every non-owner member's manifest reference and
    /// clears sharing state.
    pub fn unshare_album(&self, owner: UserId, album_id: i64, storage_path: &str, now_ms: i64) -> VaultResult<()> {
        let storage_path_owned = storage_path.to_string();
        let removed: Vec<UserId> = self.storage.update_many(&[TxPath::meta(&storage_path_owned)], |values| {
            let mut fs: FileSet = json_of(values, &storage_path_owned)?.ok_or_else(|| VaultError::NotFound(storage_path_owned.clone()))?;
            let album = fs.album.as_mut().ok_or_else(|| VaultError::Invalid("not an album".into()))?;
            if album.owner_id != owner {
                return Err(VaultError::Invalid("only the owner may unshare".into()));
            }
            let removed: Vec<UserId> = album.members.iter().copied().filter(|m| *m != owner).collect();
            album.members.retain(|m| *m == owner);
            album.sharing_keys.clear();
            album.is_shared = false;
            album.date_modified = now_ms;
            put_json(values, &storage_path_owned, &fs)?;
            Ok(removed)
        })?;

        for member in removed {
            let manifest_key = album_manifest_path(member);
            let result = self.storage.update_many(&[TxPath::meta(&manifest_key)], |values| {
                let mut manifest: AlbumManifest = json_or_default(values, &manifest_key)?;
                manifest.albums.remove(&album_id);
                push_delete_event(
                    &mut manifest.deletes,
                    &mut manifest.delete_horizon_ms,
                    DeleteEvent {
                        file: None,
                        album_id: Some(album_id),
                        kind: DeleteKind::Album,
                        date_ms: now_ms,
                    },
                    now_ms,
                );
                put_json(values, &manifest_key, &manifest)
            });
            if let Err(e) = result {
                warn!("unshare_album({album_id}): failed to drop manifest ref for {member}: {e}");
            }
        }
        Ok(())
    }

    /// The owner can never be removed; removing oneself is how a member
    /// leaves a shared album.
    pub fn remove_album_member(&self, actor: UserId, album_id: i64, storage_path: &str, member: UserId, now_ms: i64) -> VaultResult<()> {
        let storage_path_owned = storage_path.to_string();
        self.storage.update_many(&[TxPath::meta(&storage_path_owned)], |values| {
            let mut fs: FileSet = json_of(values, &storage_path_owned)?.ok_or_else(|| VaultError::NotFound(storage_path_owned.clone()))?;
            let album = fs.album.as_mut().ok_or_else(|| VaultError::Invalid("not an album".into()))?;
            if album.owner_id == member {
                return Err(VaultError::Invalid("the owner cannot be removed from an album".into()));
            }
            if actor != album.owner_id && actor != member {
                return Err(VaultError::Invalid("not permitted to remove this member".into()));
            }
            album.members.remove(&member);
            album.sharing_keys.remove(&member);
            album.date_modified = now_ms;
            put_json(values, &storage_path_owned, &fs)
        })?;

        let manifest_key = album_manifest_path(member);
        self.storage.update_many(&[TxPath::meta(&manifest_key)], |values| {
            let mut manifest: AlbumManifest = json_or_default(values, &manifest_key)?;
            manifest.albums.remove(&album_id);
            push_delete_event(
                &mut manifest.deletes,
                &mut manifest.delete_horizon_ms,
                DeleteEvent {
                    file: None,
                    album_id: Some(album_id),
                    kind: DeleteKind::Album,
                    date_ms: now_ms,
                },
                now_ms,
            );
            put_json(values, &manifest_key, &manifest)
        })
    }

    /// Owner-only full teardown: drops every member's manifest ref, then
    /// removes the fileset itself. Ref-count decrements for its files are
    /// the caller's responsibility (BlobEngine) before this is invoked.
    pub fn delete_album(&self, owner: UserId, album_id: i64, storage_path: &str, now_ms: i64) -> VaultResult<()> {
        let members: Vec<UserId> = {
            let fs: FileSet = self.storage.read_data_file(storage_path)?;
            let album = fs.album.as_ref().ok_or_else(|| VaultError::Invalid("not an album".into()))?;
            if album.owner_id != owner {
                return Err(VaultError::Invalid("only the owner may delete this album".into()));
            }
            for spec in fs.files.values() {
                let _ = crate::blob::BlobEngine::new(self.storage.clone()).unref(&spec.store_file_path);
                let _ = crate::blob::BlobEngine::new(self.storage.clone()).unref(&spec.store_thumb_path);
            }
            album.members.iter().copied().collect()
        };

        for member in members {
            let manifest_key = album_manifest_path(member);
            let result = self.storage.update_many(&[TxPath::meta(&manifest_key)], |values| {
                let mut manifest: AlbumManifest = json_or_default(values, &manifest_key)?;
                manifest.albums.remove(&album_id);
                push_delete_event(
                    &mut manifest.deletes,
                    &mut manifest.delete_horizon_ms,
                    DeleteEvent {
                        file: None,
                        album_id: Some(album_id),
                        kind: DeleteKind::Album,
                        date_ms: now_ms,
                    },
                    now_ms,
                );
                put_json(values, &manifest_key, &manifest)
            });
            if let Err(e) = result {
                warn!("delete_album({album_id}): failed to drop manifest ref for {member}: {e}");
            }
        }

        let storage_path_owned = storage_path.to_string();
        self.storage.update_many(&[TxPath::meta(&storage_path_owned)], |values| {
            values.remove(&storage_path_owned);
            Ok(())
        })
    }

    fn add_contact_pair(&self, a: UserId, b: UserId, now_ms: i64) -> VaultResult<()> {
        let user_a = self.storage.read_data_file::<User>(&user_path(a))?;
        let user_b = self.storage.read_data_file::<User>(&user_path(b))?;

        let key_a = contacts_path(a);
        self.storage.update_many(&[TxPath::meta(&key_a)], |values| {
            let mut cl: ContactList = json_or_default(values, &key_a)?;
            cl.contacts.entry(b).or_insert(Contact {
                user_id: b,
                email: user_b.email.clone(),
                public_key: user_b.public_key.clone(),
                date_added: now_ms,
            });
            put_json(values, &key_a, &cl)
        })?;

        let key_b = contacts_path(b);
        self.storage.update_many(&[TxPath::meta(&key_b)], |values| {
            let mut cl: ContactList = json_or_default(values, &key_b)?;
            cl.contacts.entry(a).or_insert(Contact {
                user_id: a,
                email: user_a.email.clone(),
                public_key: user_a.public_key.clone(),
                date_added: now_ms,
            });
            cl.in_.insert(a);
            put_json(values, &key_b, &cl)
        })
    }

    pub fn add_contact(&self, owner: UserId, peer: UserId, now_ms: i64) -> VaultResult<()> {
        self.add_contact_pair(owner, peer, now_ms)
    }

    /// Read-only fileset fetch through the mtime-keyed LRU.
    pub fn fileset(&self, storage_path: &str) -> VaultResult<FileSet> {
        let on_disk = self.storage.on_disk_path(storage_path);
        let mtime_ns = std::fs::metadata(&on_disk)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let key = (on_disk, mtime_ns);
        if let Some(fs) = self.fileset_cache.get(&key) {
            return Ok(fs);
        }
        let fs: FileSet = self.storage.read_data_file(storage_path)?;
        self.fileset_cache.insert(key, fs.clone());
        Ok(fs)
    }

    pub fn gallery(&self, user: UserId) -> VaultResult<FileSet> {
        self.fileset(&fileset_path(user, SetKind::Gallery))
    }

    pub fn trash(&self, user: UserId) -> VaultResult<FileSet> {
        self.fileset(&fileset_path(user, SetKind::Trash))
    }

    pub fn file_updates(&self, storage_path: &str, since_ms: i64) -> VaultResult<Vec<(String, FileSpec)>> {
        let fs = self.fileset(storage_path)?;
        if since_ms < fs.delete_horizon_ms {
            return Err(VaultError::UpdateTimestampTooOld);
        }
        Ok(fs
            .files
            .into_iter()
            .filter(|(_, spec)| spec.date_modified > since_ms)
            .collect())
    }

    pub fn delete_updates(&self, user: UserId, since_ms: i64) -> VaultResult<Vec<DeleteEvent>> {
        let manifest: AlbumManifest = self.storage.read_data_file(&album_manifest_path(user)).unwrap_or_default();
        let contacts: ContactList = self.storage.read_data_file(&contacts_path(user)).unwrap_or_default();
        let gallery = self.gallery(user)?;
        let trash = self.trash(user)?;

        let horizon = manifest
            .delete_horizon_ms
            .max(contacts.delete_horizon_ms)
            .max(gallery.delete_horizon_ms)
            .max(trash.delete_horizon_ms);
        if since_ms < horizon {
            return Err(VaultError::UpdateTimestampTooOld);
        }

        let mut out: Vec<DeleteEvent> = Vec::new();
        for events in [&manifest.deletes, &contacts.deletes, &gallery.deletes, &trash.deletes] {
            out.extend(events.iter().filter(|e| e.date_ms > since_ms).cloned());
        }
        out.sort_by_key(|e| e.date_ms);
        Ok(out)
    }

    pub fn album_updates(&self, user: UserId, since_ms: i64) -> VaultResult<Vec<AlbumUpdate>> {
        let manifest: AlbumManifest = self.storage.read_data_file(&album_manifest_path(user)).unwrap_or_default();
        if since_ms < manifest.delete_horizon_ms {
            return Err(VaultError::UpdateTimestampTooOld);
        }
        let mut out = Vec::new();
        for (album_id, aref) in &manifest.albums {
            let fs = self.fileset(&aref.storage_path)?;
            if let Some(album) = &fs.album {
                if album.date_modified > since_ms {
                    let is_owner = album.owner_id == user;
                    let enc_private_key = if is_owner {
                        album.enc_private_key.clone()
                    } else {
                        album.sharing_keys.get(&user).cloned().unwrap_or_default()
                    };
                    out.push(AlbumUpdate {
                        album_id: *album_id,
                        storage_path: aref.storage_path.clone(),
                        is_owner,
                        enc_private_key,
                        date_modified: album.date_modified,
                    });
                }
            }
        }
        Ok(out)
    }

    pub fn contact_updates(&self, user: UserId, since_ms: i64) -> VaultResult<Vec<Contact>> {
        let contacts: ContactList = self.storage.read_data_file(&contacts_path(user)).unwrap_or_default();
        if since_ms < contacts.delete_horizon_ms {
            return Err(VaultError::UpdateTimestampTooOld);
        }
        Ok(contacts
            .contacts
            .into_values()
            .filter(|c| c.date_added > since_ms)
            .collect())
    }

    /// Sums file + thumb sizes over every fileset the user owns; shared
    /// albums are counted only for the owner, and a blob path referenced
    /// twice within the same sum (e.g. file and a duplicate move target)
    /// is only charged once.
    pub fn space_used(&self, user: UserId) -> VaultResult<u64> {
        let mut seen = HashSet::new();
        let mut total = 0u64;
        let mut charge = |path: &str, size: u64, seen: &mut HashSet<String>| {
            if seen.insert(path.to_string()) {
                total += size;
            }
        };

        for set in [SetKind::Gallery, SetKind::Trash] {
            let fs = self.fileset(&fileset_path(user, set))?;
            for spec in fs.files.values() {
                charge(&spec.store_file_path, spec.store_file_size, &mut seen);
                charge(&spec.store_thumb_path, spec.store_thumb_size, &mut seen);
            }
        }

        let manifest: AlbumManifest = self.storage.read_data_file(&album_manifest_path(user)).unwrap_or_default();
        for aref in manifest.albums.values() {
            let fs = self.fileset(&aref.storage_path)?;
            if fs.album.as_ref().map(|a| a.owner_id == user).unwrap_or(false) {
                for spec in fs.files.values() {
                    charge(&spec.store_file_path, spec.store_file_size, &mut seen);
                    charge(&spec.store_thumb_path, spec.store_thumb_size, &mut seen);
                }
            }
        }
        Ok(total)
    }

    pub fn quota(&self, user: UserId) -> VaultResult<u64> {
        let quotas: Quotas = self.storage.read_data_file("quotas.dat").unwrap_or_default();
        match quotas.limits.get(&user) {
            Some(limit) => Ok(normalize_quota(limit.value, &limit.unit)),
            None => Ok(normalize_quota(quotas.default_limit, &quotas.default_limit_unit)),
        }
    }

    /// Reads the admin tuple along with a tag identifying this exact
    /// revision, for a later `update_admin_data` call to assert against.
    pub fn admin_data(&self) -> VaultResult<(AdminData, String)> {
        self.storage.read_tagged(ADMIN_DATA_PATH)
    }

    /// Applies `f` to the admin tuple only if `expected_tag` still matches
    /// what's on disk; otherwise returns `VaultError::Outdated` so the
    /// caller can re-read and retry (spec.md §6, §8 scenario 6).
    pub fn update_admin_data<F>(&self, expected_tag: &str, f: F) -> VaultResult<(AdminData, String)>
    where
        F: FnOnce(&mut AdminData) -> VaultResult<()>,
    {
        self.storage.compare_and_swap(ADMIN_DATA_PATH, expected_tag, f)
    }

    /// Spawns `$EDITOR` on the decrypted admin tuple and re-encrypts
    /// whatever comes back (spec.md §4.3 `EditDataFile`). Admin CLI only.
    pub fn edit_admin_data(&self) -> VaultResult<()> {
        self.storage.edit_data_file(ADMIN_DATA_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvault::MasterKey;

    fn engine() -> (tempfile::TempDir, MetadataEngine) {
        let dir = tempfile::tempdir().unwrap();
        let mk = MasterKey::generate();
        let storage = Arc::new(SecureStorage::open(dir.path(), Some(mk)).unwrap());
        (dir, MetadataEngine::new(storage))
    }

    #[test]
    fn add_user_assigns_admin_to_first_account() {
        let (_dir, engine) = engine();
        let alice = engine
            .add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 1_000)
            .unwrap();
        let bob = engine
            .add_user("bob@example.com", vec![], vec![], vec![], vec![], false, 1_000)
            .unwrap();

        let list: UserList = engine.storage.read_data_file("users.dat").unwrap();
        assert_eq!(list.admin_id, Some(alice));
        assert_ne!(alice, bob);

        let fetched = engine.user("alice@example.com").unwrap();
        assert_eq!(fetched.user_id, alice);
    }

    #[test]
    fn add_user_rejects_duplicate_email() {
        let (_dir, engine) = engine();
        engine.add_user("a@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        let result = engine.add_user("a@example.com", vec![], vec![], vec![], vec![], false, 0);
        assert!(matches!(result, Err(VaultError::AlreadyExists(_))));
    }

    #[test]
    fn rename_user_rejects_existing_email_and_updates_contacts() {
        let (_dir, engine) = engine();
        let alice = engine.add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        let bob = engine.add_user("bob@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        engine.add_contact(bob, alice, 10).unwrap();

        let result = engine.rename_user(alice, "bob@example.com", 20);
        assert!(matches!(result, Err(VaultError::AlreadyExists(_))));

        engine.rename_user(alice, "alice2@example.com", 30).unwrap();
        let bob_contacts: ContactList = engine.storage.read_data_file(&contacts_path(bob)).unwrap();
        assert_eq!(bob_contacts.contacts[&alice].email, "alice2@example.com");
    }

    #[test]
    fn delete_user_emits_contact_and_album_events() {
        let (_dir, engine) = engine();
        let alice = engine.add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        let bob = engine.add_user("bob@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        engine.add_contact(alice, bob, 10).unwrap();

        let album_id = engine.add_album(alice, vec![1, 2, 3], vec![4, 5, 6], vec![], 20).unwrap();
        let manifest: AlbumManifest = engine.storage.read_data_file(&album_manifest_path(alice)).unwrap();
        let storage_path = manifest.albums[&album_id].storage_path.clone();
        let sharing_keys = HashMap::from([(bob, vec![9u8])]);
        engine
            .share_album(alice, album_id, &storage_path, &[bob], sharing_keys, 30)
            .unwrap();

        engine.delete_user(alice, 40).unwrap();

        let bob_deletes = engine.delete_updates(bob, 0).unwrap();
        assert!(bob_deletes
            .iter()
            .any(|e| e.kind == DeleteKind::Contact && e.file == Some(alice.to_string())));
        assert!(bob_deletes.iter().any(|e| e.kind == DeleteKind::Album && e.album_id == Some(album_id)));
    }

    #[test]
    fn share_album_grants_bob_view_per_scenario() {
        let (_dir, engine) = engine();
        let alice = engine.add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        let bob = engine.add_user("bob@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();

        let album_id = engine.add_album(alice, b"alice-priv".to_vec(), b"pub".to_vec(), vec![], 0).unwrap();
        let manifest: AlbumManifest = engine.storage.read_data_file(&album_manifest_path(alice)).unwrap();
        let storage_path = manifest.albums[&album_id].storage_path.clone();

        let sharing_keys = HashMap::from([(bob, b"for-bob".to_vec())]);
        engine
            .share_album(alice, album_id, &storage_path, &[bob], sharing_keys, 5)
            .unwrap();

        let updates = engine.album_updates(bob, 0).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].is_owner);
        assert_eq!(updates[0].enc_private_key, b"for-bob");

        let bob_fileset = engine.fileset(&storage_path).unwrap();
        assert!(bob_fileset.files.is_empty());
    }

    #[test]
    fn quota_normalizes_units() {
        assert_eq!(normalize_quota(1, "k"), 1024);
        assert_eq!(normalize_quota(1, "g"), 1024 * 1024 * 1024);
        assert_eq!(normalize_quota(5, "?"), 5);
    }

    #[test]
    fn file_updates_reports_outdated_before_horizon() {
        let (_dir, engine) = engine();
        let alice = engine.add_user("alice@example.com", vec![], vec![], vec![], vec![], false, 0).unwrap();
        let gallery_key = fileset_path(alice, SetKind::Gallery);
        engine
            .storage
            .update_data_file::<FileSet, _, ()>(&gallery_key, |fs| {
                fs.delete_horizon_ms = 5_000;
                Ok(())
            })
            .unwrap();
        let result = engine.file_updates(&gallery_key, 10);
        assert!(matches!(result, Err(VaultError::UpdateTimestampTooOld)));
    }

    #[test]
    fn admin_data_rejects_stale_tag_and_applies_fresh_one() {
        let (_dir, engine) = engine();
        let (initial, tag) = engine.admin_data().unwrap();
        assert!(initial.push_services.is_empty());

        let (updated, new_tag) = engine
            .update_admin_data(&tag, |d| {
                d.push_services.push(PushServiceConfig {
                    name: "fcm".to_string(),
                    endpoint: "https://example.test/push".to_string(),
                    shared_secret: vec![1, 2, 3],
                });
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.push_services.len(), 1);
        assert_ne!(tag, new_tag);

        // A second writer holding the now-stale first tag is rejected.
        let stale_result = engine.update_admin_data(&tag, |d| {
            d.push_services.clear();
            Ok(())
        });
        assert!(matches!(stale_result, Err(VaultError::Outdated)));

        // The writer that read the fresh tag succeeds.
        let (final_data, _) = engine
            .update_admin_data(&new_tag, |d| {
                d.push_services.clear();
                Ok(())
            })
            .unwrap();
        assert!(final_data.push_services.is_empty());
    }
}
