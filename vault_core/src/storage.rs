//! Crash-safe, concurrent-safe storage of named logical files under a
//! hashed filesystem layout, plus the multi-file transaction primitive
//! every higher layer composes on top of (spec.md §4.3).

use crate::error::{VaultError, VaultResult};
use crate::keyvault::MasterKey;
use crate::stream::{StreamReader, StreamWriter, DEFAULT_CHUNK_SIZE};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

const PENDING_DIR: &str = "pending";
const BLOBS_DIR: &str = "blobs";
const METADATA_DIR: &str = "metadata";

/// A path-based advisory lock table. A transaction acquires every path it
/// touches in one critical section — either all are free and it takes all
/// of them atomically, or it waits — so lock order never matters and
/// distinct transactions can never deadlock against each other.
struct LockTable {
    locked: Mutex<HashSet<String>>,
    cv: Condvar,
}

impl LockTable {
    fn new() -> Self {
        LockTable {
            locked: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self, keys: Vec<String>) -> LockGuard<'_> {
        let mut guard = self.locked.lock().expect("lock table poisoned");
        loop {
            if keys.iter().all(|k| !guard.contains(k)) {
                for k in &keys {
                    guard.insert(k.clone());
                }
                break;
            }
            guard = self.cv.wait(guard).expect("lock table poisoned");
        }
        LockGuard { table: self, keys }
    }
}

struct LockGuard<'a> {
    table: &'a LockTable,
    keys: Vec<String>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.table.locked.lock().expect("lock table poisoned");
        for k in &self.keys {
            guard.remove(k);
        }
        self.table.cv.notify_all();
    }
}

/// One pending multi-file transaction: the on-disk paths it is about to
/// overwrite and each one's pre-image (`None` meaning "did not exist").
#[derive(Serialize, Deserialize)]
struct Journal {
    entries: Vec<(String, Option<Vec<u8>>)>,
}

/// Which naming scheme a transaction path resolves through: ordinary
/// metadata files go through the hashed mapping, blob-adjacent files
/// (content and `.ref` sidecars) keep their literal name.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PathKind {
    Metadata,
    Blob,
}

#[derive(Clone, Copy)]
pub struct TxPath<'a> {
    pub kind: PathKind,
    pub logical: &'a str,
}

impl<'a> TxPath<'a> {
    pub fn meta(logical: &'a str) -> Self {
        TxPath {
            kind: PathKind::Metadata,
            logical,
        }
    }

    pub fn blob(logical: &'a str) -> Self {
        TxPath {
            kind: PathKind::Blob,
            logical,
        }
    }
}

pub struct SecureStorage {
    root: PathBuf,
    master_key: Option<MasterKey>,
    locks: LockTable,
}

impl SecureStorage {
    /// Opens (and, if needed, creates) the database directory at `root`,
    /// running crash recovery before returning anything usable.
    pub fn open(root: impl Into<PathBuf>, master_key: Option<MasterKey>) -> VaultResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(PENDING_DIR))?;
        fs::create_dir_all(root.join(BLOBS_DIR))?;
        fs::create_dir_all(root.join(METADATA_DIR))?;
        let storage = SecureStorage {
            root,
            master_key,
            locks: LockTable::new(),
        };
        storage.recover_pending()?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.as_ref()
    }

    pub fn set_master_key(&mut self, key: MasterKey) {
        self.master_key = Some(key);
    }

    pub fn take_master_key(&mut self) -> Option<MasterKey> {
        self.master_key.take()
    }

    /// Maps a logical path to its on-disk location. With a master key set,
    /// the mapping is `HMAC(path)` with the first byte as a hex subdirectory
    /// and the remainder URL-safe base64; one-way and deterministic. Without
    /// a key (test fixtures only) the literal name is used under
    /// `metadata/`, matching `CreateEmptyFile`'s unencrypted test mode.
    pub fn on_disk_path(&self, logical: &str) -> PathBuf {
        match &self.master_key {
            Some(mk) => {
                let digest = mk.hash(logical.as_bytes());
                let prefix = hex::encode(&digest[0..1]);
                let rest = URL_SAFE_NO_PAD.encode(&digest[1..]);
                self.root.join(prefix).join(rest)
            }
            None => self.root.join(METADATA_DIR).join(logical),
        }
    }

    /// The literal, un-hashed location of a blob — blobs are already named
    /// by a random token (`blobs/<hex>/<b64>`) so no further hashing of the
    /// logical path is needed or possible without knowing the master key.
    pub fn blob_path(&self, logical: &str) -> PathBuf {
        self.root.join(logical)
    }

    fn on_disk_for(&self, path: &TxPath) -> PathBuf {
        match path.kind {
            PathKind::Metadata => self.on_disk_path(path.logical),
            PathKind::Blob => self.blob_path(path.logical),
        }
    }

    fn lock_key(&self, path: &TxPath) -> String {
        self.on_disk_for(path).to_string_lossy().into_owned()
    }

    fn encrypt(&self, logical: &str, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        match &self.master_key {
            Some(mk) => mk.encrypt_aad(plaintext, logical.as_bytes()),
            None => Ok(plaintext.to_vec()),
        }
    }

    fn decrypt(&self, logical: &str, framed: &[u8]) -> VaultResult<Vec<u8>> {
        match &self.master_key {
            Some(mk) => mk.decrypt_aad(framed, logical.as_bytes()),
            None => Ok(framed.to_vec()),
        }
    }

    fn read_raw(&self, path: &TxPath) -> VaultResult<Option<Vec<u8>>> {
        let on_disk = self.on_disk_for(path);
        match fs::read(&on_disk) {
            Ok(bytes) => Ok(Some(self.decrypt(path.logical, &bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_raw(&self, path: &TxPath, plaintext: &[u8]) -> VaultResult<()> {
        let on_disk = self.on_disk_for(path);
        if let Some(parent) = on_disk.parent() {
            fs::create_dir_all(parent)?;
        }
        let ciphertext = self.encrypt(path.logical, plaintext)?;
        atomic_write(&on_disk, &ciphertext)
    }

    fn remove_raw(&self, path: &TxPath) -> VaultResult<()> {
        let on_disk = self.on_disk_for(path);
        match fs::remove_file(&on_disk) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads, decrypts, and deserializes a single logical file.
    pub fn read_data_file<T: DeserializeOwned>(&self, logical: &str) -> VaultResult<T> {
        match self.read_raw(&TxPath::meta(logical))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(VaultError::NotFound(logical.to_string())),
        }
    }

    /// Serializes, encrypts, and atomically replaces a single logical file.
    pub fn save_data_file<T: Serialize>(&self, logical: &str, value: &T) -> VaultResult<()> {
        let plaintext = serde_json::to_vec(value)?;
        self.write_raw(&TxPath::meta(logical), &plaintext)
    }

    /// Writes `value` only if `logical` does not already exist.
    pub fn create_empty_file<T: Serialize>(&self, logical: &str, value: &T) -> VaultResult<()> {
        if self.on_disk_path(logical).exists() {
            return Ok(());
        }
        self.save_data_file(logical, value)
    }

    /// Reads a blob-adjacent metadata file (e.g. a `.ref` sidecar) addressed
    /// by its literal path rather than the hashed metadata scheme.
    pub fn read_blob_meta<T: DeserializeOwned>(&self, logical: &str) -> VaultResult<T> {
        match self.read_raw(&TxPath::blob(logical))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(VaultError::NotFound(logical.to_string())),
        }
    }

    pub fn save_blob_meta<T: Serialize>(&self, logical: &str, value: &T) -> VaultResult<()> {
        let plaintext = serde_json::to_vec(value)?;
        self.write_raw(&TxPath::blob(logical), &plaintext)
    }

    pub fn remove_blob_meta(&self, logical: &str) -> VaultResult<()> {
        self.remove_raw(&TxPath::blob(logical))
    }

    /// Read-modify-write a single logical file under an exclusive lock.
    /// `f` returning `Err` leaves the file untouched; `Ok` persists
    /// whatever `f` left in `value`.
    pub fn update_data_file<T, F, R>(&self, logical: &str, f: F) -> VaultResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> VaultResult<R>,
    {
        self.update_many(&[TxPath::meta(logical)], |values| {
            let mut value: T = match values.remove(logical) {
                Some(raw) => serde_json::from_slice(&raw)?,
                None => T::default(),
            };
            let result = f(&mut value)?;
            values.insert(logical.to_string(), serde_json::to_vec(&value)?);
            Ok(result)
        })
    }

    /// SHA-1 tag of a logical file's current marshalled bytes, used for
    /// optimistic-concurrency admin updates (spec.md §6 `AdminData`): a
    /// caller reads a value alongside this tag, and a later write is only
    /// applied if the tag still matches what's on disk.
    pub fn read_tagged<T: DeserializeOwned + Default>(&self, logical: &str) -> VaultResult<(T, String)> {
        let raw = self.read_raw(&TxPath::meta(logical))?.unwrap_or_default();
        let value = if raw.is_empty() { T::default() } else { serde_json::from_slice(&raw)? };
        Ok((value, hex::encode(sha1_of(&raw))))
    }

    /// Applies `f` to a logical file only if its on-disk tag still matches
    /// `expected_tag`; otherwise returns `VaultError::Outdated` without
    /// touching the file. Returns the new value and its fresh tag.
    pub fn compare_and_swap<T, F>(&self, logical: &str, expected_tag: &str, f: F) -> VaultResult<(T, String)>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> VaultResult<()>,
    {
        self.update_many(&[TxPath::meta(logical)], |values| {
            let raw = values.get(logical).cloned().unwrap_or_default();
            if hex::encode(sha1_of(&raw)) != expected_tag {
                return Err(VaultError::Outdated);
            }
            let mut value: T = if raw.is_empty() { T::default() } else { serde_json::from_slice(&raw)? };
            f(&mut value)?;
            let new_bytes = serde_json::to_vec(&value)?;
            let new_tag = hex::encode(sha1_of(&new_bytes));
            values.insert(logical.to_string(), new_bytes);
            Ok((value, new_tag))
        })
    }

    /// Decrypts `logical` to a scratch file under `pending/`, spawns
    /// `$EDITOR` (falling back to `vi`) on it, and re-encrypts whatever
    /// the editor left behind when it exits successfully. Admin-only
    /// (spec.md §4.3) — never reached from the request-serving path, so
    /// blocking on an interactive subprocess here is fine.
    pub fn edit_data_file(&self, logical: &str) -> VaultResult<()> {
        let plaintext = self.read_raw(&TxPath::meta(logical))?.unwrap_or_default();

        let mut nonce = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);
        let scratch = self.root.join(PENDING_DIR).join(format!("edit-{}", hex::encode(nonce)));
        fs::create_dir_all(&self.root.join(PENDING_DIR))?;
        fs::write(&scratch, &plaintext)?;

        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
        let spawn_result = std::process::Command::new(&editor).arg(&scratch).status();

        let outcome = (|| {
            let status = spawn_result?;
            if !status.success() {
                return Err(VaultError::Internal(format!("{editor} exited with {status}")));
            }
            let edited = fs::read(&scratch)?;
            self.write_raw(&TxPath::meta(logical), &edited)
        })();

        let _ = fs::remove_file(&scratch);
        outcome
    }

    /// The multi-file transaction primitive (spec.md §4.3). Locks every
    /// named path in one atomic step, reads their decrypted contents (a
    /// missing file is simply absent from the map), runs `f`, and on `Ok`
    /// commits every path's final value durably via the journal protocol
    /// below. On `Err` nothing on disk changes. Paths may mix ordinary
    /// hashed metadata files with literal blob-adjacent ones (`.ref`
    /// sidecars) so a FileSet mutation and its ref-count updates commit
    /// as one transaction.
    pub fn update_many<F, R>(&self, paths: &[TxPath], f: F) -> VaultResult<R>
    where
        F: FnOnce(&mut HashMap<String, Vec<u8>>) -> VaultResult<R>,
    {
        let mut lock_keys: Vec<String> = paths.iter().map(|p| self.lock_key(p)).collect();
        lock_keys.sort();
        lock_keys.dedup();
        let _guard = self.locks.acquire(lock_keys);

        let mut values: HashMap<String, Vec<u8>> = HashMap::new();
        for path in paths {
            if let Some(bytes) = self.read_raw(path)? {
                values.insert(path.logical.to_string(), bytes);
            }
        }
        let before: HashMap<String, Option<Vec<u8>>> = paths
            .iter()
            .map(|p| (p.logical.to_string(), values.get(p.logical).cloned()))
            .collect();

        let result = f(&mut values)?;

        self.commit(paths, &before, &values)?;
        Ok(result)
    }

    fn commit(
        &self,
        paths: &[TxPath],
        before: &HashMap<String, Option<Vec<u8>>>,
        after: &HashMap<String, Vec<u8>>,
    ) -> VaultResult<()> {
        // 1. Journal every pre-image as ciphertext keyed by on-disk path,
        //    so recovery never needs the master key to have stayed the same.
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let on_disk = self.on_disk_for(path).to_string_lossy().into_owned();
            let pre = match before.get(path.logical).and_then(|o| o.clone()) {
                Some(plaintext) => Some(self.encrypt(path.logical, &plaintext)?),
                None => None,
            };
            entries.push((on_disk, pre));
        }
        let journal_path = self.journal_path();
        let journal_bytes = bincode::serialize(&Journal { entries })?;
        {
            let mut f = File::create(&journal_path)?;
            f.write_all(&journal_bytes)?;
            f.sync_all()?;
        }

        // 2. Write every new value and rename it into place.
        for path in paths {
            match after.get(path.logical) {
                Some(plaintext) => self.write_raw(path, plaintext)?,
                None => self.remove_raw(path)?,
            }
        }

        // 3. Commit is durable; drop the journal.
        fs::remove_file(&journal_path)?;
        Ok(())
    }

    fn journal_path(&self) -> PathBuf {
        let ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos();
        let mut nonce = [0u8; 4];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);
        self.root
            .join(PENDING_DIR)
            .join(format!("{ns:020}-{}", hex::encode(nonce)))
    }

    /// Scans `pending/` for unfinished transactions and restores every
    /// named path to its journaled pre-image. Idempotent: re-running
    /// recovery against an already-restored file is a no-op because the
    /// journal always carries the full pre-image, not a diff.
    pub fn recover_pending(&self) -> VaultResult<()> {
        let pending_dir = self.root.join(PENDING_DIR);
        let mut journals: Vec<PathBuf> = fs::read_dir(&pending_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        journals.sort();

        for journal_path in journals {
            let bytes = fs::read(&journal_path)?;
            let journal: Journal = match bincode::deserialize(&bytes) {
                Ok(j) => j,
                Err(e) => {
                    error!("corrupt transaction journal {journal_path:?}, skipping: {e}");
                    continue;
                }
            };
            for (on_disk_path, pre_image) in &journal.entries {
                let target = PathBuf::from(on_disk_path);
                match pre_image {
                    Some(bytes) => {
                        if let Some(parent) = target.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        atomic_write(&target, bytes)?;
                    }
                    None => {
                        if let Err(e) = fs::remove_file(&target) {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
            warn!("recovered interrupted transaction {journal_path:?}");
            fs::remove_file(&journal_path)?;
        }
        Ok(())
    }

    /// Opens an encrypted write stream to a raw (non-JSON) logical path —
    /// used for blob content. The wrapped per-blob SubKey is written as a
    /// 93-byte header ahead of the stream frames so a reader can recover
    /// it without any other side-channel (spec.md §4.1, §4.2).
    pub fn open_blob_write(&self, logical: &str) -> VaultResult<StreamWriter<File>> {
        let mk = self
            .master_key
            .as_ref()
            .ok_or_else(|| VaultError::Internal("no master key set".into()))?;
        let path = self.blob_path(logical);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        let sub = crate::keyvault::SubKey::generate();
        mk.write_encrypted_key(&mut file, &sub)?;
        let context = sha1_of(logical.as_bytes());
        Ok(MasterKey::start_writer(&sub, context, file, DEFAULT_CHUNK_SIZE))
    }

    /// Opens an encrypted read stream, seekable, over a blob previously
    /// written by [`open_blob_write`](Self::open_blob_write).
    pub fn open_blob_read(&self, logical: &str) -> VaultResult<(StreamReader<File>, u64)> {
        let mk = self
            .master_key
            .as_ref()
            .ok_or_else(|| VaultError::Internal("no master key set".into()))?;
        let path = self.blob_path(logical);
        let mut file = File::open(&path)?;
        let sub = mk.read_encrypted_key(&mut file)?;
        let data_start = crate::keyvault::WRAPPED_KEY_LEN as u64;
        let context = sha1_of(logical.as_bytes());
        Ok((
            MasterKey::start_reader(&sub, context, file, DEFAULT_CHUNK_SIZE),
            data_start,
        ))
    }

    /// Renames an already-encrypted temp blob into its final content-addressed
    /// location, creating parent directories as needed. Used by BlobEngine
    /// after `open_blob_write` finishes writing to a scratch path.
    pub fn rename_blob(&self, from_logical: &str, to_logical: &str) -> VaultResult<()> {
        let from = self.blob_path(from_logical);
        let to = self.blob_path(to_logical);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;
        Ok(())
    }

    pub fn remove_blob(&self, logical: &str) -> VaultResult<()> {
        let path = self.blob_path(logical);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn blob_size(&self, logical: &str) -> VaultResult<u64> {
        Ok(fs::metadata(self.blob_path(logical))?.len())
    }

    /// Walks every on-disk file under the database root, yielding its path
    /// relative to `root`. Used by the orphan scanner and by master-key
    /// rotation (spec.md §4.5, §4.7); both need the same exhaustive set.
    pub fn walk_all_files(&self) -> VaultResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        walk_dir(&self.root, &self.root, &mut out)?;
        Ok(out)
    }
}

fn sha1_of(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> VaultResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// `write tmp; fsync; rename` — the atomic replace every write path uses.
fn atomic_write(path: &Path, bytes: &[u8]) -> VaultResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
    struct Doc {
        value: i64,
    }

    fn storage() -> (tempfile::TempDir, SecureStorage) {
        let dir = tempfile::tempdir().unwrap();
        let mk = MasterKey::generate();
        let storage = SecureStorage::open(dir.path(), Some(mk)).unwrap();
        (dir, storage)
    }

    #[test]
    fn save_and_read_roundtrip() {
        let (_dir, storage) = storage();
        storage.save_data_file("home/1/user.dat", &Doc { value: 42 }).unwrap();
        let doc: Doc = storage.read_data_file("home/1/user.dat").unwrap();
        assert_eq!(doc.value, 42);
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, storage) = storage();
        let result: VaultResult<Doc> = storage.read_data_file("nope");
        assert!(matches!(result, Err(VaultError::NotFound(_))));
    }

    #[test]
    fn create_empty_file_is_idempotent() {
        let (_dir, storage) = storage();
        storage.create_empty_file("x", &Doc { value: 1 }).unwrap();
        storage.create_empty_file("x", &Doc { value: 99 }).unwrap();
        let doc: Doc = storage.read_data_file("x").unwrap();
        assert_eq!(doc.value, 1);
    }

    #[test]
    fn update_data_file_rolls_back_on_error() {
        let (_dir, storage) = storage();
        storage.save_data_file("x", &Doc { value: 1 }).unwrap();
        let result: VaultResult<()> = storage.update_data_file("x", |doc: &mut Doc| {
            doc.value = 999;
            Err(VaultError::Invalid("boom".into()))
        });
        assert!(result.is_err());
        let doc: Doc = storage.read_data_file("x").unwrap();
        assert_eq!(doc.value, 1);
    }

    #[test]
    fn update_many_commits_all_or_nothing() {
        let (_dir, storage) = storage();
        storage.save_data_file("a", &Doc { value: 1 }).unwrap();
        storage.save_data_file("b", &Doc { value: 2 }).unwrap();

        storage
            .update_many(&[TxPath::meta("a"), TxPath::meta("b")], |values| {
                let mut a: Doc = serde_json::from_slice(&values["a"]).unwrap();
                let mut b: Doc = serde_json::from_slice(&values["b"]).unwrap();
                a.value += 10;
                b.value += 10;
                values.insert("a".into(), serde_json::to_vec(&a).unwrap());
                values.insert("b".into(), serde_json::to_vec(&b).unwrap());
                Ok(())
            })
            .unwrap();

        let a: Doc = storage.read_data_file("a").unwrap();
        let b: Doc = storage.read_data_file("b").unwrap();
        assert_eq!(a.value, 11);
        assert_eq!(b.value, 12);
    }

    #[test]
    fn crash_mid_transaction_recovers_preimage() {
        let (_dir, storage) = storage();
        storage.save_data_file("a", &Doc { value: 1 }).unwrap();

        // Simulate a crash between journal fsync and final journal removal:
        // write the new value and leave the journal behind, as `commit`
        // would mid-flight, then recover against a fresh handle.
        let before: HashMap<String, Option<Vec<u8>>> =
            [("a".to_string(), Some(serde_json::to_vec(&Doc { value: 1 }).unwrap()))]
                .into_iter()
                .collect();
        let after: HashMap<String, Vec<u8>> = HashMap::from([(
            "a".to_string(),
            serde_json::to_vec(&Doc { value: 2 }).unwrap(),
        )]);
        storage.write_raw(&TxPath::meta("a"), &after["a"]).unwrap();

        let on_disk = storage.on_disk_path("a").to_string_lossy().into_owned();
        let entries = vec![(
            on_disk,
            Some(storage.encrypt("a", &before["a"].clone().unwrap()).unwrap()),
        )];
        let journal_bytes = bincode::serialize(&Journal { entries }).unwrap();
        fs::write(storage.journal_path(), journal_bytes).unwrap();

        storage.recover_pending().unwrap();
        let doc: Doc = storage.read_data_file("a").unwrap();
        assert_eq!(doc.value, 1);
    }

    #[test]
    fn blob_roundtrip_through_stream() {
        use std::io::Read;
        let (_dir, storage) = storage();
        let mut w = storage.open_blob_write("blobs/ab/cd").unwrap();
        w.write_all(b"photo bytes").unwrap();
        w.finish().unwrap();

        let (mut r, _start) = storage.open_blob_read("blobs/ab/cd").unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"photo bytes");
    }

    #[test]
    fn unencrypted_mode_uses_literal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SecureStorage::open(dir.path(), None).unwrap();
        storage.save_data_file("users.dat", &Doc { value: 7 }).unwrap();
        assert!(dir.path().join("metadata").join("users.dat").exists());
    }

    #[test]
    fn compare_and_swap_rejects_stale_tag() {
        let (_dir, storage) = storage();
        let (_doc, tag): (Doc, String) = storage.read_tagged("cas.dat").unwrap();

        let (updated, new_tag): (Doc, String) = storage
            .compare_and_swap("cas.dat", &tag, |d: &mut Doc| {
                d.value = 5;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.value, 5);
        assert_ne!(tag, new_tag);

        let stale: VaultResult<(Doc, String)> = storage.compare_and_swap("cas.dat", &tag, |d| {
            d.value = 9;
            Ok(())
        });
        assert!(matches!(stale, Err(VaultError::Outdated)));

        let (doc, _) = storage.read_tagged::<Doc>("cas.dat").unwrap();
        assert_eq!(doc.value, 5);
    }
}
