//! Transactional encrypted object store for the backup engine.
//!
//! Master-key-derived encryption hierarchy ([`keyvault`]), framed stream
//! cipher for blobs ([`stream`]), crash-safe multi-file transactions
//! ([`storage`]), typed metadata accessors ([`metadata`]), content-addressed
//! blob reference counting ([`blob`]), stateless tokens ([`token`]), and
//! passphrase/master-key maintenance ([`admin`]).

pub mod admin;
pub mod autocert;
pub mod blob;
pub mod error;
pub mod keyvault;
pub mod metadata;
pub mod storage;
pub mod stream;
pub mod token;

pub use autocert::AutocertCache;
pub use blob::{BlobEngine, NewBlob};
pub use error::{VaultError, VaultResult};
pub use keyvault::{MasterKey, SubKey, WrappedKey};
pub use metadata::MetadataEngine;
pub use storage::SecureStorage;
pub use token::{Token, TokenMint};
