//! # s3bu - Streaming Object Upload Library
//!
//! s3bu streams a byte source into an object store through an optional chain
//! of transforms, without holding the transformed object in memory.
//!
//! ## Features
//!
//! - **Streaming**: a zero-capacity conduit couples the transform writer to
//!   the uploader, so memory stays bounded by one write
//! - **Compression**: optional gzip, always applied before encryption
//! - **Encryption**: XChaCha20-Poly1305 to recipient keys or to a
//!   scrypt-derived passphrase key
//! - **Metadata**: every stored object records which transforms were applied
//!   so a reader can reverse them
//!
//! ## Quick Start
//!
//! ```no_run
//! use s3bu::{client::UploadClient, key_manager::Keyring, store::MemoryStore};
//! use std::io::Cursor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = UploadClient::new(MemoryStore::new(), "backup", Keyring::default());
//!     let written = client
//!         .upload_compressed("notes.txt", Cursor::new(b"hello".to_vec()))
//!         .await?;
//!
//!     let obj = client.store().get("backup", "notes.txt").unwrap();
//!     assert_eq!(obj.data.len() as u64, written);
//!     Ok(())
//! }
//! ```
//!
//! ## Metadata Attributes
//!
//! With the default prefix `s3bu`:
//!
//! - `s3bu-compress`, `s3bu-compress-version`: gzip applied
//! - `s3bu-encrypt`, `s3bu-encrypt-version`: encrypted to recipient keys
//! - `s3bu-scrypt`, `s3bu-scrypt-version`, `s3bu-scrypt-id`: encrypted under
//!   the named passphrase

pub mod client;
pub mod conduit;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod encryptor;
pub mod error;
pub mod key_manager;
pub mod metadata;
pub mod store;
pub mod streaming;
pub mod transform;

// Re-export common types for convenience
pub use client::UploadClient;
pub use error::{CryptoError, StoreError, UploadError};
pub use metadata::Metadata;
pub use store::{FsStore, MemoryStore, ObjectStore};
pub use transform::TransformSpec;
