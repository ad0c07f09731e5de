//! Upload entry points.
//!
//! ```no_run
//! use s3bu::{client::UploadClient, key_manager::Keyring, store::FsStore};
//! use std::fs::File;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = UploadClient::new(FsStore::new("./storage"), "backup", Keyring::default());
//!     let written = client
//!         .upload_compressed("logs/app.log", File::open("app.log")?)
//!         .await?;
//!     println!("{} bytes stored", written);
//!     Ok(())
//! }
//! ```

use crate::config::Config;
use crate::coordinator::UploadCoordinator;
use crate::encryptor::DEFAULT_SCRYPT_LOG_N;
use crate::error::UploadError;
use crate::key_manager::Keyring;
use crate::metadata::DEFAULT_PREFIX;
use crate::store::{FsStore, ObjectStore};
use crate::transform::TransformSpec;
use anyhow::Result;
use std::io::Read;
use std::sync::Arc;

/// Uploads objects into one bucket of an [`ObjectStore`].
///
/// Cheap to clone; every upload gets its own [`UploadCoordinator`], so a
/// client can run any number of uploads concurrently.
pub struct UploadClient<S: ObjectStore + ?Sized> {
    store: Arc<S>,
    keyring: Arc<Keyring>,
    bucket: String,
    prefix: String,
    scrypt_log_n: u8,
}

impl<S: ObjectStore + ?Sized> Clone for UploadClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keyring: self.keyring.clone(),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            scrypt_log_n: self.scrypt_log_n,
        }
    }
}

impl<S: ObjectStore + 'static> UploadClient<S> {
    pub fn new(store: S, bucket: impl Into<String>, keyring: Keyring) -> Self {
        Self::from_shared(Arc::new(store), bucket, Arc::new(keyring))
    }
}

impl<S: ObjectStore + ?Sized + 'static> UploadClient<S> {
    pub fn from_shared(store: Arc<S>, bucket: impl Into<String>, keyring: Arc<Keyring>) -> Self {
        Self {
            store,
            keyring,
            bucket: bucket.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            scrypt_log_n: DEFAULT_SCRYPT_LOG_N,
        }
    }

    /// Set the prefix of the metadata attribute names
    pub fn with_metadata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the scrypt work factor used for passphrase encryption
    pub fn with_scrypt_log_n(mut self, log_n: u8) -> Self {
        self.scrypt_log_n = log_n;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Store `source` unchanged.
    pub async fn upload<R>(&self, key: &str, source: R) -> Result<u64, UploadError>
    where
        R: Read + Send + 'static,
    {
        self.upload_with(key, source, TransformSpec::plain()).await
    }

    /// Store `source` gzip-compressed.
    pub async fn upload_compressed<R>(&self, key: &str, source: R) -> Result<u64, UploadError>
    where
        R: Read + Send + 'static,
    {
        self.upload_with(key, source, TransformSpec::compressed()).await
    }

    /// Store `source` encrypted to every recipient in the keyring,
    /// compressing first when `compress` is set.
    pub async fn upload_encrypted<R>(
        &self,
        key: &str,
        source: R,
        compress: bool,
    ) -> Result<u64, UploadError>
    where
        R: Read + Send + 'static,
    {
        self.upload_with(key, source, TransformSpec::encrypted(compress))
            .await
    }

    /// Store `source` encrypted under the most recently added passphrase,
    /// compressing first when `compress` is set.
    ///
    /// Fails with [`UploadError::PassphraseNotFound`] without reading the
    /// source when the keyring has no passphrase.
    pub async fn upload_with_passphrase<R>(
        &self,
        key: &str,
        source: R,
        compress: bool,
    ) -> Result<u64, UploadError>
    where
        R: Read + Send + 'static,
    {
        self.upload_with(key, source, TransformSpec::passphrase(compress))
            .await
    }

    /// Store `source` with an explicit set of transforms. Returns the number
    /// of transformed bytes sent to the store.
    ///
    /// When the store fails after the source was fully transformed, the count
    /// travels in [`UploadError::Store`]. A source or transform failure wins
    /// over any store error and carries no count.
    pub async fn upload_with<R>(
        &self,
        key: &str,
        source: R,
        spec: TransformSpec,
    ) -> Result<u64, UploadError>
    where
        R: Read + Send + 'static,
    {
        UploadCoordinator::new(
            self.store.clone(),
            self.keyring.clone(),
            self.bucket.clone(),
            self.prefix.clone(),
            self.scrypt_log_n,
        )
        .run(key, source, spec)
        .await
    }
}

impl UploadClient<FsStore> {
    /// Client for the filesystem store described by `cfg`
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        let keyring = Keyring::from_config(cfg).await?;
        Ok(UploadClient::new(FsStore::new(&cfg.storage_dir), cfg.bucket.clone(), keyring)
            .with_metadata_prefix(cfg.metadata_prefix.clone())
            .with_scrypt_log_n(cfg.scrypt_log_n))
    }
}
