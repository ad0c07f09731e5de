//! Recipient keys and passphrases available to an upload client.
//!
//! [`KeyManager`] loads or generates 256-bit recipient key files.
//! [`PassphraseStore`] holds named passphrases in the order they were added.
//! [`Keyring`] bundles both and is handed to the client at construction.
//!
//! ## Security Features
//!
//! - Key bytes and passphrases are zeroized on drop
//! - Unix file permissions set to 0600 (owner read/write only)
//! - Cryptographically secure random generation via `OsRng`

use crate::config::Config;
use crate::encryptor::{Identity, Recipient, KEY_LEN};
use anyhow::{bail, Context, Result};
use rand_core::{OsRng, RngCore};
use std::env;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Environment variable prefix for passphrase secrets
pub const ENV_PASSPHRASE_PREFIX: &str = "S3BU_PASSPHRASE_";

/// Handles recipient key generation and persistence.
/// In production: prefer a hardware key store or OS keyring.
pub struct KeyManager {
    key_bytes: [u8; KEY_LEN],
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl KeyManager {
    /// Load an existing 32-byte key file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading recipient key");
        let data = Zeroizing::new(
            fs::read(path)
                .await
                .with_context(|| format!("reading key from {}", path.display()))?,
        );
        if data.len() != KEY_LEN {
            warn!(path = %path.display(), found_bytes = data.len(), "invalid key size");
            bail!(
                "expected {}-byte key at {} but found {} bytes",
                KEY_LEN,
                path.display(),
                data.len()
            );
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(&data);
        Ok(Self { key_bytes })
    }

    /// Generate a new key and write it to `path`, which must not exist yet.
    pub async fn generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "generating new recipient key");
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        // Write with restrictive permissions using spawn_blocking for Unix
        #[cfg(unix)]
        {
            let path_buf = path.to_path_buf();
            let mut key_clone = key;
            tokio::task::spawn_blocking(move || {
                use std::fs::OpenOptions;
                use std::io::Write;
                use std::os::unix::fs::OpenOptionsExt;

                let result = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&path_buf)
                    .and_then(|mut f| f.write_all(&key_clone));
                key_clone.zeroize();
                result.with_context(|| format!("writing key to {}", path_buf.display()))
            })
            .await??;
        }
        #[cfg(not(unix))]
        {
            if fs::try_exists(path).await? {
                bail!("key file {} already exists", path.display());
            }
            fs::write(path, &key)
                .await
                .with_context(|| format!("writing key to {}", path.display()))?;
        }

        Ok(Self { key_bytes: key })
    }

    /// Load the key at `path`, generating it first if the file is missing.
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if fs::try_exists(path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?
        {
            Self::load(path).await
        } else {
            Self::generate(path).await
        }
    }

    pub fn recipient(&self) -> Recipient {
        Recipient::from_bytes(self.key_bytes)
    }
}

/// Named passphrases, remembered in insertion order.
///
/// Passphrase encryption always uses the most recently added entry. Older
/// entries stay available for opening objects sealed with them.
#[derive(Default)]
pub struct PassphraseStore {
    entries: Vec<(String, Zeroizing<String>)>,
}

impl PassphraseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a passphrase. Re-adding an id replaces its secret and makes it the latest.
    pub fn add(&mut self, id: impl Into<String>, secret: impl Into<String>) {
        let id = id.into();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.push((id, Zeroizing::new(secret.into())));
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, secret)| secret.as_str())
    }

    /// The most recently added `(id, secret)` pair
    pub fn latest(&self) -> Option<(&str, &str)> {
        self.entries
            .last()
            .map(|(id, secret)| (id.as_str(), secret.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read the secret for each id from `S3BU_PASSPHRASE_<ID>`, in order.
    /// Ids without a secret in the environment are skipped.
    pub fn from_env(ids: &[String]) -> Self {
        let mut store = Self::new();
        for id in ids {
            match env::var(passphrase_env_var(id)) {
                Ok(secret) if !secret.is_empty() => {
                    debug!(id = %id, "loaded passphrase from environment");
                    store.add(id.clone(), secret);
                }
                _ => warn!(id = %id, var = %passphrase_env_var(id), "passphrase not set in environment"),
            }
        }
        store
    }
}

/// Environment variable holding the secret for passphrase `id`
pub fn passphrase_env_var(id: &str) -> String {
    let suffix: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", ENV_PASSPHRASE_PREFIX, suffix)
}

/// Everything an upload client may encrypt to.
#[derive(Default)]
pub struct Keyring {
    pub recipients: Vec<Recipient>,
    pub passphrases: PassphraseStore,
}

impl Keyring {
    pub fn new(recipients: Vec<Recipient>, passphrases: PassphraseStore) -> Self {
        Self {
            recipients,
            passphrases,
        }
    }

    /// Load the recipient keys and passphrases named in `cfg`.
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        let mut recipients = Vec::with_capacity(cfg.recipient_keys.len());
        for path in &cfg.recipient_keys {
            recipients.push(KeyManager::load(path).await?.recipient());
        }
        let passphrases = PassphraseStore::from_env(&cfg.passphrase_ids);
        debug!(
            recipients = recipients.len(),
            passphrases = passphrases.len(),
            "keyring loaded"
        );
        Ok(Self::new(recipients, passphrases))
    }

    /// Identities able to open objects sealed with this keyring
    pub fn identities(&self) -> Vec<Identity> {
        self.recipients
            .iter()
            .cloned()
            .map(Identity::Key)
            .chain(
                self.passphrases
                    .entries
                    .iter()
                    .map(|(_, secret)| Identity::Passphrase(secret.clone())),
            )
            .collect()
    }
}
