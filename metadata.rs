//! Transform metadata stored alongside each uploaded object.
//!
//! Attribute names are `<prefix>-compress`, `<prefix>-encrypt` and
//! `<prefix>-scrypt`, each with a `-version` companion, plus
//! `<prefix>-scrypt-id` naming the passphrase an object was sealed with.
//! Readers of stored objects depend on these names, so they must not change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PREFIX: &str = "s3bu";

/// Version recorded for every transform
pub const TRANSFORM_VERSION: &str = "001";

pub const COMPRESS: &str = "compress";
pub const ENCRYPT: &str = "encrypt";
pub const SCRYPT: &str = "scrypt";

/// String attributes describing how an object was transformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `<prefix>-<transform>` and `<prefix>-<transform>-version`.
    pub(crate) fn record_transform(&mut self, prefix: &str, transform: &str, algorithm: &str) {
        self.0
            .insert(format!("{}-{}", prefix, transform), algorithm.to_string());
        self.0.insert(
            format!("{}-{}-version", prefix, transform),
            TRANSFORM_VERSION.to_string(),
        );
    }

    pub(crate) fn record_passphrase_id(&mut self, prefix: &str, id: &str) {
        self.0
            .insert(format!("{}-{}-id", prefix, SCRYPT), id.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Algorithm recorded for `transform`, if it was applied
    pub fn transform(&self, prefix: &str, transform: &str) -> Option<&str> {
        self.get(&format!("{}-{}", prefix, transform))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}
