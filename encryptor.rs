//! Object encryption: key wrapping and the encrypted object header.
//!
//! Every encrypted object gets a fresh random file key. The file key is
//! wrapped once per recipient (or once under a scrypt-derived passphrase key)
//! in the header, and the payload key is derived from it with HKDF-SHA256.
//! The payload itself is written by [`crate::streaming::EncryptWriter`].
//!
//! ## Header Format
//!
//! ```text
//! [magic:4 "S3BU"][version:1][stanza_count:1][stanzas...][payload_salt:16]
//!
//! Recipient stanza:  [kind:1 = 1][nonce:24][wrapped_key:48]
//! Scrypt stanza:     [kind:1 = 2][salt:16][log_n:1][nonce:24][wrapped_key:48]
//! ```
//!
//! A scrypt stanza is always the only stanza in its header.

use crate::error::CryptoError;
use crate::streaming::{DecryptReader, EncryptWriter, NONCE_LEN};
use chacha20poly1305::aead::{Aead, AeadCore, OsRng, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand_core::RngCore;
use sha2::Sha256;
use std::fmt;
use std::io::{self, Read, Write};
use tracing::debug;
use zeroize::Zeroizing;

pub const MAGIC: &[u8; 4] = b"S3BU";
pub const FORMAT_VERSION: u8 = 1;

/// Algorithm name recorded in object metadata
pub const ALGORITHM: &str = "xchacha20poly1305";

pub const DEFAULT_SCRYPT_LOG_N: u8 = 18;
/// Upper bound on the scrypt work factor accepted when opening an object
pub const MAX_SCRYPT_LOG_N: u8 = 22;

pub const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const WRAPPED_KEY_LEN: usize = KEY_LEN + 16;

/// Largest header `wrap_output` can write: 255 recipient stanzas
pub const MAX_HEADER_LEN: usize =
    MAGIC.len() + 2 + u8::MAX as usize * (1 + NONCE_LEN + WRAPPED_KEY_LEN) + SALT_LEN;

const KIND_RECIPIENT: u8 = 1;
const KIND_SCRYPT: u8 = 2;

const PAYLOAD_INFO: &[u8] = b"s3bu payload";

/// A symmetric key an object can be encrypted to.
#[derive(Clone)]
pub struct Recipient {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl Recipient {
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::KeyLength(key.len()));
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(key);
        Ok(Self::from_bytes(arr))
    }

    /// Generate a new random recipient key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Recipient(..)")
    }
}

/// Something that can unwrap a file key when opening an object.
pub enum Identity {
    Key(Recipient),
    Passphrase(Zeroizing<String>),
}

impl Identity {
    pub fn passphrase(secret: impl Into<String>) -> Self {
        Self::Passphrase(Zeroizing::new(secret.into()))
    }
}

enum Stanza {
    Recipient {
        nonce: [u8; NONCE_LEN],
        wrapped: Vec<u8>,
    },
    Scrypt {
        salt: [u8; SALT_LEN],
        log_n: u8,
        nonce: [u8; NONCE_LEN],
        wrapped: Vec<u8>,
    },
}

impl Stanza {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        match self {
            Stanza::Recipient { nonce, wrapped } => {
                out.write_all(&[KIND_RECIPIENT])?;
                out.write_all(nonce)?;
                out.write_all(wrapped)?;
            }
            Stanza::Scrypt {
                salt,
                log_n,
                nonce,
                wrapped,
            } => {
                out.write_all(&[KIND_SCRYPT])?;
                out.write_all(salt)?;
                out.write_all(&[*log_n])?;
                out.write_all(nonce)?;
                out.write_all(wrapped)?;
            }
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        let mut kind = [0u8; 1];
        input.read_exact(&mut kind)?;
        match kind[0] {
            KIND_RECIPIENT => {
                let mut nonce = [0u8; NONCE_LEN];
                input.read_exact(&mut nonce)?;
                let mut wrapped = vec![0u8; WRAPPED_KEY_LEN];
                input.read_exact(&mut wrapped)?;
                Ok(Stanza::Recipient { nonce, wrapped })
            }
            KIND_SCRYPT => {
                let mut salt = [0u8; SALT_LEN];
                input.read_exact(&mut salt)?;
                let mut log_n = [0u8; 1];
                input.read_exact(&mut log_n)?;
                let mut nonce = [0u8; NONCE_LEN];
                input.read_exact(&mut nonce)?;
                let mut wrapped = vec![0u8; WRAPPED_KEY_LEN];
                input.read_exact(&mut wrapped)?;
                Ok(Stanza::Scrypt {
                    salt,
                    log_n: log_n[0],
                    nonce,
                    wrapped,
                })
            }
            other => Err(invalid_data(format!("unknown stanza kind: {}", other))),
        }
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn stanza_aad(kind: u8) -> [u8; 6] {
    [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], FORMAT_VERSION, kind]
}

fn wrap_key(
    kek: &[u8; KEY_LEN],
    file_key: &[u8; KEY_LEN],
    kind: u8,
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(kek)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let aad = stanza_aad(kind);
    let wrapped = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: file_key,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&nonce);
    Ok((nonce_bytes, wrapped))
}

fn unwrap_key(
    kek: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    wrapped: &[u8],
    kind: u8,
) -> Option<Zeroizing<[u8; KEY_LEN]>> {
    let cipher = XChaCha20Poly1305::new_from_slice(kek).ok()?;
    #[allow(deprecated)]
    let nonce = XNonce::from_slice(nonce);
    let aad = stanza_aad(kind);
    let plain = Zeroizing::new(
        cipher
            .decrypt(nonce, Payload { msg: wrapped, aad: &aad })
            .ok()?,
    );
    if plain.len() != KEY_LEN {
        return None;
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&plain);
    Some(key)
}

fn scrypt_key(
    passphrase: &str,
    salt: &[u8],
    log_n: u8,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let params = scrypt::Params::new(log_n, 8, 1, KEY_LEN)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut key[..])
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(key)
}

fn payload_cipher(file_key: &[u8; KEY_LEN], salt: &[u8; SALT_LEN]) -> io::Result<XChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), &file_key[..]);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(PAYLOAD_INFO, &mut key[..])
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "HKDF expand failed"))?;
    XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Prepared encryption for one object: a file key and its wrapped stanzas.
pub struct Encryptor {
    file_key: Zeroizing<[u8; KEY_LEN]>,
    stanzas: Vec<Stanza>,
}

impl Encryptor {
    /// Encrypt to every key in `recipients`. Fails on an empty set.
    pub fn to_recipients(recipients: &[Recipient]) -> Result<Self, CryptoError> {
        if recipients.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        if recipients.len() > u8::MAX as usize {
            return Err(CryptoError::TooManyRecipients(recipients.len()));
        }
        let file_key = Self::fresh_file_key();
        let stanzas = recipients
            .iter()
            .map(|r| {
                let (nonce, wrapped) = wrap_key(r.as_bytes(), &file_key, KIND_RECIPIENT)?;
                Ok(Stanza::Recipient { nonce, wrapped })
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        debug!(recipients = recipients.len(), "prepared recipient encryption");
        Ok(Self { file_key, stanzas })
    }

    /// Encrypt under a key derived from `passphrase` with scrypt (N = 2^log_n).
    pub fn with_passphrase(passphrase: &str, log_n: u8) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        if log_n == 0 || log_n > MAX_SCRYPT_LOG_N {
            return Err(CryptoError::WorkFactor(log_n));
        }
        let file_key = Self::fresh_file_key();
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let kek = scrypt_key(passphrase, &salt, log_n)?;
        let (nonce, wrapped) = wrap_key(&kek, &file_key, KIND_SCRYPT)?;

        debug!(log_n, "prepared passphrase encryption");
        Ok(Self {
            file_key,
            stanzas: vec![Stanza::Scrypt {
                salt,
                log_n,
                nonce,
                wrapped,
            }],
        })
    }

    fn fresh_file_key() -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        key
    }

    /// Write the header to `out` and return a writer for the payload.
    pub fn wrap_output<W: Write>(self, mut out: W) -> io::Result<EncryptWriter<W>> {
        let mut payload_salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut payload_salt);

        out.write_all(MAGIC)?;
        out.write_all(&[FORMAT_VERSION, self.stanzas.len() as u8])?;
        for stanza in &self.stanzas {
            stanza.write_to(&mut out)?;
        }
        out.write_all(&payload_salt)?;

        let cipher = payload_cipher(&self.file_key, &payload_salt)?;
        Ok(EncryptWriter::new(out, cipher))
    }
}

/// Opens encrypted objects with a set of identities.
pub struct Decryptor {
    identities: Vec<Identity>,
}

impl Decryptor {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    /// Read the header from `input` and return a reader for the plaintext.
    pub fn open<R: Read>(&self, mut input: R) -> io::Result<DecryptReader<R>> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid_data("not an encrypted object"));
        }

        let mut head = [0u8; 2];
        input.read_exact(&mut head)?;
        let [version, count] = head;
        if version != FORMAT_VERSION {
            return Err(invalid_data(format!("unsupported format version: {}", version)));
        }
        if count == 0 {
            return Err(invalid_data("header has no stanzas"));
        }

        let stanzas = (0..count)
            .map(|_| Stanza::read_from(&mut input))
            .collect::<io::Result<Vec<_>>>()?;
        if count > 1 && stanzas.iter().any(|s| matches!(s, Stanza::Scrypt { .. })) {
            return Err(invalid_data("scrypt stanza must be the only stanza"));
        }

        let mut payload_salt = [0u8; SALT_LEN];
        input.read_exact(&mut payload_salt)?;

        let file_key = self.unwrap_file_key(&stanzas)?;
        let cipher = payload_cipher(&file_key, &payload_salt)?;
        Ok(DecryptReader::new(input, cipher))
    }

    fn unwrap_file_key(&self, stanzas: &[Stanza]) -> io::Result<Zeroizing<[u8; KEY_LEN]>> {
        for stanza in stanzas {
            for identity in &self.identities {
                let key = match (stanza, identity) {
                    (Stanza::Recipient { nonce, wrapped }, Identity::Key(recipient)) => {
                        unwrap_key(recipient.as_bytes(), nonce, wrapped, KIND_RECIPIENT)
                    }
                    (
                        Stanza::Scrypt {
                            salt,
                            log_n,
                            nonce,
                            wrapped,
                        },
                        Identity::Passphrase(passphrase),
                    ) => {
                        if *log_n == 0 || *log_n > MAX_SCRYPT_LOG_N {
                            return Err(invalid_data(format!(
                                "scrypt work factor {} is out of range",
                                log_n
                            )));
                        }
                        let kek = scrypt_key(passphrase, salt, *log_n)
                            .map_err(|e| invalid_data(e.to_string()))?;
                        unwrap_key(&kek, nonce, wrapped, KIND_SCRYPT)
                    }
                    _ => None,
                };
                if let Some(key) = key {
                    return Ok(key);
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "no identity matched any recipient",
        ))
    }
}
