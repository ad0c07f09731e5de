//! Layered writer construction for an upload.
//!
//! [`TransformChain::build`] wraps a base writer with the transforms selected
//! by a [`TransformSpec`] and returns the composed writer together with the
//! [`Metadata`] describing it. Layers from the source side down:
//!
//! ```text
//! gzip  ->  encryption  ->  buffer  ->  base writer
//! ```
//!
//! Compression always runs before encryption. Closing the composed writer
//! finishes the layers in that same order, so each layer's trailing bytes
//! reach the one below before it is finished itself.

use crate::encryptor::{Encryptor, ALGORITHM, MAX_HEADER_LEN};
use crate::error::UploadError;
use crate::key_manager::Keyring;
use crate::metadata::{self, Metadata};
use crate::streaming::EncryptWriter;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{self, BufWriter, Write};
use tracing::debug;

/// Algorithm name recorded for the compression layer
pub const COMPRESSION_ALGORITHM: &str = "gzip";

/// Buffer between the encryptor and the base writer. Holds any header
/// whole, so building a chain never writes to the base.
const BUFFER_CAPACITY: usize = 32 * 1024;

const _: () = assert!(MAX_HEADER_LEN < BUFFER_CAPACITY);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// Encrypt to every recipient key in the keyring
    Recipients,
    /// Encrypt under the most recently added passphrase
    Passphrase,
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::Recipients => f.write_str("recipients"),
            Encryption::Passphrase => f.write_str("passphrase"),
        }
    }
}

/// Which transforms to apply. At most one encryption mode by construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformSpec {
    pub compress: bool,
    pub encryption: Option<Encryption>,
}

impl TransformSpec {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn compressed() -> Self {
        Self {
            compress: true,
            encryption: None,
        }
    }

    pub fn encrypted(compress: bool) -> Self {
        Self {
            compress,
            encryption: Some(Encryption::Recipients),
        }
    }

    pub fn passphrase(compress: bool) -> Self {
        Self {
            compress,
            encryption: Some(Encryption::Passphrase),
        }
    }
}

/// A writer layer that must be closed explicitly to flush its tail.
pub trait Layer: Write {
    /// Finish this layer, then close the layer beneath it.
    fn close(self: Box<Self>) -> io::Result<()>;
}

struct Base<W: Write>(W);

impl<W: Write> Write for Base<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> Layer for Base<W> {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> Layer for BufWriter<Box<dyn Layer + 'a>> {
    fn close(self: Box<Self>) -> io::Result<()> {
        let inner = (*self).into_inner().map_err(|e| e.into_error())?;
        inner.close()
    }
}

impl<'a> Layer for EncryptWriter<Box<dyn Layer + 'a>> {
    fn close(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.close()
    }
}

impl<'a> Layer for GzEncoder<Box<dyn Layer + 'a>> {
    fn close(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.close()
    }
}

/// The composed writer returned by [`TransformChain::build`].
///
/// Must be closed with [`TransformWriter::close`]; dropping it leaves the
/// output without its trailing bytes.
pub struct TransformWriter<'a> {
    top: Box<dyn Layer + 'a>,
}

impl TransformWriter<'_> {
    pub fn close(self) -> io::Result<()> {
        self.top.close()
    }
}

impl Write for TransformWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.top.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.top.flush()
    }
}

/// Builds transform writers from a keyring and metadata prefix.
pub struct TransformChain<'k> {
    keyring: &'k Keyring,
    prefix: &'k str,
    scrypt_log_n: u8,
}

impl<'k> TransformChain<'k> {
    pub fn new(keyring: &'k Keyring, prefix: &'k str, scrypt_log_n: u8) -> Self {
        Self {
            keyring,
            prefix,
            scrypt_log_n,
        }
    }

    /// Wrap `base` with the transforms in `spec`.
    ///
    /// Nothing is written to `base` before this returns; all construction
    /// errors surface first.
    pub fn build<'a, W: Write + 'a>(
        &self,
        base: W,
        spec: TransformSpec,
    ) -> Result<(TransformWriter<'a>, Metadata), UploadError> {
        let mut metadata = Metadata::new();

        let encryptor = match spec.encryption {
            None => None,
            Some(Encryption::Recipients) => {
                let encryptor = Encryptor::to_recipients(&self.keyring.recipients)?;
                metadata.record_transform(self.prefix, metadata::ENCRYPT, ALGORITHM);
                Some(encryptor)
            }
            Some(Encryption::Passphrase) => {
                let (id, secret) = self
                    .keyring
                    .passphrases
                    .latest()
                    .ok_or_else(|| UploadError::passphrase_not_found("upload"))?;
                let encryptor = Encryptor::with_passphrase(secret, self.scrypt_log_n)?;
                metadata.record_transform(self.prefix, metadata::SCRYPT, ALGORITHM);
                metadata.record_passphrase_id(self.prefix, id);
                debug!(passphrase_id = id, "encrypting with latest passphrase");
                Some(encryptor)
            }
        };

        let mut top: Box<dyn Layer + 'a> = Box::new(Base(base));

        if let Some(encryptor) = encryptor {
            // the encryptor writes in small pieces; buffer them so the base
            // writer is not hit once per piece
            let buffered: Box<dyn Layer + 'a> =
                Box::new(BufWriter::with_capacity(BUFFER_CAPACITY, top));
            top = Box::new(encryptor.wrap_output(buffered)?);
        }

        if spec.compress {
            metadata.record_transform(self.prefix, metadata::COMPRESS, COMPRESSION_ALGORITHM);
            top = Box::new(GzEncoder::new(top, Compression::default()));
        }

        debug!(
            compress = spec.compress,
            encryption = ?spec.encryption,
            attributes = metadata.len(),
            "transform chain built"
        );
        Ok((TransformWriter { top }, metadata))
    }
}
