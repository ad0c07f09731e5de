//! Chunked payload encryption for the encrypted object format.
//!
//! [`EncryptWriter`] seals plaintext in chunks as it is written, so the whole
//! object is never held in memory. [`DecryptReader`] reverses it.
//!
//! ## Payload Format
//!
//! ```text
//! [chunk1][chunk2]...[final chunk]
//!
//! Each chunk:
//! [flag:1][nonce:24][length:4][encrypted_data]
//! ```
//!
//! The flag is `0` for a full chunk with more to follow and `1` for the final
//! chunk, which may be short or empty. The chunk index and flag are bound as
//! associated data, so dropped, reordered or truncated chunks fail to open.

use chacha20poly1305::aead::{Aead, AeadCore, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use std::io::{self, Read, Write};

/// Chunk size for streaming encryption (64KB)
/// Balances memory usage vs. overhead from per-chunk nonces and tags
pub const CHUNK_SIZE: usize = 64 * 1024;

pub const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;

fn chunk_aad(index: u64, flag: u8) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = flag;
    aad
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Writer that encrypts everything written to it into chunks on `inner`.
///
/// The final chunk is only emitted by [`EncryptWriter::finish`]; dropping the
/// writer without finishing leaves a stream that will not decrypt.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: XChaCha20Poly1305,
    buffer: Vec<u8>,
    index: u64,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(inner: W, cipher: XChaCha20Poly1305) -> Self {
        Self {
            inner,
            cipher,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            index: 0,
        }
    }

    /// Seal the buffered plaintext as the final chunk and hand back `inner`.
    pub fn finish(mut self) -> io::Result<W> {
        self.seal_chunk(FLAG_LAST)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn seal_chunk(&mut self, flag: u8) -> io::Result<()> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = chunk_aad(self.index, flag);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &self.buffer,
                    aad: &aad,
                },
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("encryption failed: {}", e)))?;

        self.inner.write_all(&[flag])?;
        self.inner.write_all(&nonce)?;
        self.inner.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;

        self.buffer.clear();
        self.index += 1;
        Ok(())
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // A full buffer is only sealed once more data shows up, so the last
        // chunk is always the one `finish` writes.
        if self.buffer.len() == CHUNK_SIZE {
            self.seal_chunk(FLAG_MORE)?;
        }
        let take = buf.len().min(CHUNK_SIZE - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that yields the plaintext of a chunked payload.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: XChaCha20Poly1305,
    plaintext: Vec<u8>,
    pos: usize,
    index: u64,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, cipher: XChaCha20Poly1305) -> Self {
        Self {
            inner,
            cipher,
            plaintext: Vec::new(),
            pos: 0,
            index: 0,
            done: false,
        }
    }

    fn open_chunk(&mut self) -> io::Result<()> {
        let mut flag = [0u8; 1];
        match self.inner.read_exact(&mut flag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(invalid_data("encrypted stream truncated: final chunk missing"));
            }
            Err(e) => return Err(e),
        }
        let flag = flag[0];
        if flag != FLAG_MORE && flag != FLAG_LAST {
            return Err(invalid_data(format!("invalid chunk flag: {}", flag)));
        }

        let mut nonce_buf = [0u8; NONCE_LEN];
        self.inner.read_exact(&mut nonce_buf)?;
        #[allow(deprecated)]
        let nonce = XNonce::from_slice(&nonce_buf);

        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf)?;
        let chunk_len = u32::from_be_bytes(len_buf) as usize;
        if chunk_len < TAG_LEN || chunk_len > CHUNK_SIZE + TAG_LEN {
            return Err(invalid_data(format!("invalid chunk length: {}", chunk_len)));
        }

        let mut ciphertext = vec![0u8; chunk_len];
        self.inner.read_exact(&mut ciphertext)?;

        let aad = chunk_aad(self.index, flag);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| invalid_data(format!("decryption failed: {}", e)))?;

        if flag == FLAG_MORE && plaintext.len() != CHUNK_SIZE {
            return Err(invalid_data("short chunk before final chunk"));
        }

        if flag == FLAG_LAST {
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? != 0 {
                return Err(invalid_data("trailing data after final chunk"));
            }
            self.done = true;
        }

        self.plaintext = plaintext;
        self.pos = 0;
        self.index += 1;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plaintext.len() {
                let n = buf.len().min(self.plaintext.len() - self.pos);
                buf[..n].copy_from_slice(&self.plaintext[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.open_chunk()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chacha20poly1305::KeyInit;
    use std::io::Cursor;

    fn make_cipher() -> XChaCha20Poly1305 {
        let key = [0x42u8; 32];
        XChaCha20Poly1305::new_from_slice(&key).expect("valid key")
    }

    fn seal(plaintext: &[u8]) -> Vec<u8> {
        let mut writer = EncryptWriter::new(Vec::new(), make_cipher());
        writer.write_all(plaintext).expect("write failed");
        writer.finish().expect("finish failed")
    }

    fn open(sealed: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut reader = DecryptReader::new(Cursor::new(sealed), make_cipher());
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_stream_round_trip_small() {
        let plaintext = b"hello world, this is a test message";
        let out = open(seal(plaintext)).expect("decryption failed");
        assert_eq!(out, plaintext);
    }

    #[test]
    fn test_stream_round_trip_large() {
        // Larger than CHUNK_SIZE to cover multiple chunks
        let plaintext = vec![0x42u8; CHUNK_SIZE * 3 + 1000];
        let sealed = seal(&plaintext);

        let overhead = 1 + NONCE_LEN + 4 + TAG_LEN;
        assert_eq!(sealed.len(), plaintext.len() + 4 * overhead);
        assert_eq!(open(sealed).expect("decryption failed"), plaintext);
    }

    #[test]
    fn test_exact_chunk_multiple_seals_full_final_chunk() {
        let plaintext = vec![9u8; CHUNK_SIZE * 2];
        let sealed = seal(&plaintext);

        let overhead = 1 + NONCE_LEN + 4 + TAG_LEN;
        assert_eq!(sealed.len(), plaintext.len() + 2 * overhead);
        assert_eq!(open(sealed).expect("decryption failed"), plaintext);
    }

    #[test]
    fn test_empty_stream_round_trip() {
        let out = open(seal(b"")).expect("decryption failed");
        assert!(out.is_empty());
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let plaintext = vec![1u8; CHUNK_SIZE + 10];
        let mut sealed = seal(&plaintext);

        // drop the final chunk entirely
        let overhead = 1 + NONCE_LEN + 4 + TAG_LEN;
        sealed.truncate(CHUNK_SIZE + overhead);

        let err = open(sealed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_tampered_chunk_is_rejected() {
        let mut sealed = seal(b"secret data");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(open(sealed).is_err());
    }

    #[test]
    fn test_trailing_data_is_rejected() {
        let mut sealed = seal(b"secret data");
        sealed.push(0);

        let err = open(sealed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
