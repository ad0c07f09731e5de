//! Byte-counting wrappers for readers and writers.
//!
//! [`CountingWriter`] sits at the bottom of the transform stack during an
//! upload so the caller learns how many transformed bytes actually went into
//! the conduit. [`CountingReader`] wraps the source for the matching
//! plaintext figure.
//!
//! Counters are updated only after a successful call and are never reset;
//! build a new wrapper to start over. Neither type locks: one owner drives
//! an instance at a time.

use std::io::{self, Read, Write};

/// Counts successful writes and the bytes they accepted.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    writes: usize,
    bytes: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            writes: 0,
            bytes: 0,
        }
    }

    /// Number of successful `write` calls, zero-length ones included
    pub fn total_writes(&self) -> usize {
        self.writes
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.writes += 1;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Counts successful reads and the bytes they returned.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    reads: usize,
    bytes: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            reads: 0,
            bytes: 0,
        }
    }

    /// Number of successful `read` calls, end-of-stream reads included
    pub fn total_reads(&self) -> usize {
        self.reads
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.reads += 1;
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BLOCK: usize = 1024;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "sink is gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts at most 10 bytes per call
    struct ShortWriter(Vec<u8>);

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(10);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_counter_is_zero_when_created() {
        let wc = CountingWriter::new(Vec::new());
        assert_eq!(wc.total_writes(), 0);
        assert_eq!(wc.total_bytes(), 0);
    }

    #[test]
    fn test_one_write_counts_one() {
        let mut wc = CountingWriter::new(Vec::new());
        let data = vec![0u8; BLOCK];

        let n = wc.write(&data).expect("write failed");

        assert_eq!(n, BLOCK);
        assert_eq!(wc.total_writes(), 1);
        assert_eq!(wc.total_bytes(), BLOCK as u64);
    }

    #[test]
    fn test_five_writes_count_five() {
        let mut wc = CountingWriter::new(Vec::new());
        let data = vec![0u8; BLOCK];

        for _ in 0..5 {
            let n = wc.write(&data).expect("write failed");
            assert_eq!(n, BLOCK);
        }

        assert_eq!(wc.total_writes(), 5);
        assert_eq!(wc.total_bytes(), 5 * BLOCK as u64);
        assert_eq!(wc.into_inner().len(), 5 * BLOCK);
    }

    #[test]
    fn test_zero_length_write_counts_operation_only() {
        let mut wc = CountingWriter::new(Vec::new());
        wc.write(&[]).expect("write failed");

        assert_eq!(wc.total_writes(), 1);
        assert_eq!(wc.total_bytes(), 0);
    }

    #[test]
    fn test_failed_write_is_not_counted() {
        let mut wc = CountingWriter::new(FailingWriter);
        let err = wc.write(b"data").unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(err.to_string(), "sink is gone");
        assert_eq!(wc.total_writes(), 0);
        assert_eq!(wc.total_bytes(), 0);
    }

    #[test]
    fn test_short_write_counts_accepted_bytes() {
        let mut wc = CountingWriter::new(ShortWriter(Vec::new()));
        let n = wc.write(&[1u8; 64]).expect("write failed");

        assert_eq!(n, 10);
        assert_eq!(wc.total_bytes(), 10);

        // write_all loops over the remaining 54 bytes
        wc.write_all(&[1u8; 54]).expect("write_all failed");
        assert_eq!(wc.total_writes(), 7);
        assert_eq!(wc.total_bytes(), 64);
        assert_eq!(wc.get_ref().0.len(), 64);
    }

    #[test]
    fn test_read_counter_is_zero_when_created() {
        let rc = CountingReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(rc.total_reads(), 0);
        assert_eq!(rc.total_bytes(), 0);
    }

    #[test]
    fn test_one_read_counts_one() {
        let mut rc = CountingReader::new(Cursor::new(vec![0u8; 8192]));
        let mut buf = vec![0u8; BLOCK];

        let n = rc.read(&mut buf).expect("read failed");

        assert_eq!(n, BLOCK);
        assert_eq!(rc.total_reads(), 1);
        assert_eq!(rc.total_bytes(), BLOCK as u64);
    }

    #[test]
    fn test_five_reads_count_five() {
        let mut rc = CountingReader::new(Cursor::new(vec![0u8; 8192]));
        let mut buf = vec![0u8; BLOCK];

        for _ in 0..5 {
            let n = rc.read(&mut buf).expect("read failed");
            assert_eq!(n, BLOCK);
        }

        assert_eq!(rc.total_reads(), 5);
        assert_eq!(rc.total_bytes(), 5 * BLOCK as u64);
    }

    #[test]
    fn test_reads_past_end_follow_source() {
        let mut rc = CountingReader::new(Cursor::new(vec![7u8; 2500]));
        let mut buf = vec![0u8; BLOCK];

        assert_eq!(rc.read(&mut buf).unwrap(), BLOCK);
        assert_eq!(rc.read(&mut buf).unwrap(), BLOCK);
        // partial read, then end of stream
        assert_eq!(rc.read(&mut buf).unwrap(), 452);
        assert_eq!(rc.read(&mut buf).unwrap(), 0);

        assert_eq!(rc.total_reads(), 4);
        assert_eq!(rc.total_bytes(), 2500);
    }
}
