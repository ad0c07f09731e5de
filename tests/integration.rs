use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use s3bu::{
    config::Config,
    encryptor::{Decryptor, Identity, Recipient},
    key_manager::{KeyManager, Keyring, PassphraseStore},
    metadata::{self, Metadata},
    store::{ByteStream, FsStore, MemoryStore, ObjectStore, PutResult},
    StoreError, TransformSpec, UploadClient, UploadError,
};

const PREFIX: &str = "s3bu";
const TEST_LOG_N: u8 = 10;

fn test_keyring() -> Keyring {
    let mut passphrases = PassphraseStore::new();
    passphrases.add("v1", "correct horse battery staple");
    passphrases.add("v2", "tr0ub4dor&3");
    Keyring::new(vec![Recipient::generate(), Recipient::generate()], passphrases)
}

fn memory_client(keyring: Keyring) -> UploadClient<MemoryStore> {
    UploadClient::new(MemoryStore::new(), "bucket", keyring).with_scrypt_log_n(TEST_LOG_N)
}

/// Undo the transforms recorded in `md`, the way a download would.
fn restore(data: &[u8], md: &Metadata, keyring: &Keyring) -> Result<Vec<u8>> {
    let mut reader: Box<dyn Read + '_> = Box::new(data);

    if md.transform(PREFIX, metadata::ENCRYPT).is_some() {
        reader = Box::new(Decryptor::new(keyring.identities()).open(reader)?);
    } else if md.transform(PREFIX, metadata::SCRYPT).is_some() {
        let id = md.get("s3bu-scrypt-id").context("missing passphrase id")?;
        let secret = keyring
            .passphrases
            .get(id)
            .with_context(|| format!("unknown passphrase id {}", id))?;
        reader = Box::new(Decryptor::new(vec![Identity::passphrase(secret)]).open(reader)?);
    }

    if md.transform(PREFIX, metadata::COMPRESS).is_some() {
        reader = Box::new(GzDecoder::new(reader));
    }

    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Text-like payload that compresses well but is not trivially uniform
fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| b"lorem ipsum dolor sit amet "[i % 27] ^ (i / 4096) as u8).collect()
}

/// Yields zeros, then fails after `remaining` bytes.
struct FailingSource {
    remaining: usize,
}

impl Read for FailingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "source went away"));
        }
        let n = buf.len().min(self.remaining);
        buf[..n].fill(0);
        self.remaining -= n;
        Ok(n)
    }
}

/// Records whether anyone read from it.
struct WatchedSource {
    touched: Arc<AtomicBool>,
}

impl Read for WatchedSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        self.touched.store(true, Ordering::SeqCst);
        Ok(0)
    }
}

/// Reads part of the body, then fails like a dropped connection.
struct FlakyStore {
    fail_after: usize,
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_stream(
        &self,
        _bucket: &str,
        _key: &str,
        mut body: ByteStream,
        _metadata: Metadata,
    ) -> Result<PutResult, StoreError> {
        let mut seen = 0;
        while let Some(chunk) = body.next().await {
            seen += chunk.map_err(StoreError::body)?.len();
            if seen >= self.fail_after {
                return Err(StoreError::Io {
                    source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"),
                });
            }
        }
        Ok(PutResult {
            size_bytes: seen as u64,
        })
    }
}

#[tokio::test]
async fn test_roundtrip_every_transform_combination() -> Result<()> {
    let client = memory_client(test_keyring());
    let data = sample_data(300_000);

    let specs = [
        ("plain", TransformSpec::plain(), 0),
        ("gz", TransformSpec::compressed(), 2),
        ("enc", TransformSpec::encrypted(false), 2),
        ("gz-enc", TransformSpec::encrypted(true), 4),
        ("pass", TransformSpec::passphrase(false), 3),
        ("gz-pass", TransformSpec::passphrase(true), 5),
    ];

    for (key, spec, attributes) in specs {
        let written = client.upload_with(key, Cursor::new(data.clone()), spec).await?;

        let obj = client.store().get("bucket", key).context("object missing")?;
        assert_eq!(obj.data.len() as u64, written, "{}", key);
        assert_eq!(obj.metadata.len(), attributes, "{}", key);
        assert_eq!(restore(&obj.data, &obj.metadata, client.keyring())?, data, "{}", key);
    }
    Ok(())
}

#[tokio::test]
async fn test_compressed_zeros_match_reference_gzip() -> Result<()> {
    let client = memory_client(Keyring::default());
    let zeros = vec![0u8; 8192];

    let written = client.upload_compressed("zeros", Cursor::new(zeros.clone())).await?;

    let mut reference = GzEncoder::new(Vec::new(), Compression::default());
    reference.write_all(&zeros)?;
    let reference = reference.finish()?;

    let obj = client.store().get("bucket", "zeros").context("object missing")?;
    assert_eq!(written, reference.len() as u64);
    assert_eq!(obj.data.len() as u64, written);

    let attrs: Vec<(&str, &str)> = obj.metadata.iter().collect();
    assert_eq!(
        attrs,
        vec![("s3bu-compress", "gzip"), ("s3bu-compress-version", "001")]
    );

    let mut plain = Vec::new();
    GzDecoder::new(&obj.data[..]).read_to_end(&mut plain)?;
    assert_eq!(plain, zeros);
    Ok(())
}

#[tokio::test]
async fn test_passphrase_without_store_is_immediate() -> Result<()> {
    let keyring = Keyring::new(vec![Recipient::generate()], PassphraseStore::new());
    let client = memory_client(keyring);
    let touched = Arc::new(AtomicBool::new(false));

    let err = client
        .upload_with_passphrase(
            "secret",
            WatchedSource {
                touched: touched.clone(),
            },
            true,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::PassphraseNotFound { .. }));
    assert!(!touched.load(Ordering::SeqCst));
    assert_eq!(client.store().put_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_source_failure_is_returned_and_nothing_stored() -> Result<()> {
    let tmp = TempDir::new()?;
    let fs_client = UploadClient::new(FsStore::new(tmp.path()), "bucket", test_keyring());
    let mem_client = memory_client(test_keyring());

    for compress in [false, true] {
        let err = fs_client
            .upload_encrypted("broken", FailingSource { remaining: 200_000 }, compress)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "I/O error: source went away");

        let err = mem_client
            .upload_with("broken", FailingSource { remaining: 5 }, TransformSpec::plain())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Io(_)));
    }

    assert!(!fs_client.store().exists("bucket", "broken").await);
    assert!(fs_client.store().list("bucket").await?.is_empty());
    assert!(mem_client.store().get("bucket", "broken").is_none());
    Ok(())
}

#[tokio::test]
async fn test_transport_error_surfaces_as_store_error() -> Result<()> {
    let client = UploadClient::new(FlakyStore { fail_after: 64 * 1024 }, "bucket", Keyring::default());

    let err = client
        .upload("big", Cursor::new(sample_data(1_000_000)))
        .await
        .unwrap_err();

    // the store hung up mid-body, so the producer saw a broken conduit first
    assert!(matches!(err, UploadError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));

    // a store that fails only after draining reports its own error
    let client = UploadClient::new(FlakyStore { fail_after: 10 }, "bucket", Keyring::default());
    let err = client.upload("tiny", Cursor::new(vec![1u8; 10])).await.unwrap_err();
    match err {
        UploadError::Store {
            written,
            source: StoreError::Io { source },
        } => {
            assert_eq!(written, 10);
            assert_eq!(source.kind(), io::ErrorKind::ConnectionReset)
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_fs_store_persists_metadata_sidecars() -> Result<()> {
    let tmp = TempDir::new()?;
    let keyring = test_keyring();
    let client = UploadClient::new(FsStore::new(tmp.path()), "bucket", keyring)
        .with_scrypt_log_n(TEST_LOG_N);
    let data = sample_data(100_000);

    client.upload_compressed("docs/a.txt", Cursor::new(data.clone())).await?;
    client
        .upload_with_passphrase("docs/b.txt", Cursor::new(data.clone()), true)
        .await?;
    client.upload("c.bin", Cursor::new(data.clone())).await?;

    let records = client.store().list("bucket").await?;
    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["c.bin", "docs/a.txt", "docs/b.txt"]);

    let b = &records[2];
    assert_eq!(b.metadata.get("s3bu-scrypt-id"), Some("v2"));
    assert_eq!(b.metadata.get("s3bu-compress"), Some("gzip"));

    let stored = client.store().get("bucket", "docs/b.txt").await?;
    assert_eq!(stored.len() as u64, b.size);
    assert_eq!(restore(&stored, &b.metadata, client.keyring())?, data);

    assert!(tmp.path().join("bucket/docs/a.txt.meta.json").exists());
    assert!(records[0].metadata.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fs_store_rejected_target_leaves_no_files() -> Result<()> {
    let tmp = TempDir::new()?;
    let client = UploadClient::new(FsStore::new(tmp.path()), "bucket", Keyring::default());
    std::fs::create_dir_all(tmp.path().join("bucket/x/occupied"))?;

    let err = client.upload("x", Cursor::new(vec![7u8; 1000])).await.unwrap_err();

    // the body was fully streamed before the rename failed
    match err {
        UploadError::Store {
            written,
            source: StoreError::Io { .. },
        } => assert_eq!(written, 1000),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!tmp.path().join("bucket/x.partial").exists());
    assert!(!tmp.path().join("bucket/x.meta.json").exists());
    assert!(client.store().list("bucket").await?.iter().all(|r| r.key != "x"));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_uploads() -> Result<()> {
    let tmp = TempDir::new()?;
    let client = UploadClient::new(FsStore::new(tmp.path()), "bucket", test_keyring());

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let data = vec![i as u8; 50_000 + i * 1000];
            client
                .upload_encrypted(&format!("obj-{}", i), Cursor::new(data), i % 2 == 0)
                .await
        }));
    }

    for handle in handles {
        handle.await??;
    }

    let records = client.store().list("bucket").await?;
    assert_eq!(records.len(), 8);

    for (i, record) in records.iter().enumerate() {
        let data = client.store().get("bucket", &record.key).await?;
        let plain = restore(&data, &record.metadata, client.keyring())?;
        assert_eq!(plain, vec![i as u8; 50_000 + i * 1000]);
    }
    Ok(())
}

#[tokio::test]
async fn test_passphrase_rotation_keeps_old_objects_readable() -> Result<()> {
    let mut passphrases = PassphraseStore::new();
    passphrases.add("2023", "old secret");
    let client = memory_client(Keyring::new(Vec::new(), passphrases));
    client
        .upload_with_passphrase("before", Cursor::new(b"sealed in 2023".to_vec()), false)
        .await?;

    let mut passphrases = PassphraseStore::new();
    passphrases.add("2023", "old secret");
    passphrases.add("2024", "new secret");
    let rotated = UploadClient::from_shared(
        client.store().clone(),
        "bucket",
        Arc::new(Keyring::new(Vec::new(), passphrases)),
    )
    .with_scrypt_log_n(TEST_LOG_N);
    rotated
        .upload_with_passphrase("after", Cursor::new(b"sealed in 2024".to_vec()), false)
        .await?;

    let before = client.store().get("bucket", "before").context("missing")?;
    let after = client.store().get("bucket", "after").context("missing")?;
    assert_eq!(before.metadata.get("s3bu-scrypt-id"), Some("2023"));
    assert_eq!(after.metadata.get("s3bu-scrypt-id"), Some("2024"));

    assert_eq!(restore(&before.data, &before.metadata, rotated.keyring())?, b"sealed in 2023");
    assert_eq!(restore(&after.data, &after.metadata, rotated.keyring())?, b"sealed in 2024");
    Ok(())
}

#[tokio::test]
async fn test_client_from_config_encrypts_to_key_file() -> Result<()> {
    let tmp = TempDir::new()?;
    let key_path = tmp.path().join("recipient.key");
    KeyManager::generate(&key_path).await?;

    let mut cfg = Config::new(tmp.path().join("storage").to_string_lossy(), "archive");
    cfg.recipient_keys.push(key_path.to_string_lossy().to_string());
    cfg.scrypt_log_n = TEST_LOG_N;
    cfg.validate()?;

    let client = UploadClient::from_config(&cfg).await?;
    let data = sample_data(70_000);
    client.upload_encrypted("k", Cursor::new(data.clone()), true).await?;

    let record = client.store().head("archive", "k").await?;
    let stored = client.store().get("archive", "k").await?;

    // a fresh keyring loaded from the same key file can read it back
    let reader_keyring = Keyring::new(
        vec![KeyManager::load(&key_path).await?.recipient()],
        PassphraseStore::new(),
    );
    assert_eq!(restore(&stored, &record.metadata, &reader_keyring)?, data);

    // a different key cannot
    let stranger = Keyring::new(vec![Recipient::generate()], PassphraseStore::new());
    assert!(restore(&stored, &record.metadata, &stranger).is_err());
    Ok(())
}
