//! Two-phase upload orchestration.
//!
//! An upload runs as two concurrent phases joined by a zero-capacity
//! [conduit](crate::conduit):
//!
//! - **Phase 1** (producer) builds the transform chain over the conduit's
//!   writer, hands the resulting metadata to Phase 2, copies the source through
//!   the chain and closes it. It blocks on the conduit, so it runs on the
//!   blocking pool.
//! - **Phase 2** (uploader) waits for the metadata or a cancellation signal.
//!   With metadata it streams the conduit's reader into
//!   [`ObjectStore::put_stream`]; on cancellation it never touches the store.
//!
//! A Phase 1 failure cancels Phase 2, fails the conduit so an in-flight
//! `put_stream` sees an error instead of a clean end of object, waits for
//! Phase 2 to finish and returns the Phase 1 error. Phase 2's error only
//! reaches the caller when Phase 1 succeeded.

use crate::conduit::{self, PipeWriter};
use crate::counter::{CountingReader, CountingWriter};
use crate::error::{StoreError, UploadError};
use crate::key_manager::Keyring;
use crate::metadata::Metadata;
use crate::store::{ObjectStore, PutResult};
use crate::transform::{Encryption, TransformChain, TransformSpec};
use std::io::{self, Read};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What Phase 2 reports back to the coordinator.
#[derive(Debug)]
enum Phase2Outcome {
    /// Cancelled before metadata arrived; the store was never called
    Cancelled,
    Completed(Result<PutResult, StoreError>),
}

/// Drives a single upload. Build one per object.
pub struct UploadCoordinator<S: ObjectStore + ?Sized> {
    store: Arc<S>,
    keyring: Arc<Keyring>,
    bucket: String,
    prefix: String,
    scrypt_log_n: u8,
}

impl<S: ObjectStore + ?Sized + 'static> UploadCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        keyring: Arc<Keyring>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        scrypt_log_n: u8,
    ) -> Self {
        Self {
            store,
            keyring,
            bucket: bucket.into(),
            prefix: prefix.into(),
            scrypt_log_n,
        }
    }

    /// Upload everything `source` yields to `key` with the transforms in
    /// `spec`. Returns the number of transformed bytes pushed to the store.
    pub async fn run<R>(self, key: &str, source: R, spec: TransformSpec) -> Result<u64, UploadError>
    where
        R: Read + Send + 'static,
    {
        if spec.encryption == Some(Encryption::Passphrase) && self.keyring.passphrases.is_empty() {
            return Err(UploadError::passphrase_not_found("upload"));
        }

        info!(
            bucket = %self.bucket,
            key,
            compress = spec.compress,
            encryption = ?spec.encryption,
            "upload started"
        );

        let (reader, writer) = conduit::pipe();
        let writer_closer = writer.closer();
        let reader_closer = reader.closer();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (metadata_tx, metadata_rx) = oneshot::channel::<Metadata>();
        let (result_tx, result_rx) = oneshot::channel::<Phase2Outcome>();

        let store = self.store.clone();
        let bucket = self.bucket.clone();
        let object_key = key.to_string();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                metadata = metadata_rx => match metadata {
                    Ok(metadata) => {
                        debug!(attributes = metadata.len(), "metadata received, streaming to store");
                        let result = store
                            .put_stream(&bucket, &object_key, Box::pin(reader), metadata)
                            .await;
                        Phase2Outcome::Completed(result)
                    }
                    // producer went away without sending
                    Err(_) => Phase2Outcome::Cancelled,
                },
                Ok(()) = cancel_rx => Phase2Outcome::Cancelled,
            };
            reader_closer.close();
            let _ = result_tx.send(outcome);
        });

        let keyring = self.keyring.clone();
        let prefix = self.prefix.clone();
        let scrypt_log_n = self.scrypt_log_n;
        let producer = tokio::task::spawn_blocking(move || {
            let mut base = CountingWriter::new(writer);
            let result = produce(&mut base, &keyring, &prefix, scrypt_log_n, source, spec, metadata_tx);
            if let Err(e) = &result {
                // fail the conduit before the writer drops and closes it cleanly
                base.get_ref().close_with_error(&conduit_error(e));
            }
            result
        });

        let phase1 = match producer.await {
            Ok(result) => result,
            Err(e) => Err(UploadError::task(format!("transform task failed: {}", e))),
        };

        match phase1 {
            Err(err) => {
                let _ = cancel_tx.send(());
                writer_closer.close_with_error(&conduit_error(&err));
                match result_rx.await {
                    Ok(Phase2Outcome::Completed(Err(e))) => {
                        warn!(key, error = %e, "store error discarded in favour of producer error");
                    }
                    discarded => debug!(phase2 = ?discarded, "upload task drained after producer failure"),
                }
                warn!(key, error = %err, "upload failed");
                Err(err)
            }
            Ok(written) => {
                writer_closer.close();
                drop(cancel_tx);
                match result_rx.await {
                    Ok(Phase2Outcome::Completed(Ok(put))) => {
                        info!(key, written, stored = put.size_bytes, "upload complete");
                        Ok(written)
                    }
                    Ok(Phase2Outcome::Completed(Err(e))) => {
                        warn!(key, written, error = %e, "store rejected upload");
                        Err(UploadError::store(written, e))
                    }
                    Ok(Phase2Outcome::Cancelled) => {
                        Err(UploadError::task("upload task cancelled after producer succeeded"))
                    }
                    Err(_) => Err(UploadError::task("upload task exited without reporting")),
                }
            }
        }
    }
}

/// Phase 1 body. Returns the transformed byte count.
fn produce<R: Read>(
    base: &mut CountingWriter<PipeWriter>,
    keyring: &Keyring,
    prefix: &str,
    scrypt_log_n: u8,
    source: R,
    spec: TransformSpec,
    metadata_tx: oneshot::Sender<Metadata>,
) -> Result<u64, UploadError> {
    let closer = base.get_ref().closer();
    let chain = TransformChain::new(keyring, prefix, scrypt_log_n);
    let (mut out, metadata) = chain.build(&mut *base, spec)?;

    metadata_tx
        .send(metadata)
        .map_err(|_| UploadError::task("upload task exited before metadata was sent"))?;

    let mut source = CountingReader::new(source);
    if let Err(e) = io::copy(&mut source, &mut out) {
        // dropping the chain flushes its layers; make those writes fail fast
        closer.close_with_error(&e);
        return Err(e.into());
    }
    out.close()?;

    debug!(
        source_bytes = source.total_bytes(),
        source_reads = source.total_reads(),
        written = base.total_bytes(),
        writes = base.total_writes(),
        "source drained"
    );
    Ok(base.total_bytes())
}

fn conduit_error(err: &UploadError) -> io::Error {
    match err {
        UploadError::Io(e) => io::Error::new(e.kind(), e.to_string()),
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}
