//! Incremental integrity digest for transfer verification.
//!
//! Both ends of a transfer hash the exact bytes that cross the wire,
//! in order, and compare hex digests. The digest is xxHash64; the hex
//! form is what travels in headers and completion results.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh64::Xxh64;

/// Accumulating wire digest.
///
/// Feed it exactly the bytes the remote side will independently hash,
/// in the same order. That equivalence is the integrity contract of
/// the whole pipeline.
pub struct StreamDigest {
    inner: Xxh64,
}

impl std::fmt::Debug for StreamDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDigest").finish_non_exhaustive()
    }
}

impl StreamDigest {
    /// Create an empty digest.
    pub fn new() -> Self {
        Self { inner: Xxh64::new(0) }
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Current digest as a lowercase hex string (16 chars).
    pub fn finish_hex(&self) -> String {
        hex::encode(self.inner.digest().to_be_bytes())
    }
}

impl Default for StreamDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot digest of a byte slice, hex-encoded.
pub fn digest_hex(data: &[u8]) -> String {
    let mut d = StreamDigest::new();
    d.update(data);
    d.finish_hex()
}

/// Writer tee that digests every byte it forwards to the inner sink.
///
/// Sits directly above the pipe in the upload chain, so the digest
/// covers exactly the bytes handed to the transport.
#[derive(Debug)]
pub struct DigestWriter<W: Write> {
    inner: W,
    digest: StreamDigest,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digest: StreamDigest::new(),
        }
    }

    /// Unwind into the inner sink and the accumulated digest.
    pub fn into_parts(self) -> (W, StreamDigest) {
        (self.inner, self.digest)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Shared digest handle for the download read path.
///
/// The decrypt/decompress layers consume the reader by value, so the
/// digest state is shared out through a handle instead of unwound.
/// Only one task ever advances it; the lock is uncontended.
#[derive(Debug, Clone)]
pub struct SharedDigest(Arc<Mutex<StreamDigest>>);

impl SharedDigest {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(StreamDigest::new())))
    }

    pub fn update(&self, data: &[u8]) {
        self.0.lock().expect("digest lock poisoned").update(data);
    }

    pub fn finish_hex(&self) -> String {
        self.0.lock().expect("digest lock poisoned").finish_hex()
    }
}

impl Default for SharedDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader tee that digests raw bytes as they are pulled from the
/// source, before any decryption or decompression is applied.
///
/// This is the download-side half of the checksum-altitude contract:
/// the server's declared digest was computed over the wire bytes it
/// sent, so hashing must happen at the same altitude here.
#[derive(Debug)]
pub struct DigestReader<R: Read> {
    inner: R,
    digest: SharedDigest,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: SharedDigest::new(),
        }
    }

    /// Handle to the digest, usable after the reader has been consumed
    /// by downstream transform layers.
    pub fn digest(&self) -> SharedDigest {
        self.digest.clone()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}
