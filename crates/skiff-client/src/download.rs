//! Streaming file download with end-to-end verification.
//!
//! The response body is pumped from the async stream into a blocking
//! pipe, pulled through the mirror transform chain (digest the raw
//! bytes, then decrypt, then decompress) on a worker task, and the
//! raw-body digest is compared against the server's declared checksum
//! once the stream ends.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Method;
use tracing::{debug, warn};

use skiff_core::chain::DownloadChain;
use skiff_core::cipher::{Cipher, CipherSpec};
use skiff_core::pipe::{body_pipe, BodyReader};
use skiff_core::{CancelToken, Error, Result, DEFAULT_BUFFER_SIZE};

use crate::progress::{CountingWriter, ProgressObserver};
use crate::rest::{
    check_response, header_value, transport_error, DownloadQuery, Endpoint, FileAttributes,
    HEADER_CHECKSUM, HEADER_CONTENT_LENGTH, HEADER_ENCRYPTION, HEADER_FILE_ID, HEADER_FILE_NAME,
};
use crate::Client;

/// Lifecycle of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Query sent, response not yet validated.
    Requested,
    /// Response headers parsed and validated.
    HeadersValidated,
    /// Body bytes are flowing through the chain.
    Streaming,
    /// Stream finished and the digest matched the server's.
    Verified,
    /// Stream finished; no verification was possible or it was
    /// explicitly skipped.
    Unverified,
    /// Stream finished but the digests disagree.
    Mismatched,
    /// The transfer ended with an error.
    Failed,
}

/// Whether the finished download was integrity-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Local and server digests matched.
    Verified,
    /// No server digest was available, or checking was disabled.
    Skipped,
}

/// Outcome of a finished download.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    /// Bytes written to the local sink (after decrypt/decompress).
    pub bytes: u64,
    /// Hex digest of the raw body bytes as received.
    pub local_checksum: String,
    /// Digest the server declared, when it sent one.
    pub server_checksum: Option<String>,
    pub verification: Verification,
}

/// Metadata parsed from the download response headers.
#[derive(Debug, Clone)]
pub struct DownloadMeta {
    /// Server-side name of the file. Always present.
    pub filename: String,
    pub file_id: Option<u64>,
    pub size: Option<u64>,
    /// Cipher name the stream was encrypted with, if any.
    pub encryption: Option<String>,
    /// Wire digest declared by the server, if any.
    pub checksum: Option<String>,
}

/// Parse and validate response headers. A missing filename means the
/// response is not a file stream at all.
pub(crate) fn parse_meta(headers: &reqwest::header::HeaderMap) -> Result<DownloadMeta> {
    let filename = header_value(headers, HEADER_FILE_NAME).unwrap_or_default();
    if filename.is_empty() {
        return Err(Error::Protocol {
            message: "download response carries no filename header".into(),
        });
    }

    Ok(DownloadMeta {
        filename,
        file_id: header_value(headers, HEADER_FILE_ID).and_then(|v| v.parse().ok()),
        size: header_value(headers, HEADER_CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        encryption: header_value(headers, HEADER_ENCRYPTION).filter(|v| !v.is_empty()),
        checksum: header_value(headers, HEADER_CHECKSUM).filter(|v| !v.is_empty()),
    })
}

/// Builder describing one download.
pub struct DownloadRequest<'a> {
    client: &'a Client,
    file_id: u64,
    name: String,
    namespace: String,
    decrypt: bool,
    key: Option<Vec<u8>>,
    extract: bool,
    ignore_checksum: bool,
    buffer_size: usize,
    cancel: CancelToken,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl<'a> DownloadRequest<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self {
            client,
            file_id: 0,
            name: String::new(),
            namespace: "default".into(),
            decrypt: true,
            key: None,
            extract: false,
            ignore_checksum: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel: CancelToken::new(),
            observer: None,
        }
    }

    /// Select the file by server id.
    pub fn by_id(mut self, file_id: u64) -> Self {
        self.file_id = file_id;
        self
    }

    /// Select the file by name within a namespace.
    pub fn by_name(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.name = name.into();
        self.namespace = namespace.into();
        self
    }

    /// Key material for decrypting an encrypted stream. The cipher is
    /// taken from the response headers.
    pub fn decrypt_with(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    /// Save the raw wire bytes without decrypting, even when the
    /// server declares a cipher.
    pub fn no_decrypt(mut self) -> Self {
        self.decrypt = false;
        self
    }

    /// Gunzip the stream after decryption.
    pub fn extract(mut self) -> Self {
        self.extract = true;
        self
    }

    /// Skip checksum comparison even when the server declares one.
    pub fn ignore_checksum(mut self) -> Self {
        self.ignore_checksum = true;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.buffer_size = size;
        }
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Send the query and validate the response headers. The body is
    /// not consumed until `save_to` is called on the result.
    pub async fn fetch(self) -> Result<DownloadResponse> {
        let query = DownloadQuery {
            file_id: self.file_id,
            name: self.name.clone(),
            attributes: FileAttributes::in_namespace(self.namespace.clone()),
        };

        debug!(file_id = self.file_id, name = %self.name, "requesting download");

        let resp = self
            .client
            .rest
            .request(Method::POST, Endpoint::FileGet)
            .json(&query)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_response(resp).await?;

        let meta = parse_meta(resp.headers())?;
        debug!(
            filename = %meta.filename,
            encryption = meta.encryption.as_deref(),
            has_checksum = meta.checksum.is_some(),
            "download headers validated"
        );

        Ok(DownloadResponse {
            meta,
            body: Some(resp),
            state: DownloadState::HeadersValidated,
            options: DownloadOptions {
                decrypt: self.decrypt,
                key: self.key,
                extract: self.extract,
                ignore_checksum: self.ignore_checksum,
                buffer_size: self.buffer_size,
                cancel: self.cancel,
                observer: self.observer,
            },
        })
    }
}

pub(crate) struct DownloadOptions {
    pub(crate) decrypt: bool,
    pub(crate) key: Option<Vec<u8>>,
    pub(crate) extract: bool,
    pub(crate) ignore_checksum: bool,
    pub(crate) buffer_size: usize,
    pub(crate) cancel: CancelToken,
    pub(crate) observer: Option<Arc<dyn ProgressObserver>>,
}

/// A validated download whose body is ready to stream.
pub struct DownloadResponse {
    meta: DownloadMeta,
    body: Option<reqwest::Response>,
    state: DownloadState,
    options: DownloadOptions,
}

impl DownloadResponse {
    pub fn meta(&self) -> &DownloadMeta {
        &self.meta
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Stream the body into `sink`, applying decryption and
    /// decompression as configured, then verify the digest.
    ///
    /// On a checksum mismatch the sink keeps whatever was written;
    /// the caller decides whether to discard it.
    pub async fn save_to<W>(&mut self, sink: W) -> Result<DownloadSummary>
    where
        W: Write + Send + 'static,
    {
        let body = self.body.take().ok_or(Error::Protocol {
            message: "download body already consumed".into(),
        })?;

        // Resolve the cipher before any byte reaches the sink, so a
        // missing key never produces a partial ciphertext file.
        let spec = self.resolve_cipher()?;

        self.state = DownloadState::Streaming;
        let (tx, reader) = body_pipe();
        let mut stream = body.bytes_stream();
        let pump = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let chunk = item.map_err(std::io::Error::other);
                if tx.send(chunk).await.is_err() {
                    // Consumer bailed; stop pulling the body.
                    break;
                }
            }
        });

        let extract = self.options.extract;
        let buffer_size = self.options.buffer_size;
        let cancel = self.options.cancel.clone();
        let observer = self.options.observer.clone();
        let copied = tokio::task::spawn_blocking(move || {
            run_copy(
                reader,
                sink,
                spec.as_ref(),
                extract,
                buffer_size,
                &cancel,
                observer,
            )
        })
        .await
        .map_err(|e| Error::Protocol {
            message: format!("download worker panicked: {e}"),
        })?;
        let _ = pump.await;

        let outcome = match copied {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = DownloadState::Failed;
                return Err(e);
            }
        };

        self.verify(outcome)
    }

    /// Stream into a local file. With `append_filename` the server's
    /// filename is appended to `path` as a directory entry.
    pub async fn save_to_file(
        &mut self,
        path: impl AsRef<Path>,
        append_filename: bool,
    ) -> Result<DownloadSummary> {
        let mut path = path.as_ref().to_path_buf();
        if append_filename {
            path.push(&self.meta.filename);
        }
        let file = std::fs::File::create(&path)?;
        self.save_to(file).await
    }

    fn resolve_cipher(&self) -> Result<Option<CipherSpec>> {
        if !self.options.decrypt {
            return Ok(None);
        }
        let Some(name) = self.meta.encryption.as_deref() else {
            return Ok(None);
        };
        // Key check first: an unsupported cipher with no key is still
        // primarily "you cannot read this file".
        let Some(key) = self.options.key.clone() else {
            return Err(Error::Encrypted);
        };
        let cipher: Cipher = name.parse()?;
        Ok(Some(CipherSpec::new(cipher, key)))
    }

    fn verify(&mut self, outcome: CopyOutcome) -> Result<DownloadSummary> {
        let local = outcome.local_checksum;
        let server = self.meta.checksum.clone();

        if self.options.ignore_checksum {
            self.state = DownloadState::Unverified;
            return Ok(DownloadSummary {
                bytes: outcome.bytes,
                local_checksum: local,
                server_checksum: server,
                verification: Verification::Skipped,
            });
        }

        match server {
            Some(remote) => {
                if !local.is_empty() && local == remote {
                    self.state = DownloadState::Verified;
                    debug!(checksum = %local, bytes = outcome.bytes, "download verified");
                    Ok(DownloadSummary {
                        bytes: outcome.bytes,
                        local_checksum: local,
                        server_checksum: Some(remote),
                        verification: Verification::Verified,
                    })
                } else {
                    self.state = DownloadState::Mismatched;
                    warn!(local = %local, remote = %remote, "download checksum mismatch");
                    Err(Error::ChecksumMismatch {
                        local,
                        remote,
                    })
                }
            }
            None => {
                // The server performed no verification; neither do we.
                self.state = DownloadState::Unverified;
                Ok(DownloadSummary {
                    bytes: outcome.bytes,
                    local_checksum: local,
                    server_checksum: None,
                    verification: Verification::Skipped,
                })
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct CopyOutcome {
    pub(crate) bytes: u64,
    pub(crate) local_checksum: String,
}

/// Blocking copy loop: raw body in, transformed bytes out to the
/// sink, cancel polled once per buffer.
pub(crate) fn run_copy<W: Write>(
    body: BodyReader,
    sink: W,
    cipher: Option<&CipherSpec>,
    extract: bool,
    buffer_size: usize,
    cancel: &CancelToken,
    observer: Option<Arc<dyn ProgressObserver>>,
) -> Result<CopyOutcome> {
    let mut chain = DownloadChain::new(body, cipher, extract)?;
    let mut sink = CountingWriter::new(sink, observer);
    let mut buf = vec![0u8; buffer_size];

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = chain.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
    }
    sink.flush()?;

    Ok(CopyOutcome {
        bytes: sink.total(),
        local_checksum: chain.digest_hex(),
    })
}
