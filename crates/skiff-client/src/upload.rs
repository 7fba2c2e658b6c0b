//! Streaming file upload.
//!
//! The source is pushed through the transform chain (compress, then
//! encrypt, then digest) on a dedicated blocking task, handed to the
//! HTTP body through a capacity-1 pipe, and the typed outcome of the
//! producer arrives on a oneshot channel once the stream is closed.
//! The request body never buffers the whole file.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use skiff_core::chain::UploadChain;
use skiff_core::cipher::{Cipher, CipherSpec};
use skiff_core::pipe::{pipe, ChunkResult, PipeWriter};
use skiff_core::{CancelToken, Error, Result, DEFAULT_BUFFER_SIZE};

use crate::progress::{CountingWriter, ProgressObserver};
use crate::rest::{
    check_response, encode_envelope, transport_error, Endpoint, FileAttributes, UploadEnvelope,
    UploadResponse, HEADER_REQUEST,
};
use crate::Client;

/// How the producer side of an upload ended.
#[derive(Debug)]
pub enum UploadOutcome {
    /// Every source byte was transformed and handed to the transport.
    Completed { checksum: String },
    /// The cancel token fired before the source was exhausted.
    Cancelled,
    /// A source or transform error ended the stream early, carried
    /// with its original type intact.
    Failed { error: Error },
}

/// Result of a finished upload: the server's reply plus the digest
/// computed locally over the wire bytes.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub response: UploadResponse,
    /// Hex digest of the bytes this client actually sent.
    pub local_checksum: String,
}

impl UploadResult {
    /// True when both ends hashed the same bytes.
    pub fn verified(&self) -> bool {
        !self.local_checksum.is_empty() && self.local_checksum == self.response.checksum
    }
}

/// Consuming builder describing one upload.
pub struct UploadRequest<'a> {
    client: &'a Client,
    name: String,
    attributes: FileAttributes,
    cipher: Option<CipherSpec>,
    compress: bool,
    multipart: bool,
    buffer_size: usize,
    replace_file_id: u64,
    replace_equal_names: bool,
    public: bool,
    public_name: String,
    size_callback: Option<Box<dyn FnOnce(u64) + Send>>,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancelToken,
}

impl<'a> UploadRequest<'a> {
    pub(crate) fn new(client: &'a Client, name: String) -> Self {
        Self {
            client,
            name,
            attributes: FileAttributes::default(),
            cipher: None,
            compress: false,
            multipart: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            replace_file_id: 0,
            replace_equal_names: false,
            public: false,
            public_name: String::new(),
            size_callback: None,
            observer: None,
            cancel: CancelToken::new(),
        }
    }

    /// Gzip the source before any encryption.
    pub fn compress(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Encrypt the (possibly compressed) stream with `cipher` and
    /// `key`. Key material is validated before any network I/O.
    pub fn encrypted(mut self, cipher: Cipher, key: Vec<u8>) -> Self {
        self.cipher = Some(CipherSpec::new(cipher, key));
        self
    }

    /// Frame the body as a single multipart part instead of a raw
    /// stream. The framing bytes are outside the digest.
    pub fn multipart(mut self) -> Self {
        self.multipart = true;
        self
    }

    /// Per-read chunk size for the producer loop.
    pub fn buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.buffer_size = size;
        }
        self
    }

    pub fn attributes(mut self, attributes: FileAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.attributes.namespace = ns.into();
        self
    }

    /// Replace the server-side file with this id.
    pub fn replace_file(mut self, file_id: u64) -> Self {
        self.replace_file_id = file_id;
        self
    }

    /// Ask the server to replace files sharing this name.
    pub fn replace_equal_names(mut self) -> Self {
        self.replace_equal_names = true;
        self
    }

    /// Publish the file under an optional public name.
    pub fn public(mut self, public_name: impl Into<String>) -> Self {
        self.public = true;
        self.public_name = public_name.into();
        self
    }

    /// Fired once, before the transfer starts, with the predicted
    /// content length. Not fired when the source size is unknown or
    /// when compression makes the wire length unpredictable.
    pub fn on_size_known<F>(mut self, f: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.size_callback = Some(Box::new(f));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Upload a local file. The size is taken from its metadata.
    pub async fn from_file(self, path: impl AsRef<Path>) -> Result<UploadResult> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| Error::Config {
            message: format!("cannot open {}: {e}", path.display()),
        })?;
        let size = file.metadata()?.len();
        self.from_reader(file, Some(size)).await
    }

    /// Upload from any blocking reader. Pass the source size when it
    /// is known so the content length can be predicted.
    pub async fn from_reader<R>(mut self, source: R, size: Option<u64>) -> Result<UploadResult>
    where
        R: Read + Send + 'static,
    {
        if let Some(spec) = &self.cipher {
            spec.validate()?;
        }

        let framing = if self.multipart {
            Some(MultipartFraming::new(
                &self.client.wire.multipart_boundary,
                &self.client.wire.multipart_field,
                &self.name,
            ))
        } else {
            None
        };

        let predicted = self.predicted_size(size, framing.as_ref());
        if let (Some(cb), Some(total)) = (self.size_callback.take(), predicted) {
            cb(total);
        }

        let envelope = encode_envelope(&self.envelope())?;

        debug!(
            name = %self.name,
            cipher = self.cipher.as_ref().map(|s| s.cipher.as_str()),
            compress = self.compress,
            multipart = self.multipart,
            "starting upload"
        );

        let (rx, done_rx) = spawn_producer(
            Box::new(source),
            ProducerConfig {
                cipher: self.cipher.clone(),
                compress: self.compress,
                buffer_size: self.buffer_size,
                cancel: self.cancel.clone(),
                observer: self.observer.clone(),
                framing,
            },
        );

        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
        let mut request = self
            .client
            .rest
            .request(Method::PUT, Endpoint::FileUpload)
            .header(HEADER_REQUEST, envelope)
            .body(body);
        if self.multipart {
            request = request.header(
                CONTENT_TYPE,
                format!(
                    "multipart/form-data; boundary={}",
                    self.client.wire.multipart_boundary
                ),
            );
        }
        if let Some(total) = predicted {
            request = request.header(CONTENT_LENGTH, total);
        }

        let sent = request.send().await;

        // The producer outcome is authoritative over transport noise:
        // cancelling mid-body makes the HTTP call fail too.
        let outcome = done_rx.await.unwrap_or(UploadOutcome::Failed {
            error: Error::Io(std::io::Error::other("upload producer task dropped")),
        });
        match outcome {
            UploadOutcome::Cancelled => return Err(Error::Cancelled),
            UploadOutcome::Failed { error } => {
                // A broken pipe means the consumer hung up first: the
                // response, not the pipe, explains why.
                let broken_pipe = matches!(
                    &error,
                    Error::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe
                );
                if broken_pipe {
                    match sent {
                        Ok(resp) => {
                            check_response(resp).await?;
                            return Err(error);
                        }
                        Err(e) => return Err(transport_error(e)),
                    }
                }
                return Err(error);
            }
            UploadOutcome::Completed { checksum } => {
                let resp = check_response(sent.map_err(transport_error)?).await?;
                let response: UploadResponse = resp.json().await.map_err(|e| Error::Protocol {
                    message: format!("malformed upload response: {e}"),
                })?;

                debug!(
                    file_id = response.file_id,
                    checksum = %checksum,
                    "upload complete"
                );
                Ok(UploadResult {
                    response,
                    local_checksum: checksum,
                })
            }
        }
    }

    fn envelope(&self) -> UploadEnvelope {
        UploadEnvelope {
            upload_type: 0,
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            encryption: self.cipher.as_ref().map(|s| s.cipher.id()).unwrap_or(0),
            compressed: self.compress,
            replace_file_id: self.replace_file_id,
            replace_equal_names: self.replace_equal_names,
            archived: false,
            public: self.public,
            public_name: self.public_name.clone(),
        }
    }

    /// Base size plus fixed cipher overhead plus multipart framing.
    /// A compressed stream has no predictable wire length, so it is
    /// treated like an unknown-size source rather than guessed at.
    fn predicted_size(&self, size: Option<u64>, framing: Option<&MultipartFraming>) -> Option<u64> {
        if self.compress {
            return None;
        }
        let base = size?;
        let cipher = self
            .cipher
            .as_ref()
            .map(|s| s.cipher.size_overhead())
            .unwrap_or(0);
        let framing = framing
            .map(|f| (f.preamble.len() + f.trailer.len()) as u64)
            .unwrap_or(0);
        Some(base + cipher + framing)
    }
}

/// Precomputed multipart framing for a single-part body. Written
/// around the transform chain so the digest never sees it.
pub(crate) struct MultipartFraming {
    pub(crate) preamble: Vec<u8>,
    pub(crate) trailer: Vec<u8>,
}

impl MultipartFraming {
    pub(crate) fn new(boundary: &str, field: &str, filename: &str) -> Self {
        let preamble = format!(
            "--{boundary}\r\nContent-Disposition: form-data; \
             name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        );
        let trailer = format!("\r\n--{boundary}--\r\n");
        Self {
            preamble: preamble.into_bytes(),
            trailer: trailer.into_bytes(),
        }
    }
}

pub(crate) struct ProducerConfig {
    pub(crate) cipher: Option<CipherSpec>,
    pub(crate) compress: bool,
    pub(crate) buffer_size: usize,
    pub(crate) cancel: CancelToken,
    pub(crate) observer: Option<Arc<dyn ProgressObserver>>,
    pub(crate) framing: Option<MultipartFraming>,
}

/// Start the blocking producer task. Returns the pipe receiver to
/// feed the HTTP body and the channel carrying the typed outcome.
pub(crate) fn spawn_producer(
    source: Box<dyn Read + Send>,
    config: ProducerConfig,
) -> (mpsc::Receiver<ChunkResult>, oneshot::Receiver<UploadOutcome>) {
    let (writer, rx) = pipe();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let outcome = run_producer(source, writer, config);
        let _ = done_tx.send(outcome);
    });
    (rx, done_rx)
}

fn run_producer(
    mut source: Box<dyn Read + Send>,
    mut writer: PipeWriter,
    config: ProducerConfig,
) -> UploadOutcome {
    let failer = writer.failer();
    // The outcome keeps the typed error; the pipe only needs a
    // terminator for the body stream, so it gets a copy by message.
    let fail = |failer: skiff_core::pipe::PipeFailer, error: Error| {
        failer.fail(Error::Io(std::io::Error::other(error.to_string())));
        UploadOutcome::Failed { error }
    };

    // Multipart framing sits outside the chain: the remote digest
    // covers only the part content.
    if let Some(framing) = &config.framing {
        if let Err(e) = writer.write_all(&framing.preamble) {
            return fail(failer, e.into());
        }
    }

    let counting = CountingWriter::new(writer, config.observer.clone());
    let mut chain = match UploadChain::new(counting, config.cipher.as_ref(), config.compress) {
        Ok(chain) => chain,
        Err(e) => return fail(failer, e),
    };

    let mut buf = vec![0u8; config.buffer_size];
    loop {
        // One poll per chunk bounds the cancel latency to a single
        // buffer of work.
        if config.cancel.is_cancelled() {
            failer.fail(Error::Cancelled);
            return UploadOutcome::Cancelled;
        }
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return fail(failer, e.into()),
        };
        if let Err(e) = chain.write_all(&buf[..n]) {
            return fail(failer, e.into());
        }
    }

    match chain.finish() {
        Ok((counting, checksum)) => {
            let mut writer = counting.into_inner();
            if let Some(framing) = &config.framing {
                if let Err(e) = writer.write_all(&framing.trailer) {
                    return fail(failer, e.into());
                }
            }
            // Both sender handles drop here; the consumer sees EOF.
            UploadOutcome::Completed { checksum }
        }
        Err(e) => fail(failer, e),
    }
}
