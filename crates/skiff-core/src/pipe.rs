//! Bounded in-memory pipe between blocking transform code and async
//! HTTP bodies.
//!
//! The channel has capacity 1: a producer send blocks until the
//! consumer drains the previous chunk. That synchronous handoff is the
//! transfer backpressure mechanism, not a buffer, and it is the only
//! resource the producer and consumer share.

use std::io::{self, Read, Write};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::error::Error;

/// A chunk on the pipe: wire bytes, or the typed error that ends the
/// stream.
pub type ChunkResult = std::result::Result<Bytes, Error>;

/// Create a pipe for the upload direction. Dropping every writer-side
/// handle closes the pipe cleanly (EOF to the consumer).
pub fn pipe() -> (PipeWriter, mpsc::Receiver<ChunkResult>) {
    let (tx, rx) = mpsc::channel(1);
    (PipeWriter { tx }, rx)
}

/// Blocking `Write` half of the pipe. Used from a dedicated producer
/// task, never from async context.
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<ChunkResult>,
}

impl PipeWriter {
    /// A handle that can close the pipe with an error attached while
    /// the writer itself is buried inside a transform chain.
    pub fn failer(&self) -> PipeFailer {
        PipeFailer {
            tx: self.tx.clone(),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Error-close handle for a [`PipeWriter`].
///
/// Holds a sender clone, so it must be dropped (or consumed by
/// [`PipeFailer::fail`]) before the consumer can observe EOF.
#[derive(Debug)]
pub struct PipeFailer {
    tx: mpsc::Sender<ChunkResult>,
}

impl PipeFailer {
    /// Close the pipe with `err` attached. The consumer sees the error
    /// instead of a clean EOF.
    pub fn fail(self, err: Error) {
        // The consumer may already be gone; nothing left to signal.
        let _ = self.tx.blocking_send(Err(err));
    }
}

/// Create a pipe for the download direction: an async pump feeds
/// chunks in, a blocking reader drains them.
pub fn body_pipe() -> (mpsc::Sender<io::Result<Bytes>>, BodyReader) {
    let (tx, rx) = mpsc::channel(1);
    (
        tx,
        BodyReader {
            rx,
            current: Bytes::new(),
        },
    )
}

/// Blocking `Read` over chunks pumped in from an async byte stream.
#[derive(Debug)]
pub struct BodyReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                None => return Ok(0),
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}
