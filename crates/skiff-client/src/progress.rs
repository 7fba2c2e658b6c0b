//! Transfer progress observation.

use std::io::{self, Write};
use std::sync::Arc;

/// Receives byte-count updates as a transfer advances.
///
/// Called from the worker thread that drives the pipeline, so
/// implementations must be cheap and must not block.
pub trait ProgressObserver: Send + Sync {
    /// Total bytes moved so far on this transfer.
    fn on_bytes(&self, transferred: u64);
}

/// Wrap a closure as a [`ProgressObserver`].
pub fn observer_fn<F>(f: F) -> Arc<dyn ProgressObserver>
where
    F: Fn(u64) + Send + Sync + 'static,
{
    struct FnObserver<F>(F);
    impl<F: Fn(u64) + Send + Sync> ProgressObserver for FnObserver<F> {
        fn on_bytes(&self, transferred: u64) {
            (self.0)(transferred)
        }
    }
    Arc::new(FnObserver(f))
}

/// Write adapter that reports the running byte total to an observer.
pub(crate) struct CountingWriter<W> {
    inner: W,
    observer: Option<Arc<dyn ProgressObserver>>,
    total: u64,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        Self {
            inner,
            observer,
            total: 0,
        }
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.total += n as u64;
        if let Some(obs) = &self.observer {
            obs.on_bytes(self.total);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn counting_writer_reports_running_total() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in = seen.clone();
        let obs = observer_fn(move |n| seen_in.store(n, Ordering::SeqCst));

        let mut w = CountingWriter::new(Vec::new(), Some(obs));
        w.write_all(b"12345").unwrap();
        w.write_all(b"678").unwrap();

        assert_eq!(w.total(), 8);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
        assert_eq!(w.into_inner(), b"12345678");
    }

    #[test]
    fn counting_writer_without_observer() {
        let mut w = CountingWriter::new(Vec::new(), None);
        w.write_all(b"quiet").unwrap();
        assert_eq!(w.total(), 5);
    }
}
