//! Error types for skiff transfers.

use thiserror::Error;

/// Main error type for transfer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid local configuration (unknown cipher, bad key, bad path).
    /// Detected before any network I/O.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Transport-level failure: connection error or a non-success
    /// response from the server, carrying the remote message when
    /// available.
    #[error("transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The two ends are not speaking the same contract: missing
    /// required header, truncated IV, malformed stream framing.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Cipher-library failure during stream encryption or decryption.
    #[error("cipher error: {message}")]
    Cipher { message: String },

    /// Cipher identifier that neither end supports.
    #[error("cipher not supported: {0}")]
    UnsupportedCipher(String),

    /// The remote file is encrypted but no key was supplied.
    #[error("file is encrypted but no key was given")]
    Encrypted,

    /// The locally computed digest does not match the server's.
    #[error("checksum mismatch: local {local}, remote {remote}")]
    ChecksumMismatch { local: String, remote: String },

    /// The transfer was cancelled by the caller.
    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if this error is the distinguished cancellation
    /// value rather than a genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if this error is fatal and retrying the same
    /// operation cannot help: the caller's configuration or the wire
    /// contract itself is broken.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. }
                | Error::Protocol { .. }
                | Error::UnsupportedCipher(_)
                | Error::Encrypted
        )
    }
}

/// Convenience result type for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;
