//! skiff-core: streaming transfer pipeline primitives.
//!
//! This crate provides:
//! - Cipher strategy (AES-CTR and age stream transforms)
//! - Incremental wire digests for integrity verification
//! - Transform chain composition (compress, encrypt, hash)
//! - Bounded pipe and cancellation primitives
//! - Error taxonomy and logging setup

pub mod cancel;
pub mod chain;
pub mod checksum;
pub mod cipher;
pub mod error;
pub mod logging;
pub mod pipe;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};

/// Default transfer buffer size (10 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024;
