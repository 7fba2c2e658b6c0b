//! skiff-client: streaming transfer client.
//!
//! Uploads push a local source through a compress/encrypt/digest
//! chain straight into the HTTP body; downloads mirror the chain and
//! verify the wire digest against the server's. Nothing is buffered
//! whole in memory and a capacity-1 handoff provides backpressure in
//! both directions.
//!
//! ```no_run
//! use skiff_client::{Client, RequestConfig};
//! use skiff_core::cipher::Cipher;
//!
//! # async fn example() -> skiff_core::Result<()> {
//! let client = Client::new(RequestConfig::new("https://files.example.org"))?;
//!
//! let result = client
//!     .upload("report.pdf")
//!     .compress()
//!     .encrypted(Cipher::Aes, vec![0u8; 32])
//!     .from_file("/tmp/report.pdf")
//!     .await?;
//! assert!(result.verified());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod download;
pub mod progress;
pub mod rest;
pub mod upload;

pub use config::{RequestConfig, WireConfig};
pub use download::{
    DownloadMeta, DownloadRequest, DownloadResponse, DownloadState, DownloadSummary, Verification,
};
pub use progress::{observer_fn, ProgressObserver};
pub use rest::{FileAttributes, UploadResponse};
pub use upload::{UploadOutcome, UploadRequest, UploadResult};

use skiff_core::Result;

use crate::rest::RestClient;

/// Handle to one server, shared by any number of transfers.
pub struct Client {
    pub(crate) rest: RestClient,
    pub(crate) wire: WireConfig,
}

impl Client {
    /// Connect with the default wire format.
    pub fn new(config: RequestConfig) -> Result<Self> {
        Self::with_wire(config, WireConfig::default())
    }

    /// Connect with explicit wire-format values, for servers built
    /// with non-default framing constants.
    pub fn with_wire(config: RequestConfig, wire: WireConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config)?,
            wire,
        })
    }

    /// Start building an upload of a file named `name`.
    pub fn upload(&self, name: impl Into<String>) -> UploadRequest<'_> {
        UploadRequest::new(self, name.into())
    }

    /// Start building a download.
    pub fn download(&self) -> DownloadRequest<'_> {
        DownloadRequest::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_defaults() {
        let client = Client::new(RequestConfig::new("https://files.example.org")).unwrap();
        assert_eq!(
            client.wire.multipart_boundary,
            WireConfig::default().multipart_boundary
        );
    }
}
