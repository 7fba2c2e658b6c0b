//! Wire contract with the server: endpoints, header names, request
//! envelopes and response payloads.
//!
//! Upload metadata travels base64-encoded in the `Request` header so
//! the HTTP body can stay a pure byte stream. Responses carry their
//! application status in `X-Response-Status` ("0" error, "1" success)
//! independent of the HTTP status code.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use skiff_core::{Error, Result};

use crate::config::RequestConfig;

pub const HEADER_STATUS: &str = "X-Response-Status";
pub const HEADER_STATUS_MESSAGE: &str = "X-Response-Message";
pub const HEADER_FILE_NAME: &str = "X-Filename";
pub const HEADER_FILE_ID: &str = "X-FileID";
pub const HEADER_ENCRYPTION: &str = "X-Encryption";
pub const HEADER_CHECKSUM: &str = "Checksum";
pub const HEADER_CONTENT_LENGTH: &str = "ContentLength";
pub const HEADER_REQUEST: &str = "Request";

const STATUS_ERROR: &str = "0";

/// Server endpoints used by the transfer client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    FileUpload,
    FileGet,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::FileUpload => "/upload/file",
            Endpoint::FileGet => "/download/file",
        }
    }
}

/// Upload metadata envelope, serialized to JSON and base64-encoded
/// into the `Request` header. Field names are fixed by the server.
#[derive(Debug, Clone, Serialize)]
pub struct UploadEnvelope {
    #[serde(rename = "type")]
    pub upload_type: u8,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "attr")]
    pub attributes: FileAttributes,
    #[serde(rename = "e")]
    pub encryption: i8,
    #[serde(rename = "compr")]
    pub compressed: bool,
    #[serde(rename = "r")]
    pub replace_file_id: u64,
    #[serde(rename = "ren")]
    pub replace_equal_names: bool,
    #[serde(rename = "a")]
    pub archived: bool,
    #[serde(rename = "pb")]
    pub public: bool,
    #[serde(rename = "pbname")]
    pub public_name: String,
}

/// File classification metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttributes {
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "groups", default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(rename = "ns")]
    pub namespace: String,
}

impl Default for FileAttributes {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            groups: Vec::new(),
            namespace: "default".into(),
        }
    }
}

impl FileAttributes {
    pub fn in_namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: ns.into(),
            ..Self::default()
        }
    }
}

/// Body of a download request, identifying the file by id or by name
/// within a namespace.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadQuery {
    #[serde(rename = "fid")]
    pub file_id: u64,
    #[serde(rename = "name", skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "attributes")]
    pub attributes: FileAttributes,
}

/// Server reply to a completed upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(rename = "fileID")]
    pub file_id: u64,
    #[serde(rename = "filename")]
    pub filename: String,
    #[serde(rename = "publicFilename", default)]
    pub public_filename: Option<String>,
    #[serde(rename = "checksum")]
    pub checksum: String,
    #[serde(rename = "size")]
    pub size: i64,
    #[serde(rename = "ns")]
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "message", default)]
    message: String,
}

/// Encode an envelope for the `Request` header.
pub fn encode_envelope(envelope: &UploadEnvelope) -> Result<String> {
    let json = serde_json::to_vec(envelope).map_err(|e| Error::Protocol {
        message: format!("cannot encode upload envelope: {e}"),
    })?;
    Ok(BASE64.encode(json))
}

/// Thin wrapper over the HTTP client carrying auth and base URL.
pub(crate) struct RestClient {
    http: reqwest::Client,
    config: RequestConfig,
}

impl RestClient {
    pub(crate) fn new(config: RequestConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.ignore_cert)
            .build()
            .map_err(|e| Error::Config {
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self { http, config })
    }

    pub(crate) fn request(&self, method: Method, endpoint: Endpoint) -> RequestBuilder {
        let url = format!(
            "{}{}",
            self.config.url.trim_end_matches('/'),
            endpoint.path()
        );
        let mut builder = self.http.request(method, url);
        if !self.config.session_token.is_empty() {
            builder = builder.bearer_auth(&self.config.session_token);
        }
        builder
    }
}

/// Map transport-level send failures into the error taxonomy.
pub(crate) fn transport_error(err: reqwest::Error) -> Error {
    Error::Transport {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Check the application-level response status. On error, drains the
/// body for a server-provided message before giving up on the headers.
pub(crate) async fn check_response(resp: Response) -> Result<Response> {
    let http_status = resp.status().as_u16();
    let app_error = header_value(resp.headers(), HEADER_STATUS)
        .map(|s| s == STATUS_ERROR)
        .unwrap_or_else(|| !resp.status().is_success());

    if !app_error {
        return Ok(resp);
    }

    let mut message =
        header_value(resp.headers(), HEADER_STATUS_MESSAGE).unwrap_or_default();
    if message.is_empty() {
        if let Ok(body) = resp.json::<ErrorResponse>().await {
            message = body.message;
        }
    }
    if message.is_empty() {
        message = "server rejected the request".into();
    }
    Err(Error::Transport {
        status: Some(http_status),
        message,
    })
}

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
