//! Client configuration.
//!
//! All wire-level constants that the original protocol treated as
//! package globals (multipart boundary, cipher tables) are injected
//! through these values instead.

/// Connection and authentication settings for one server.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Base URL of the server, e.g. `https://files.example.org`.
    pub url: String,
    /// Machine identifier sent with login-bound requests.
    pub machine_id: String,
    /// Account name.
    pub username: String,
    /// Bearer token for the `Authorization` header.
    pub session_token: String,
    /// Skip TLS certificate verification.
    pub ignore_cert: bool,
}

impl RequestConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = token.into();
        self
    }
}

/// Fixed wire-format values shared between client and server.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Multipart boundary. An implementation-level contract with the
    /// server; it must not vary per request.
    pub multipart_boundary: String,
    /// Form field name for the file part.
    pub multipart_field: String,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            multipart_boundary: "MachliJalKiRaniHaiJeevanUskaPaaniHai".into(),
            multipart_field: "fakefield".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_boundary_is_stable() {
        let a = WireConfig::default();
        let b = WireConfig::default();
        assert_eq!(a.multipart_boundary, b.multipart_boundary);
        assert!(!a.multipart_boundary.is_empty());
    }

    #[test]
    fn config_builder() {
        let cfg = RequestConfig::new("https://files.example.org").with_token("tok");
        assert_eq!(cfg.url, "https://files.example.org");
        assert_eq!(cfg.session_token, "tok");
        assert!(!cfg.ignore_cert);
    }
}
