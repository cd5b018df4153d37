//! Request signing hook
//!
//! The fetcher consults an [`AuthHook`] before every request and attaches the
//! headers it returns.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const TIMESTAMP_HEADER: &str = "Timestamp";

/// Produces the headers to attach to an outgoing request.
pub trait AuthHook: Send + Sync + 'static {
    fn headers(&self, url: &Url) -> Vec<(String, String)>;
}

/// HMAC-SHA256 signer over `timestamp\npath?query`.
pub struct HmacAuthHook {
    app_id: String,
    secret: String,
}

impl HmacAuthHook {
    pub fn new(app_id: &str, secret: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Sign a request path (with query) at the given millisecond timestamp
    pub fn sign(&self, timestamp: i64, path_with_query: &str) -> String {
        let string_to_sign = format!("{}\n{}", timestamp, path_with_query);
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(string_to_sign.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

impl AuthHook for HmacAuthHook {
    fn headers(&self, url: &Url) -> Vec<(String, String)> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let path_with_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let signature = self.sign(timestamp, &path_with_query);

        vec![
            (
                AUTHORIZATION_HEADER.to_string(),
                format!("Apollo {}:{}", self.app_id, signature),
            ),
            (TIMESTAMP_HEADER.to_string(), timestamp.to_string()),
        ]
    }
}
