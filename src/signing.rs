//! Signed websocket URLs for the speech services.
//!
//! Each request carries `authorization`, `date` and `host` query parameters.
//! The signature is HMAC-SHA256 over the host line, the date line and the
//! request line, keyed with the API secret.

use crate::error::{Result, VoiceError};
use base64::engine::general_purpose;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::tungstenite::http::Uri;

type HmacSha256 = Hmac<Sha256>;

/// Credentials shared by all three services.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
}

/// RFC 1123 date, e.g. `Mon, 06 Jan 2025 08:00:00 GMT`.
pub fn rfc1123(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Sign `base_url` with the current time.
pub fn sign_url(base_url: &str, creds: &Credentials) -> Result<String> {
    sign_url_at(base_url, creds, Utc::now())
}

pub fn sign_url_at(base_url: &str, creds: &Credentials, now: DateTime<Utc>) -> Result<String> {
    let uri: Uri = base_url
        .parse()
        .map_err(|e| VoiceError::Config(format!("Invalid service URL {}: {}", base_url, e)))?;
    let host = uri
        .host()
        .ok_or_else(|| VoiceError::Config(format!("Service URL has no host: {}", base_url)))?;
    let host = match uri.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let date = rfc1123(now);

    let origin = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, uri.path());
    let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
        .map_err(|e| VoiceError::Config(format!("Unusable API secret: {}", e)))?;
    mac.update(origin.as_bytes());
    let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{}\"",
        creds.api_key, signature
    );
    let authorization = general_purpose::STANDARD.encode(authorization_origin);

    Ok(format!(
        "{}?authorization={}&date={}&host={}",
        base_url.trim_end_matches('?'),
        urlencoding::encode(&authorization),
        urlencoding::encode(&date),
        urlencoding::encode(&host)
    ))
}
