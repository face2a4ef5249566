//! Shared Key Lite signing for Azure Table Storage requests.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{
    header::{HeaderMap, HeaderValue, InvalidHeaderValue, ACCEPT, AUTHORIZATION},
    Url,
};
use sha2::Sha256;
use thiserror::Error;

pub const TABLE_API_VERSION: &str = "2019-02-02";
pub const DATE_HEADER_NAME: &str = "x-ms-date";
pub const VERSION_HEADER_NAME: &str = "x-ms-version";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("account key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("account key cannot be used as a signing key")]
    KeyLength,
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// The resource string signed for a table request: `/{account}{path}`.
pub fn canonicalized_resource(account: &str, url: &Url) -> String {
    format!("/{account}{}", url.path())
}

/// Base64 HMAC-SHA256 of `"{date}\n{resource}"` keyed with the decoded account key.
pub fn shared_key_lite_signature(
    account_key: &str,
    date: &str,
    resource: &str,
) -> Result<String, SigningError> {
    let key = STANDARD.decode(account_key)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|_| SigningError::KeyLength)?;
    mac.update(format!("{date}\n{resource}").as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Headers authorizing a GET of `url` on behalf of `account`.
pub fn table_auth_headers(
    account: &str,
    account_key: &str,
    url: &Url,
    now: DateTime<Utc>,
) -> Result<HeaderMap, SigningError> {
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let signature =
        shared_key_lite_signature(account_key, &date, &canonicalized_resource(account, url))?;

    let mut headers = HeaderMap::new();
    headers.insert(DATE_HEADER_NAME, HeaderValue::from_str(&date)?);
    headers.insert(
        VERSION_HEADER_NAME,
        HeaderValue::from_static(TABLE_API_VERSION),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json;odata=nometadata"),
    );
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("SharedKeyLite {account}:{signature}"))?,
    );
    Ok(headers)
}
