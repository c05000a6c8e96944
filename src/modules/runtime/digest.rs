//! Transport-neutral request digest

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Version};
use bytes::Bytes;
use edgeserv_core::{EdgeservError, Result};
use std::collections::HashMap;

/// Cap on buffered request bodies, in bytes.
pub const DEFAULT_BODY_LIMIT: usize = 100_000;

/// Transport-neutral snapshot of an inbound request.
///
/// Carries the request metadata plus two lazy accessors: query parameters
/// (parsed on demand) and the body (readable exactly once, since reading
/// consumes the underlying stream). The original [`Parts`] are retained as a
/// back-reference for handlers that need the native transport objects.
#[derive(Debug)]
pub struct RequestDigest {
    pub http_version_major: u8,
    pub http_version_minor: u8,
    pub is_secure: bool,
    pub method: Method,
    pub path: String,
    headers: HashMap<String, String>,
    body: Option<Body>,
    parts: Parts,
}

impl RequestDigest {
    /// Build a digest from a native request. No side effects beyond the
    /// eventual body read.
    pub fn new(req: Request) -> Self {
        let (parts, body) = req.into_parts();
        let (http_version_major, http_version_minor) = version_digits(parts.version);
        let headers = process_headers(&parts.headers);
        let is_secure = parts.uri.scheme_str() == Some("https")
            || headers.get("x-forwarded-proto").map(String::as_str) == Some("https");

        Self {
            http_version_major,
            http_version_minor,
            is_secure,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            headers,
            body: Some(body),
            parts,
        }
    }

    /// Normalized header mapping (lowercase keys, multi-values joined).
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// A single header value by its lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Parse the query string into a mapping. List-valued keys keep their
    /// values in the order they appeared.
    pub fn query_params(&self) -> HashMap<String, Vec<String>> {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(raw) = self.parts.uri.query() {
            for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                params
                    .entry(key.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
        }
        params
    }

    /// Read the request body. May be called at most once; reading consumes
    /// the underlying stream.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        let body = self.body.take().ok_or(EdgeservError::BodyConsumed)?;
        let bytes = to_bytes(body, DEFAULT_BODY_LIMIT)
            .await
            .map_err(|e| EdgeservError::BodyRead(e.to_string()))?;
        if bytes.is_empty() {
            return Err(EdgeservError::BodyRead(
                "transport yielded an empty body".to_string(),
            ));
        }
        Ok(bytes)
    }

    /// Back-reference to the native request head.
    pub fn parts(&self) -> &Parts {
        &self.parts
    }
}

fn version_digits(version: Version) -> (u8, u8) {
    if version == Version::HTTP_09 {
        (0, 9)
    } else if version == Version::HTTP_10 {
        (1, 0)
    } else if version == Version::HTTP_2 {
        (2, 0)
    } else if version == Version::HTTP_3 {
        (3, 0)
    } else {
        (1, 1)
    }
}

/// Lowercase header names and join repeated values with `", "` per HTTP
/// field semantics. Non-UTF-8 bytes are replaced rather than dropped.
fn process_headers(map: &HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in map {
        let text = String::from_utf8_lossy(value.as_bytes());
        match headers.entry(name.as_str().to_string()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let joined = entry.get_mut();
                joined.push_str(", ");
                joined.push_str(&text);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(text.into_owned());
            }
        }
    }
    headers
}
