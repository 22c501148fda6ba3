//! Parsed messages exchanged with the HTTP collaborator.
//!
//! The wire format itself belongs to the transport; the core only sees these
//! already-parsed requests and responses and hands responses back through a
//! `send` primitive.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

/// MIME type of negotiation and collect payloads.
pub const JSON_MIMETYPE: &str = "application/json";

/// MIME type of measurement bodies.
pub const OCTET_MIMETYPE: &str = "application/octet-stream";

/// Request methods used by the speedtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Retrieve a resource
    Get,
    /// Retrieve headers only
    Head,
    /// Submit a body
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
        };
        f.write_str(name)
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request method
    pub method: Method,
    /// Request URI
    pub uri: String,
    /// Session token, absent on the first negotiation
    pub authorization: Option<String>,
    /// Raw `Range` header value
    pub range: Option<String>,
    /// Body MIME type
    pub mimetype: Option<String>,
    /// Request body
    pub body: Bytes,
}

impl Request {
    /// Create a request without headers or body
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            authorization: None,
            range: None,
            mimetype: None,
            body: Bytes::new(),
        }
    }

    /// Attach a session token, if any
    pub fn with_authorization(mut self, token: Option<&str>) -> Self {
        self.authorization = token.filter(|t| !t.is_empty()).map(str::to_string);
        self
    }

    /// Ask for bytes `first..=last`
    pub fn with_range(mut self, first: u64, last: u64) -> Self {
        self.range = Some(format!("bytes={first}-{last}"));
        self
    }

    /// Attach a body
    pub fn with_body(mut self, mimetype: &str, body: Bytes) -> Self {
        self.mimetype = Some(mimetype.to_string());
        self.body = body;
        self
    }

    /// Session token, treating an empty header as absent
    pub fn token(&self) -> Option<&str> {
        self.authorization.as_deref().filter(|t| !t.is_empty())
    }
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code
    pub code: u16,
    /// Reason phrase
    pub reason: String,
    /// Raw `Content-Range` header value
    pub content_range: Option<String>,
    /// Body MIME type
    pub mimetype: Option<String>,
    /// Response body
    pub body: Bytes,
}

impl Response {
    /// Response with an empty body
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            content_range: None,
            mimetype: None,
            body: Bytes::new(),
        }
    }

    /// 200 Ok
    pub fn ok() -> Self {
        Self::new(200, "Ok")
    }

    /// 206 Partial Content
    pub fn partial(content_range: String) -> Self {
        let mut response = Self::new(206, "Partial Content");
        response.content_range = Some(content_range);
        response
    }

    /// 400 Bad Request
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 403 Forbidden
    pub fn forbidden() -> Self {
        Self::new(403, "Forbidden")
    }

    /// 500 Internal Server Error
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// Attach a body
    pub fn with_body(mut self, mimetype: &str, body: Bytes) -> Self {
        self.mimetype = Some(mimetype.to_string());
        self.body = body;
        self
    }

    /// Attach a JSON body
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.with_body(JSON_MIMETYPE, Bytes::from(body)))
    }

    /// Decode a JSON body
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ProbeError::InvalidMessage(format!("bad {} body: {e}", self.code)))
    }

    /// Fail unless the status is one of `accepted`
    pub fn expect(&self, accepted: &[u16]) -> Result<()> {
        if accepted.contains(&self.code) {
            Ok(())
        } else {
            Err(ProbeError::BadResponse {
                code: self.code,
                reason: self.reason.clone(),
            })
        }
    }
}

/// Server answer to a negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    /// Session token to present on every following request
    pub authorization: String,
    /// Client address as seen by the server
    pub public_address: String,
    /// `"true"` once the session may run the test
    pub unchoked: String,
    /// 1-based rank in the queue
    pub queue_pos: usize,
    /// Queue length
    pub queue_len: usize,
}

impl NegotiateResponse {
    /// Whether the session may take the test now
    pub fn is_unchoked(&self) -> bool {
        self.unchoked.eq_ignore_ascii_case("true")
    }
}

/// Results uploaded at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectPayload {
    /// Identifier of the measuring agent
    pub client_id: String,
    /// Unix time of the run
    pub timestamp: i64,
    /// Local address of the measuring connection
    pub internal_address: String,
    /// Address the server saw during negotiation
    pub real_address: String,
    /// Server address
    pub remote_address: String,
    /// Connection setup times, seconds
    pub connect_time: Vec<f64>,
    /// Round-trip latencies, seconds
    pub latency: Vec<f64>,
    /// Download speeds, bytes per second
    pub download_speed: Vec<f64>,
    /// Upload speeds, bytes per second
    pub upload_speed: Vec<f64>,
}

/// Parse `bytes=first-last`.
pub fn parse_range(value: &str) -> Result<(u64, u64)> {
    let bounds = value.trim().strip_prefix("bytes=").unwrap_or(value).trim();
    let (first, last) = bounds
        .split_once('-')
        .ok_or_else(|| ProbeError::InvalidRange(value.to_string()))?;
    let first: u64 = first
        .trim()
        .parse()
        .map_err(|_| ProbeError::InvalidRange(value.to_string()))?;
    let last: u64 = last
        .trim()
        .parse()
        .map_err(|_| ProbeError::InvalidRange(value.to_string()))?;
    if last < first {
        return Err(ProbeError::InvalidRange(value.to_string()));
    }
    Ok((first, last))
}
