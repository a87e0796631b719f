//! Outgoing requests and the endpoints they are sent to.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

use crate::error::{FlipError, Result};
use crate::frame::priority;
use crate::header_block::{HeaderBlock, VALUE_SEPARATOR};

/// HTTP version advertised in every SYN_STREAM.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Where a session connects. Sessions are pooled per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint for a request URL. Without an explicit port, 443 is used
    /// for SSL sessions and 80 otherwise.
    pub fn from_uri(uri: &Uri, ssl: bool) -> Result<Self> {
        let host = uri
            .host()
            .ok_or_else(|| FlipError::InvalidRequest(format!("url has no host: {uri}")))?;
        let port = uri.port_u16().unwrap_or(if ssl { 443 } else { 80 });
        Ok(Self::new(host.to_ascii_lowercase(), port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A request to send over a FLIP stream.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub url: Uri,
    /// Extra request headers. Names go on the wire lower-cased.
    pub headers: HeaderMap,
    /// Upload body, sent as DATA frames after the SYN_STREAM.
    pub body: Option<Bytes>,
    /// 0 (highest) to 3 (lowest).
    pub priority: u8,
    pub referrer: Option<String>,
}

impl RequestInfo {
    pub fn new(method: Method, url: Uri) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            priority: priority::LOWEST,
            referrer: None,
        }
    }

    pub fn get(url: Uri) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Uri, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    /// True when DATA frames follow the SYN_STREAM. An empty body counts
    /// as none.
    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }

    /// Path and query, the key pushed resources are matched on.
    pub fn path(&self) -> &str {
        self.url.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// Build the SYN_STREAM header block.
    ///
    /// Names are emitted in sorted order. Repeated extra headers fold into
    /// one NUL-separated value; `method`, `url` and `version` always come
    /// from the request itself.
    pub fn syn_headers(&self) -> Result<HeaderBlock> {
        if self.priority > priority::LOWEST {
            return Err(FlipError::InvalidRequest(format!(
                "priority {} out of range",
                self.priority
            )));
        }

        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.headers {
            let value = value.to_str().map_err(|_| {
                FlipError::InvalidRequest(format!("header {name} is not visible ASCII"))
            })?;
            fields
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push(VALUE_SEPARATOR);
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        if let Some(referrer) = &self.referrer {
            fields.insert("referer".to_string(), referrer.clone());
        }
        fields.insert("method".to_string(), self.method.as_str().to_string());
        fields.insert("url".to_string(), self.url.to_string());
        fields.insert("version".to_string(), HTTP_VERSION.to_string());

        Ok(fields.into_iter().collect())
    }
}
