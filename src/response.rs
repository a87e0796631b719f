//! Response view built from a SYN_REPLY (or pushed SYN_STREAM) header block.

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::{FlipError, Result};
use crate::header_block::HeaderBlock;

/// Response headers and status line for a completed `start`.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    status: StatusCode,
    status_line: String,
    headers: HeaderBlock,
}

impl ResponseInfo {
    /// Interpret a reply header block. `status` and `version` are
    /// required; `status` may be a bare code or a code plus reason.
    pub fn from_headers(headers: HeaderBlock) -> Result<Self> {
        let status_text = headers
            .get("status")
            .ok_or_else(|| FlipError::InvalidResponse("missing status header".to_string()))?;
        let version = headers
            .get("version")
            .ok_or_else(|| FlipError::InvalidResponse("missing version header".to_string()))?;

        let (code, reason) = match status_text.split_once(' ') {
            Some((code, reason)) => (code, Some(reason.trim())),
            None => (status_text, None),
        };
        let status = code
            .parse::<u16>()
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(|| FlipError::InvalidResponse(format!("bad status: {status_text:?}")))?;

        let reason = reason
            .filter(|r| !r.is_empty())
            .or_else(|| status.canonical_reason());
        let status_line = match reason {
            Some(reason) => format!("{version} {} {reason}", status.as_u16()),
            None => format!("{version} {}", status.as_u16()),
        };

        Ok(Self {
            status,
            status_line,
            headers,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// e.g. `HTTP/1.1 200 OK`.
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn version(&self) -> &str {
        self.headers.get("version").unwrap_or_default()
    }

    /// The raw reply block, multi-values still folded.
    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }

    /// Header lines in wire order with multi-values unfolded. The `status`,
    /// `url` and `version` fields are included as ordinary lines.
    pub fn header_lines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.lines()
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .lines()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .lines()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// The header lines as an [`http::HeaderMap`]. Lines that are not
    /// valid HTTP header names or values are skipped.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers.lines() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(name, "skipping header not representable in HeaderMap");
                continue;
            };
            map.append(name, value);
        }
        map
    }

    /// Lines rendered the way an HTTP transaction exposes raw headers:
    /// `name: value\n` per line.
    pub fn raw_headers(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.header_lines() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}
