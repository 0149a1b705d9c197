//! Cached HTTP reply state.
//!
//! The full HTTP parser lives elsewhere in the proxy; the store only needs
//! enough of the reply to size deliveries and drive the quick-abort policy,
//! plus a best-effort re-parse when a disk hit has to reconstruct reply
//! state that was never populated in memory.

use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::StatusCode;
use http::Version;
use http::header::CONTENT_LENGTH;
use thiserror::Error;
use tracing::debug;

/// An error from the reply re-parse.
#[derive(Debug, Error)]
pub enum ReplyParseError {
    /// No end-of-headers marker within the supplied bytes.
    #[error("reply headers are incomplete")]
    Incomplete,

    /// The status line did not look like `HTTP/<v> <code> <reason>`.
    #[error("malformed status line")]
    BadStatusLine,

    /// A header line was not valid `name: value`.
    #[error("malformed header line")]
    BadHeader,
}

/// Reply metadata attached to a store entry.
///
/// `status == None` means the reply has not been parsed yet; a disk hit
/// whose first delivered chunk starts at offset zero will opportunistically
/// repopulate it from the on-disk bytes.
#[derive(Debug, Clone)]
pub struct StoredReply {
    /// The reply's status, once known.
    pub status: Option<StatusCode>,
    /// The reply's HTTP version.
    pub version: Version,
    /// The reply's headers.
    pub headers: HeaderMap,
    /// Declared body length; negative when unknown.
    pub content_length: i64,
    /// Size of the serialized reply headers, including the empty line.
    pub hdr_sz: usize,
}

impl Default for StoredReply {
    fn default() -> Self {
        Self {
            status: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content_length: -1,
            hdr_sz: 0,
        }
    }
}

impl StoredReply {
    /// Returns the expected total object length, headers included.
    ///
    /// `None` until the reply has been parsed.
    pub fn expected_len(&self) -> Option<i64> {
        self.status?;
        Some(self.content_length.max(0) + self.hdr_sz as i64)
    }

    /// Parses a status line and headers from the front of `buf`.
    ///
    /// `buf` must contain the complete header block (up to and including
    /// the end-of-headers marker). On success the status, version,
    /// headers, `content_length`, and `hdr_sz` are replaced.
    pub fn parse(&mut self, buf: &[u8]) -> Result<(), ReplyParseError> {
        let hdr_sz = headers_end(buf).ok_or(ReplyParseError::Incomplete)?;
        let text = &buf[..hdr_sz];

        let mut lines = text.split(|&b| b == b'\n').map(|line| {
            // Tolerate both CRLF and bare LF line endings.
            line.strip_suffix(b"\r").unwrap_or(line)
        });

        let status_line = lines.next().ok_or(ReplyParseError::BadStatusLine)?;
        let (version, status) = parse_status_line(status_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(ReplyParseError::BadHeader)?;
            let name = HeaderName::from_bytes(line[..colon].trim_ascii())
                .map_err(|_| ReplyParseError::BadHeader)?;
            let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
                .map_err(|_| ReplyParseError::BadHeader)?;
            headers.append(name, value);
        }

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(-1);

        debug!(
            status = status.as_u16(),
            hdr_sz, content_length, "parsed reply from stored bytes"
        );

        self.status = Some(status);
        self.version = version;
        self.headers = headers;
        self.content_length = content_length;
        self.hdr_sz = hdr_sz;
        Ok(())
    }
}

/// Parses `HTTP/<version> <code> [reason]`.
fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode), ReplyParseError> {
    let mut parts = line.splitn(3, |&b| b == b' ');

    let version = match parts.next() {
        Some(b"HTTP/0.9") => Version::HTTP_09,
        Some(b"HTTP/1.0") => Version::HTTP_10,
        Some(b"HTTP/1.1") => Version::HTTP_11,
        Some(b"HTTP/2.0") | Some(b"HTTP/2") => Version::HTTP_2,
        _ => return Err(ReplyParseError::BadStatusLine),
    };

    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code).ok())
        .ok_or(ReplyParseError::BadStatusLine)?;

    Ok((version, status))
}

/// Finds the end of an HTTP header block.
///
/// Returns the offset one past the blank line (`CRLF CRLF` or `LF LF`),
/// or `None` if the block is still incomplete.
pub fn headers_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some(i + 4);
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_end_crlf() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        assert_eq!(headers_end(buf), Some(38));
    }

    #[test]
    fn headers_end_lf() {
        let buf = b"HTTP/1.1 200 OK\nContent-Length: 4\n\nbody";
        assert_eq!(headers_end(buf), Some(35));
    }

    #[test]
    fn headers_end_incomplete() {
        assert_eq!(headers_end(b"HTTP/1.1 200 OK\r\nContent-"), None);
    }

    #[test]
    fn parses_reply() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 880\r\nContent-Type: text/html\r\n\r\nstuff";
        let mut reply = StoredReply::default();
        reply.parse(buf).unwrap();

        assert_eq!(reply.status, Some(StatusCode::OK));
        assert_eq!(reply.version, Version::HTTP_11);
        assert_eq!(reply.content_length, 880);
        assert_eq!(reply.hdr_sz, buf.len() - 5);
        assert_eq!(reply.headers.get("content-type").unwrap(), "text/html");
        assert_eq!(reply.expected_len(), Some(880 + (buf.len() as i64 - 5)));
    }

    #[test]
    fn missing_content_length_is_unknown() {
        let mut reply = StoredReply::default();
        reply.parse(b"HTTP/1.0 304 Not Modified\r\n\r\n").unwrap();
        assert_eq!(reply.content_length, -1);
        assert_eq!(reply.expected_len(), Some(29));
    }

    #[test]
    fn rejects_garbage() {
        let mut reply = StoredReply::default();
        assert!(matches!(
            reply.parse(b"ICY 200 OK\r\n\r\n"),
            Err(ReplyParseError::BadStatusLine)
        ));
        assert!(reply.status.is_none());
    }

    #[test]
    fn unparsed_reply_has_no_expected_len() {
        assert_eq!(StoredReply::default().expected_len(), None);
    }
}
