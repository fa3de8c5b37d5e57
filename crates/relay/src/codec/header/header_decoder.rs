//! Line-level decoding of an HTTP head
//!
//! The framer hands each complete line here as soon as it has been read, so a
//! head is never required to be in memory as a whole. Lines are decoded
//! leniently where forwarding can still be correct (an unparsable status code
//! becomes `-1`) and strictly where framing depends on them (`Content-Length`,
//! `Transfer-Encoding`).
//!
//! # Limits
//!
//! - A header line must be a token field name, a `:` and a value
//! - Obsolete line folding is rejected
//! - `Transfer-Encoding` must end with `chunked`

use http::header;
use httparse::Status;

use crate::codec::body::BodyMode;
use crate::ensure;
use crate::protocol::{Direction, HttpMessage, ParseError, StartLine};

/// Splits a start line into at most three space-separated tokens.
///
/// For responses everything after the status code, spaces included, is the
/// reason phrase. Missing tokens are left empty.
pub fn parse_start_line(direction: Direction, line: &[u8]) -> StartLine {
    let text = String::from_utf8_lossy(line);
    let mut tokens = text.trim_end_matches(['\r', '\n']).splitn(3, ' ');
    let mut next = || tokens.next().unwrap_or_default().to_owned();

    match direction {
        Direction::Request => StartLine::Request { method: next(), path: next(), version: next() },
        Direction::Response => {
            let version = next();
            let status = next().trim().parse::<i32>().unwrap_or(-1);
            StartLine::Response { version, status, reason: next() }
        }
    }
}

/// Decodes one header line, validated with `httparse`.
///
/// # Returns
///
/// - `Ok(None)` for the empty line that ends the header block
/// - `Ok(Some((name, value)))` with the value trimmed
/// - `Err(ParseError)` for a missing `:`, a field name that is not a token,
///   or a value with forbidden bytes
pub fn parse_header_line(line: &[u8]) -> Result<Option<(String, String)>, ParseError> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    ensure!(!matches!(line.first(), Some(b' ' | b'\t')), ParseError::invalid_header("obsolete line folding"));

    // a lone header line plus the blank line that ends a block
    let mut block = line.trim_ascii_end().to_vec();
    block.extend_from_slice(b"\r\n\r\n");

    let mut headers = [httparse::EMPTY_HEADER; 1];
    match httparse::parse_headers(&block, &mut headers) {
        Ok(Status::Complete((_, [header]))) => Ok(Some((
            header.name.to_owned(),
            String::from_utf8_lossy(header.value.trim_ascii()).into_owned(),
        ))),
        Ok(_) => Err(ParseError::invalid_header(format!("incomplete header {:?}", String::from_utf8_lossy(line)))),
        Err(e) => Err(ParseError::invalid_header(format!("{e} in {:?}", String::from_utf8_lossy(line)))),
    }
}

/// The framing-significant headers seen so far in one head.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramingHeaders {
    chunked: bool,
    content_length: Option<u64>,
}

impl FramingHeaders {
    /// Folds one received header into the framing decision.
    ///
    /// # Errors
    ///
    /// - `Transfer-Encoding` whose final coding is not `chunked`
    /// - `Content-Length` that is not a non-negative integer, or that
    ///   disagrees with an earlier `Content-Length`
    pub fn observe(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        if name.eq_ignore_ascii_case(header::TRANSFER_ENCODING.as_str()) {
            ensure!(is_chunked(value), ParseError::unsupported_transfer_encoding(value));
            self.chunked = true;
        } else if name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()) {
            let length =
                value.parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {value} is not u64")))?;

            if let Some(previous) = self.content_length {
                ensure!(
                    previous == length,
                    ParseError::invalid_content_length(format!("conflicting values {previous} and {length}"))
                );
            }
            self.content_length = Some(length);
        }
        Ok(())
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Chooses how the body that follows the head is delimited.
    ///
    /// Chunked wins over `Content-Length`. Responses to `HEAD`, and 1xx, 204
    /// and 304 responses never have a body.
    pub fn body_mode(&self, message: &HttpMessage, request: Option<&HttpMessage>) -> BodyMode {
        if message.direction() == Direction::Response {
            let status = message.status();
            let head_request = request.is_some_and(|r| r.method().eq_ignore_ascii_case("HEAD"));
            if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
                return BodyMode::None;
            }
        }

        match (self.chunked, self.content_length) {
            (true, _) => BodyMode::Chunked,
            (false, Some(length)) if length > 0 => BodyMode::Fixed(length),
            _ => BodyMode::None,
        }
    }
}

/// Checks if a Transfer-Encoding value ends with the chunked coding.
///
/// According to RFC 9112, chunked must be the last encoding if present.
fn is_chunked(value: &str) -> bool {
    value.rsplit(',').next().is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;

    #[test]
    fn check_is_chunked() {
        assert!(is_chunked("chunked"));
        assert!(is_chunked("Chunked"));
        assert!(is_chunked("gzip, chunked"));
        assert!(!is_chunked("chunked, gzip"));
        assert!(!is_chunked("gzip"));
        assert!(!is_chunked(""));
    }

    #[test]
    fn request_line() {
        let line = parse_start_line(Direction::Request, b"GET /index.html HTTP/1.1\r\n");
        assert_eq!(
            line,
            StartLine::Request { method: "GET".into(), path: "/index.html".into(), version: "HTTP/1.1".into() }
        );
    }

    #[test]
    fn status_line_reason_keeps_spaces() {
        let line = parse_start_line(Direction::Response, b"HTTP/1.1 404 Not Found Here\r\n");
        assert_eq!(
            line,
            StartLine::Response { version: "HTTP/1.1".into(), status: 404, reason: "Not Found Here".into() }
        );
    }

    #[test]
    fn malformed_status_is_minus_one() {
        let line = parse_start_line(Direction::Response, b"HTTP/1.1 OK\n");
        assert_eq!(line, StartLine::Response { version: "HTTP/1.1".into(), status: -1, reason: String::new() });
    }

    #[test]
    fn header_lines() {
        assert_eq!(
            parse_header_line(b"Host:  127.0.0.1:8080 \r\n").unwrap(),
            Some(("Host".to_owned(), "127.0.0.1:8080".to_owned()))
        );
        assert_eq!(parse_header_line(b"X-Empty:\r\n").unwrap(), Some(("X-Empty".to_owned(), String::new())));
        assert_eq!(parse_header_line(b"\r\n").unwrap(), None);
        assert_eq!(parse_header_line(b" \t\n").unwrap(), None);
    }

    #[test]
    fn bad_header_lines() {
        assert!(parse_header_line(b"no separator\r\n").is_err());
        assert!(parse_header_line(b": value\r\n").is_err());
        assert!(parse_header_line(b" folded: value\r\n").is_err());
        assert!(parse_header_line(b"bad name: value\r\n").is_err());
    }

    #[test]
    fn header_names_and_values_must_be_clean() {
        assert!(parse_header_line(b"Host : x\r\n").is_err());
        assert!(parse_header_line(b"Bad\x01Name: v\r\n").is_err());
        assert!(parse_header_line(b"X-Ctl: a\x01b\r\n").is_err());
        assert_eq!(
            parse_header_line(b"X-Tab:\tone\ttwo\n").unwrap(),
            Some(("X-Tab".to_owned(), "one\ttwo".to_owned()))
        );
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut framing = FramingHeaders::default();
        framing.observe("Content-Length", "5").unwrap();
        framing.observe("transfer-encoding", "chunked").unwrap();

        let message = HttpMessage::new(Direction::Request);
        assert_eq!(framing.body_mode(&message, None), BodyMode::Chunked);
    }

    #[test]
    fn content_length_errors() {
        let mut framing = FramingHeaders::default();
        assert!(matches!(framing.observe("Content-Length", "-1"), Err(ParseError::InvalidContentLength { .. })));
        assert!(matches!(framing.observe("Content-Length", "abc"), Err(ParseError::InvalidContentLength { .. })));

        framing.observe("Content-Length", "3").unwrap();
        framing.observe("Content-Length", "3").unwrap();
        assert!(framing.observe("Content-Length", "4").is_err());
    }

    #[test]
    fn unsupported_transfer_encoding() {
        let mut framing = FramingHeaders::default();
        assert!(matches!(
            framing.observe("Transfer-Encoding", "gzip"),
            Err(ParseError::UnsupportedTransferEncoding { .. })
        ));
    }

    #[test]
    fn head_response_has_no_body() {
        let mut framing = FramingHeaders::default();
        framing.observe("Content-Length", "42").unwrap();

        let mut request = HttpMessage::new(Direction::Request);
        request.set_start_line(parse_start_line(Direction::Request, b"HEAD / HTTP/1.1\r\n"));
        request.push_header(Header::new("Host", "x"));

        let mut response = HttpMessage::new(Direction::Response);
        response.set_start_line(parse_start_line(Direction::Response, b"HTTP/1.1 200 OK\r\n"));

        assert_eq!(framing.body_mode(&response, Some(&request)), BodyMode::None);
        assert_eq!(framing.body_mode(&response, None), BodyMode::Fixed(42));

        response.set_start_line(parse_start_line(Direction::Response, b"HTTP/1.1 304 Not Modified\r\n"));
        assert_eq!(framing.body_mode(&response, None), BodyMode::None);
    }
}
