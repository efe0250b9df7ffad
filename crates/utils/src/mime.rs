//! RFC 5322 header framing helpers.
//!
//! The relay never rebuilds MIME structure, it only needs the header
//! section split from the body, so the framing is done here directly over
//! the raw bytes. Header values and the body stay borrowed from the payload
//! and are written back byte for byte.

use std::{
    borrow::Cow,
    io::{self, Write},
};

use thiserror::Error;

/// Errors raised while splitting a raw payload into headers and body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The payload contained no bytes at all.
    #[error("empty message payload")]
    Empty,

    /// A header line had no colon or an invalid field name.
    #[error("malformed header at line {line}")]
    MalformedHeader { line: usize },

    /// The first header line started with whitespace.
    #[error("continuation line at line {line} has no header to continue")]
    OrphanContinuation { line: usize },
}

/// A single header field.
///
/// The raw value holds the bytes after the colon exactly as received,
/// folding and 8-bit octets included, and is what gets written back out.
/// The unfolded value is a lossy UTF-8 rendering used for lookups and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header<'a> {
    name: Cow<'a, str>,
    value: String,
    raw_value: Cow<'a, [u8]>,
}

impl<'a> Header<'a> {
    /// Creates a generated header, written as `Name: value`.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Header<'static> {
        let value = value.into();
        let raw_value = format!(" {value}").into_bytes();
        Header {
            name: Cow::Owned(name.into()),
            value,
            raw_value: Cow::Owned(raw_value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the unfolded and trimmed value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the bytes after the colon, without the final line break.
    pub fn raw_value(&self) -> &[u8] {
        &self.raw_value
    }

    /// Returns whether this header has the given name (case-insensitive).
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Returns the serialized length including the trailing CRLF.
    pub fn encoded_len(&self) -> usize {
        self.name.len() + 1 + self.raw_value.len() + 2
    }

    /// Writes the header with its original folding, every line break
    /// normalized to CRLF.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(b":")?;
        for (index, segment) in self.raw_value.split(|&b| b == b'\n').enumerate() {
            if index > 0 {
                writer.write_all(b"\r\n")?;
            }
            writer.write_all(segment.strip_suffix(b"\r").unwrap_or(segment))?;
        }
        writer.write_all(b"\r\n")
    }
}

/// Parses the header section of a raw email, returning the ordered list of
/// headers and the byte offset where the body starts.
///
/// Header names keep their original case and duplicate headers such as
/// `Received` are preserved in order. Each header borrows its raw value
/// from `raw`, continuation lines included. A payload that ends before the
/// blank separator line is accepted and yields an empty body.
///
/// # Examples
///
/// ```rust
/// let raw = b"From: alice@example.com\r\nSubject: Hello\r\n  world\r\n\r\nHi!";
/// let (headers, offset) = smtp_relay_utils::parse_raw_headers(raw).unwrap();
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[1].name(), "Subject");
/// assert_eq!(headers[1].value(), "Hello world");
/// assert_eq!(headers[1].raw_value(), b" Hello\r\n  world");
/// assert_eq!(&raw[offset..], b"Hi!");
/// ```
///
/// A line without a colon is not a valid header:
///
/// ```rust
/// assert!(smtp_relay_utils::parse_raw_headers(b"just some text").is_err());
/// ```
pub fn parse_raw_headers(raw: &[u8]) -> Result<(Vec<Header<'_>>, usize), ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut headers: Vec<Header<'_>> = Vec::new();
    let mut value_start = 0;
    let mut pos = 0;
    let mut line_number = 0;

    while pos < raw.len() {
        let (line, next) = next_line(raw, pos);
        let line_end = pos + line.len();
        line_number += 1;

        // Blank line separates the header section from the body
        if line.is_empty() {
            return Ok((headers, next));
        }

        if line[0] == b' ' || line[0] == b'\t' {
            let header = headers
                .last_mut()
                .ok_or(ParseError::OrphanContinuation { line: line_number })?;
            let continuation = String::from_utf8_lossy(line);
            let continuation = continuation.trim();
            if !continuation.is_empty() {
                if !header.value.is_empty() {
                    header.value.push(' ');
                }
                header.value.push_str(continuation);
            }
            header.raw_value = Cow::Borrowed(&raw[value_start..line_end]);
        } else {
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(ParseError::MalformedHeader { line: line_number })?;
            let key = &line[..colon];
            if key.is_empty() || !key.iter().all(|&b| is_field_name_byte(b)) {
                return Err(ParseError::MalformedHeader { line: line_number });
            }
            let name = std::str::from_utf8(key)
                .map_err(|_| ParseError::MalformedHeader { line: line_number })?;
            value_start = pos + colon + 1;
            headers.push(Header {
                name: Cow::Borrowed(name),
                value: String::from_utf8_lossy(&line[colon + 1..]).trim().to_string(),
                raw_value: Cow::Borrowed(&raw[value_start..line_end]),
            });
        }

        pos = next;
    }

    Ok((headers, raw.len()))
}

/// Returns the first unfolded header value matching `name` (case-insensitive).
pub fn find_header<'a>(headers: &'a [Header<'_>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.is(name))
        .map(|header| header.value())
}

/// Decodes RFC 2047 encoded words in a header value for display purposes.
///
/// Falls back to the value as given when it cannot be decoded.
///
/// ```rust
/// assert_eq!(smtp_relay_utils::decode_header_value("=?UTF-8?B?SGVsbG8=?="), "Hello");
/// assert_eq!(smtp_relay_utils::decode_header_value("Plain"), "Plain");
/// ```
pub fn decode_header_value(value: &str) -> String {
    let line = format!("X-Decode: {value}");
    match mailparse::parse_header(line.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => value.to_string(),
    }
}

/// Field names are printable US-ASCII except colon (RFC 5322 section 2.2).
fn is_field_name_byte(byte: u8) -> bool {
    (33..=126).contains(&byte) && byte != b':'
}

/// Returns the line starting at `pos` without its terminator, together
/// with the offset of the following line. Accepts both CRLF and bare LF.
fn next_line(raw: &[u8], pos: usize) -> (&[u8], usize) {
    let (line, next) = match raw[pos..].iter().position(|&b| b == b'\n') {
        Some(index) => (&raw[pos..pos + index], pos + index + 1),
        None => (&raw[pos..], raw.len()),
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    (line, next)
}
