//! Message types flowing through a relay attempt.
//!
//! [`InboundEnvelope`] is what the SMTP listener hands over after `DATA`,
//! [`ParsedMessage`] is the read-only header/body view of its payload and
//! [`OutboundMessage`] is the transformed message submitted upstream.

use std::{
    io::{self, Write},
    net::SocketAddr,
};

use lettre::{address::Envelope, message::Mailbox};

use crate::{find_header, parse_raw_headers, Header, MessageId, ParseError};

/// Width past which the generated `To` line is folded between recipients.
const FOLD_WIDTH: usize = 78;

/// An accepted SMTP transaction, owned by a single handler invocation.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Network address of the connecting SMTP client.
    pub origin: SocketAddr,

    /// Envelope sender from `MAIL FROM`, empty for the null reverse-path.
    pub from: String,

    /// Envelope recipients from `RCPT TO`, in the order they were given.
    pub rcpts: Vec<String>,

    /// Raw message payload (headers + body) as received after `DATA`.
    pub data: Vec<u8>,
}

impl InboundEnvelope {
    pub fn new(origin: SocketAddr, from: &str, rcpts: &[&str], data: &[u8]) -> Self {
        Self {
            origin,
            from: from.to_string(),
            rcpts: rcpts.iter().map(|rcpt| rcpt.to_string()).collect(),
            data: data.to_vec(),
        }
    }
}

/// Header/body view of a raw payload.
///
/// Headers are kept as an ordered `Vec` (RFC 5322 order, duplicates such as
/// `Received` preserved). The body is borrowed from the payload, it is never
/// copied.
#[derive(Debug)]
pub struct ParsedMessage<'a> {
    headers: Vec<Header<'a>>,
    body: &'a [u8],
}

impl<'a> ParsedMessage<'a> {
    /// Splits a raw payload into headers and body.
    pub fn parse(raw: &'a [u8]) -> Result<Self, ParseError> {
        let (headers, offset) = parse_raw_headers(raw)?;
        Ok(Self {
            headers,
            body: &raw[offset..],
        })
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn headers(&self) -> &[Header<'a>] {
        &self.headers
    }

    pub fn subject(&self) -> &str {
        self.header("Subject").unwrap_or_default()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }
}

/// The message submitted to the upstream server for one relay attempt.
///
/// Sender and recipients are rendered as the `From`/`To` header lines on
/// serialization, the remaining headers are written in order after them
/// with their raw bytes, followed by the body.
#[derive(Debug)]
pub struct OutboundMessage<'a> {
    message_id: MessageId,
    sender: Mailbox,
    recipients: Vec<Mailbox>,
    headers: Vec<Header<'a>>,
    body: &'a [u8],
}

impl<'a> OutboundMessage<'a> {
    pub fn new(
        message_id: MessageId,
        sender: Mailbox,
        recipients: Vec<Mailbox>,
        headers: Vec<Header<'a>>,
        body: &'a [u8],
    ) -> Self {
        Self {
            message_id,
            sender,
            recipients,
            headers,
            body,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn sender(&self) -> &Mailbox {
        &self.sender
    }

    pub fn recipients(&self) -> &[Mailbox] {
        &self.recipients
    }

    /// Returns the headers emitted besides `From` and `To`.
    pub fn headers(&self) -> &[Header<'a>] {
        &self.headers
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Builds the SMTP envelope (`MAIL FROM` / `RCPT TO`) for this message.
    pub fn envelope(&self) -> Result<Envelope, lettre::error::Error> {
        Envelope::new(
            Some(self.sender.email.clone()),
            self.recipients
                .iter()
                .map(|mailbox| mailbox.email.clone())
                .collect(),
        )
    }

    /// Writes the full message (header block, blank line, body) to `writer`.
    ///
    /// The `To` line is folded between recipients once it would grow past
    /// 78 characters.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write!(writer, "From: {}\r\n", self.sender)?;
        writer.write_all(b"To:")?;
        let mut line_len = "To:".len();
        for (index, recipient) in self.recipients.iter().enumerate() {
            let recipient = recipient.to_string();
            if index > 0 {
                writer.write_all(b",")?;
                line_len += 1;
                if line_len + 1 + recipient.len() > FOLD_WIDTH {
                    writer.write_all(b"\r\n")?;
                    line_len = 0;
                }
            }
            write!(writer, " {recipient}")?;
            line_len += 1 + recipient.len();
        }
        writer.write_all(b"\r\n")?;
        for header in &self.headers {
            header.write_to(writer)?;
        }
        writer.write_all(b"\r\n")?;
        writer.write_all(self.body)
    }

    /// Returns the serialized message, see [`write_to`](Self::write_to).
    pub fn formatted(&self) -> Vec<u8> {
        let headers_len: usize = self.headers.iter().map(|h| h.encoded_len()).sum();
        let mut raw = Vec::with_capacity(headers_len + self.body.len() + 256);
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut raw);
        raw
    }
}
