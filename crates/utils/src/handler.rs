//! The relay handler, turning one accepted SMTP transaction into one
//! outbound message.
//!
//! Every attempt gets a fresh [`MessageId`] before anything else happens,
//! so that all of its log lines (received, parsed, relayed or failed) can
//! be correlated. The handler keeps no state between calls and can be
//! invoked concurrently from any number of sessions.

use std::{error::Error as StdError, future::Future, pin::Pin, sync::Arc};

use lettre::message::Mailbox;
use thiserror::Error;
use tracing::{error, info};

use crate::{
    decode_header_value, BoxError, Header, InboundEnvelope, MessageId, MessageIdGenerator,
    OutboundMessage, ParseError, ParsedMessage, UpstreamSender,
};

/// Headers never copied from the inbound payload, the envelope is the
/// authoritative source for sender and recipients.
pub const EXCLUDED_HEADERS: &[&str] = &["From", "To"];

/// Content type used when the inbound message does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=us-ascii";

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Boxed future type for handler operations, enabling object safety.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = RelayResult<MessageId>> + Send + 'a>>;

/// Errors for a single address or address list.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("no recipient addresses given")]
    Empty,

    #[error("invalid address {address:?}")]
    Malformed {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
}

/// Errors that end a relay attempt. All of them are per-message, none is
/// fatal to the process, and none is retried here.
///
/// The message names the failed step only, the cause is reachable through
/// [`source`](std::error::Error::source) (see [`error_chain`]).
#[derive(Debug, Error)]
pub enum RelayError {
    /// The raw payload is not a valid RFC 5322 message.
    #[error("failed to read message")]
    ParseFailure(#[from] ParseError),

    /// The resolved sender is not a valid mailbox.
    #[error("failed to set sender address")]
    InvalidSender(#[source] AddressError),

    /// A recipient is not a valid mailbox, or there is none.
    #[error("failed to set receiver addresses")]
    InvalidRecipient(#[source] AddressError),

    /// The upstream server could not be reached or refused the message.
    #[error("upstream delivery failed")]
    UpstreamDelivery(#[source] BoxError),
}

/// Trait for handlers invoked by the SMTP listener once per accepted
/// transaction.
pub trait MessageHandler: Send + Sync {
    /// Handles an accepted transaction, returning the assigned Message-ID.
    fn handle<'a>(&'a self, envelope: &'a InboundEnvelope) -> HandlerFuture<'a>;

    /// Returns the name of this handler.
    fn name(&self) -> &str;
}

/// Message handler that relays every message to the upstream server,
/// optionally rewriting the envelope sender.
pub struct RelayHandler {
    upstream: Arc<dyn UpstreamSender>,
    message_ids: MessageIdGenerator,
    sender_overwrite: Option<String>,
}

impl RelayHandler {
    /// Creates a new [`RelayHandler`] submitting through `upstream`.
    pub fn new(upstream: Arc<dyn UpstreamSender>, message_ids: MessageIdGenerator) -> Self {
        info!(upstream = upstream.name(), "Relay handler initialized");
        Self {
            upstream,
            message_ids,
            sender_overwrite: None,
        }
    }

    /// Sets the sender used instead of the envelope sender, a blank value
    /// keeps the envelope sender.
    pub fn with_sender_overwrite(mut self, sender: Option<&str>) -> Self {
        self.sender_overwrite = sender
            .map(str::trim)
            .filter(|sender| !sender.is_empty())
            .map(str::to_string);
        if let Some(sender) = &self.sender_overwrite {
            info!(sender = %sender, "Overwriting sender");
        }
        self
    }

    /// Returns the sender for a message with the given envelope sender.
    ///
    /// The body's `From` header is never consulted.
    pub fn resolve_sender<'a>(&'a self, envelope_from: &'a str) -> &'a str {
        self.sender_overwrite.as_deref().unwrap_or(envelope_from)
    }

    /// Relays a single accepted transaction to the upstream server.
    ///
    /// Parsing and address validation happen before any upstream contact,
    /// a failure there never reaches the upstream sender.
    pub async fn relay(&self, envelope: &InboundEnvelope) -> RelayResult<MessageId> {
        let message_id = self.message_ids.generate();
        info!(
            message_id = %message_id,
            origin = %envelope.origin,
            envelope_from = ?envelope.from,
            rcpt_count = envelope.rcpts.len(),
            bytes = envelope.data.len(),
            "Incoming message"
        );

        let parsed = ParsedMessage::parse(&envelope.data).map_err(|e| {
            error!(
                message_id = %message_id,
                error = %error_chain(&e),
                "Failed to read message"
            );
            RelayError::ParseFailure(e)
        })?;

        let content_type = parsed.content_type().unwrap_or(DEFAULT_CONTENT_TYPE);
        info!(
            message_id = %message_id,
            subject = ?decode_header_value(parsed.subject()),
            content_type = ?content_type,
            "Parsed headers"
        );

        let headers = outbound_headers(&parsed, &message_id);

        let sender = parse_mailbox(self.resolve_sender(&envelope.from)).map_err(|e| {
            error!(
                message_id = %message_id,
                error = %error_chain(&e),
                "Failed to set sender address"
            );
            RelayError::InvalidSender(e)
        })?;

        let recipients = parse_recipients(&envelope.rcpts).map_err(|e| {
            error!(
                message_id = %message_id,
                error = %error_chain(&e),
                "Failed to set receiver addresses"
            );
            RelayError::InvalidRecipient(e)
        })?;

        let outbound =
            OutboundMessage::new(message_id.clone(), sender, recipients, headers, parsed.body());

        self.upstream.send(&outbound).await.map_err(|e| {
            error!(
                message_id = %message_id,
                error = %error_chain(&*e),
                "Upstream send failed"
            );
            RelayError::UpstreamDelivery(e)
        })?;

        info!(message_id = %message_id, "Successfully relayed");
        Ok(message_id)
    }
}

impl MessageHandler for RelayHandler {
    fn handle<'a>(&'a self, envelope: &'a InboundEnvelope) -> HandlerFuture<'a> {
        Box::pin(self.relay(envelope))
    }

    fn name(&self) -> &str {
        "relay"
    }
}

/// Renders an error followed by its chain of causes, separated by `: `.
///
/// A cause whose text the previous message already carries is skipped.
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

/// Returns whether a header must not be copied to the outbound message.
pub fn is_excluded_header(name: &str) -> bool {
    EXCLUDED_HEADERS
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(name))
}

/// Builds the outbound header list: every inbound header except the
/// excluded ones and any inbound `Message-ID`, then the generated
/// `Message-ID` and, when missing, the default `Content-Type`.
///
/// Copied headers keep their raw bytes, folding included.
fn outbound_headers<'a>(parsed: &ParsedMessage<'a>, message_id: &MessageId) -> Vec<Header<'a>> {
    let mut headers: Vec<Header<'a>> = parsed
        .headers()
        .iter()
        .filter(|header| !is_excluded_header(header.name()) && !header.is("Message-ID"))
        .cloned()
        .collect();

    headers.push(Header::new("Message-ID", message_id.header_value()));

    if parsed.content_type().is_none() {
        headers.push(Header::new("Content-Type", DEFAULT_CONTENT_TYPE));
    }

    headers
}

fn parse_mailbox(address: &str) -> Result<Mailbox, AddressError> {
    address
        .trim()
        .parse()
        .map_err(|source| AddressError::Malformed {
            address: address.to_string(),
            source,
        })
}

fn parse_recipients(rcpts: &[String]) -> Result<Vec<Mailbox>, AddressError> {
    if rcpts.is_empty() {
        return Err(AddressError::Empty);
    }
    rcpts.iter().map(|rcpt| parse_mailbox(rcpt)).collect()
}
