use std::fmt::Display;

use tracing::info;
use uuid::Uuid;

/// Identifier assigned to a single relay attempt, RFC 5322 msg-id format
/// without the surrounding angle brackets (`id-left@id-right`).
///
/// It is generated before the payload is parsed and is immutable once
/// assigned, so it correlates every log line of the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Returns the identifier without angle brackets.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the value of the `Message-ID` header (`<id-left@id-right>`).
    pub fn header_value(&self) -> String {
        format!("<{}>", self.0)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a fresh [`MessageId`] for every relay attempt.
///
/// The left part is a random UUID (simple format), the right part is the
/// configured domain, usually the relay's hostname.
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    domain: String,
}

impl MessageIdGenerator {
    /// Creates a new [`MessageIdGenerator`] with the given domain for generated IDs.
    pub fn new(domain: String) -> Self {
        info!(domain = %domain, "Message-ID generator initialized");
        Self { domain }
    }

    /// Generates a new, unique [`MessageId`].
    pub fn generate(&self) -> MessageId {
        MessageId(format!("{}@{}", Uuid::new_v4().simple(), self.domain))
    }

    /// Returns the domain used as the right part of generated IDs.
    pub fn domain(&self) -> &str {
        &self.domain
    }
}
