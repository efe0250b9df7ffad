//! Delivery of relayed messages to the upstream SMTP server.
//!
//! [`UpstreamSender`] is the seam between the relay handler and the wire,
//! [`SmtpUpstream`] is the production implementation on top of `lettre`.
//! The transport is built without connection pooling, every call to
//! [`UpstreamSender::send`] dials, authenticates, transmits and closes its
//! own connection, so a single instance can be shared by all sessions.

use std::{error::Error, future::Future, pin::Pin, time::Duration};

use lettre::{
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use tracing::{debug, info, warn};

use crate::{OutboundMessage, TlsMode, UpstreamConfig};

/// Boxed error returned by upstream senders, keeps the original cause.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Boxed future type for send operations, enabling object safety.
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

/// Trait for senders that deliver an [`OutboundMessage`] to the next hop.
///
/// Implementations must tolerate concurrent calls, the relay shares one
/// instance across all SMTP sessions.
pub trait UpstreamSender: Send + Sync {
    /// Delivers a single message, one call per relay attempt.
    fn send<'a>(&'a self, message: &'a OutboundMessage<'a>) -> SendFuture<'a>;

    /// Returns the name of this sender.
    fn name(&self) -> &str;
}

/// Upstream sender backed by an asynchronous `lettre` SMTP transport.
pub struct SmtpUpstream {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
}

impl SmtpUpstream {
    /// Creates a new [`SmtpUpstream`] bound to the configured host, port,
    /// TLS mode and credentials. No connection is opened here.
    pub fn new(config: &UpstreamConfig) -> Result<Self, lettre::transport::smtp::Error> {
        let host = config.host.as_str();
        let builder = match config.tls {
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
            TlsMode::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            TlsMode::Opportunistic => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .tls(Tls::Opportunistic(TlsParameters::new(host.to_string())?)),
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };

        let timeout = (config.timeout > 0).then(|| Duration::from_secs(config.timeout));
        let mut builder = builder.port(config.port).timeout(timeout);

        if config.has_auth() {
            builder = builder.credentials(Credentials::new(
                config.user.clone(),
                config.password.clone(),
            ));
        } else if !config.password.is_empty() {
            warn!("Upstream password given without a user, authentication disabled");
        }

        info!(
            host = %host,
            port = config.port,
            tls = %config.tls,
            auth = config.has_auth(),
            "Upstream SMTP client initialized"
        );

        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
            port: config.port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl UpstreamSender for SmtpUpstream {
    fn send<'a>(&'a self, message: &'a OutboundMessage<'a>) -> SendFuture<'a> {
        Box::pin(async move {
            let envelope = message.envelope()?;
            let raw = message.formatted();
            let payload = data_payload(&raw);
            debug!(
                message_id = %message.message_id(),
                host = %self.host,
                port = self.port,
                size = payload.len(),
                "Sending message upstream"
            );
            let response = self.transport.send_raw(&envelope, payload).await?;
            debug!(
                message_id = %message.message_id(),
                code = %response.code(),
                "Upstream accepted message"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

/// Returns the message without its final CRLF. The transport ends `DATA`
/// with `CRLF . CRLF`, which already terminates the last line.
fn data_payload(raw: &[u8]) -> &[u8] {
    raw.strip_suffix(b"\r\n").unwrap_or(raw)
}
