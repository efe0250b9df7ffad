//! Minimal inbound SMTP listener feeding accepted transactions to a
//! [`MessageHandler`].
//!
//! Each connection runs its own [`SmtpSession`] on a dedicated task, the
//! handler is shared by all of them. The session speaks just enough ESMTP
//! for local clients: no AUTH, no STARTTLS, no queueing. The reply to
//! `DATA` is sent only after the handler returned, so the client learns
//! whether the message actually reached the upstream server.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use crate::{InboundEnvelope, ListenConfig, MessageHandler, MessageId, RelayError, RelayResult};

/// Per-session limits and identity, derived from [`ListenConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,

    /// Maximum message size in bytes, `0` disables the limit.
    pub max_message_size: usize,

    /// Maximum recipients per transaction, `0` disables the limit.
    pub max_recipients: usize,

    /// Idle timeout while waiting for a line, `None` waits forever.
    pub timeout: Option<Duration>,
}

impl From<&ListenConfig> for SessionSettings {
    fn from(config: &ListenConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            max_message_size: config.max_message_size,
            max_recipients: config.max_recipients,
            timeout: (config.timeout > 0).then(|| Duration::from_secs(config.timeout)),
        }
    }
}

/// TCP listener accepting SMTP connections.
pub struct SmtpServer {
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    handler: Arc<dyn MessageHandler>,
}

impl SmtpServer {
    /// Binds the listener to the configured address and port.
    pub async fn bind(config: &ListenConfig, handler: Arc<dyn MessageHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        info!(
            address = %listener.local_addr()?,
            handler = handler.name(),
            "SMTP listener bound"
        );
        Ok(Self {
            listener,
            settings: Arc::new(SessionSettings::from(config)),
            handler,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until accepting fails, spawning one session
    /// task per connection.
    pub async fn serve(self) -> io::Result<()> {
        loop {
            let (stream, origin) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(origin = %origin, error = %e, "Failed to set TCP_NODELAY");
            }

            let mut session = SmtpSession::new(origin, self.settings.clone(), self.handler.clone());
            tokio::spawn(async move {
                debug!(origin = %origin, "SMTP connection opened");
                if let Err(e) = session.run(stream).await {
                    warn!(origin = %origin, error = %e, "SMTP session ended with error");
                }
                debug!(origin = %origin, "SMTP connection closed");
            });
        }
    }
}

/// State of a single SMTP connection.
///
/// The transaction state (sender and recipients) is cleared after every
/// `DATA`, `RSET` and `EHLO`, a connection can carry several messages.
pub struct SmtpSession {
    origin: SocketAddr,
    settings: Arc<SessionSettings>,
    handler: Arc<dyn MessageHandler>,
    greeted: bool,
    from: Option<String>,
    rcpts: Vec<String>,
}

impl SmtpSession {
    pub fn new(
        origin: SocketAddr,
        settings: Arc<SessionSettings>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            origin,
            settings,
            handler,
            greeted: false,
            from: None,
            rcpts: Vec::new(),
        }
    }

    /// Runs the session over `stream` until the client quits, disconnects
    /// or stays idle past the timeout.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(&mut self, stream: S) -> io::Result<()> {
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = Vec::with_capacity(1024);

        let greeting = format!("{} ESMTP smtp-relay", self.settings.hostname);
        self.write_response(&mut writer, 220, &greeting).await?;

        loop {
            line.clear();
            match self.read_line(&mut reader, &mut line, MAX_COMMAND_LINE).await? {
                LineRead::Line => {}
                LineRead::Eof => break,
                LineRead::TooLong => {
                    self.write_response(&mut writer, 500, "Line too long").await?;
                    continue;
                }
                LineRead::Idle => {
                    debug!(origin = %self.origin, "SMTP session timed out");
                    self.write_timeout(&mut writer).await?;
                    break;
                }
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            trace!(origin = %self.origin, line = %text, "<<");

            let (command, arg) = match text.split_once(' ') {
                Some((command, arg)) => (command.to_ascii_uppercase(), arg.trim()),
                None => (text.to_ascii_uppercase(), ""),
            };

            if !self
                .handle_command(&mut reader, &mut writer, &command, arg)
                .await?
            {
                break;
            }
        }

        writer.shutdown().await.ok();
        Ok(())
    }

    /// Dispatches a single command, returns `false` once the session must
    /// be closed.
    async fn handle_command<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        command: &str,
        arg: &str,
    ) -> io::Result<bool> {
        match command {
            "EHLO" => self.handle_ehlo(writer, arg).await?,
            "HELO" => self.handle_helo(writer, arg).await?,
            "MAIL" => self.handle_mail(writer, arg).await?,
            "RCPT" => self.handle_rcpt(writer, arg).await?,
            "DATA" => return self.handle_data(reader, writer).await,
            "RSET" => {
                self.reset();
                self.write_response(writer, 250, "Ok").await?;
            }
            "NOOP" => self.write_response(writer, 250, "Ok").await?,
            "VRFY" => {
                self.write_response(
                    writer,
                    252,
                    "Cannot VRFY user, but will accept message and attempt delivery",
                )
                .await?
            }
            "QUIT" => {
                self.write_response(writer, 221, "Bye").await?;
                return Ok(false);
            }
            _ => {
                self.write_response(writer, 502, "Command not implemented")
                    .await?
            }
        }
        Ok(true)
    }

    async fn handle_ehlo<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, arg: &str) -> io::Result<()> {
        if arg.is_empty() {
            return self.write_response(writer, 501, "Syntax: EHLO hostname").await;
        }
        self.reset();
        self.greeted = true;

        let greeting = format!("{} greets {arg}", self.settings.hostname);
        let size = match self.settings.max_message_size {
            0 => "SIZE".to_string(),
            max => format!("SIZE {max}"),
        };
        self.write_multiple(writer, 250, &[&greeting, "PIPELINING", "8BITMIME", &size])
            .await
    }

    async fn handle_helo<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, arg: &str) -> io::Result<()> {
        if arg.is_empty() {
            return self.write_response(writer, 501, "Syntax: HELO hostname").await;
        }
        self.reset();
        self.greeted = true;
        self.write_response(writer, 250, &self.settings.hostname).await
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, arg: &str) -> io::Result<()> {
        if !self.greeted {
            return self.write_response(writer, 503, "Send HELO/EHLO first").await;
        }
        if self.from.is_some() {
            return self.write_response(writer, 503, "Nested MAIL command").await;
        }

        let Some((path, params)) = strip_keyword(arg, "FROM:").and_then(parse_path) else {
            return self
                .write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
        };

        let declared_size = params
            .split_whitespace()
            .find_map(|param| strip_keyword(param, "SIZE="))
            .and_then(|size| size.parse::<usize>().ok());
        if let Some(size) = declared_size {
            if self.exceeds_size(size) {
                return self
                    .write_response(writer, 552, "Message size exceeds fixed maximum message size")
                    .await;
            }
        }

        self.from = Some(path.to_string());
        self.write_response(writer, 250, "Ok").await
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, arg: &str) -> io::Result<()> {
        if self.from.is_none() {
            return self.write_response(writer, 503, "Need MAIL command").await;
        }

        let path = strip_keyword(arg, "TO:")
            .and_then(parse_path)
            .map(|(path, _)| path)
            .filter(|path| !path.is_empty());
        let Some(path) = path else {
            return self
                .write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
        };

        if self.settings.max_recipients > 0 && self.rcpts.len() >= self.settings.max_recipients {
            return self.write_response(writer, 452, "Too many recipients").await;
        }

        self.rcpts.push(path.to_string());
        self.write_response(writer, 250, "Ok").await
    }

    async fn handle_data<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<bool> {
        if self.from.is_none() {
            self.write_response(writer, 503, "Need MAIL command").await?;
            return Ok(true);
        }
        if self.rcpts.is_empty() {
            self.write_response(writer, 503, "Need RCPT command").await?;
            return Ok(true);
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let Some(data) = self.read_data(reader).await? else {
            self.write_timeout(writer).await?;
            return Ok(false);
        };

        let from = self.from.take().unwrap_or_default();
        let rcpts = std::mem::take(&mut self.rcpts);

        let Some(data) = data else {
            self.write_response(writer, 552, "Message size exceeds fixed maximum message size")
                .await?;
            return Ok(true);
        };

        let envelope = InboundEnvelope {
            origin: self.origin,
            from,
            rcpts,
            data,
        };
        let result = self.handler.handle(&envelope).await;
        let (code, message) = relay_reply(&result);
        self.write_response(writer, code, &message).await?;
        Ok(true)
    }

    /// Reads the message payload up to the terminating `.` line, undoing
    /// dot-stuffing and normalizing line endings to CRLF.
    ///
    /// The outer `None` means the client went idle, the inner `None` means
    /// the payload exceeded the size limit (it is consumed but discarded,
    /// never buffered past the limit).
    async fn read_data<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> io::Result<Option<Option<Vec<u8>>>> {
        let mut data = Vec::new();
        let mut line = Vec::with_capacity(1024);
        let mut too_large = false;

        loop {
            // Room for the remaining allowance plus a dot and CRLF
            let limit = match self.settings.max_message_size {
                _ if too_large => MAX_DISCARD_LINE,
                0 => usize::MAX,
                max => max.saturating_sub(data.len()).saturating_add(3),
            };

            line.clear();
            match self.read_line(reader, &mut line, limit).await? {
                LineRead::Line => {}
                LineRead::TooLong => {
                    too_large = true;
                    data = Vec::new();
                    continue;
                }
                LineRead::Eof => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during DATA",
                    ))
                }
                LineRead::Idle => return Ok(None),
            }

            let content = line
                .strip_suffix(b"\n")
                .map(|content| content.strip_suffix(b"\r").unwrap_or(content))
                .unwrap_or(&line[..]);
            if content == b"." {
                break;
            }
            let content = content.strip_prefix(b".").unwrap_or(content);

            if too_large {
                continue;
            }
            if self.exceeds_size(data.len() + content.len() + 2) {
                too_large = true;
                data = Vec::new();
                continue;
            }
            data.extend_from_slice(content);
            data.extend_from_slice(b"\r\n");
        }

        Ok(Some((!too_large).then_some(data)))
    }

    /// Reads one line of at most `limit` bytes into `buffer`, subject to
    /// the idle timeout.
    async fn read_line<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
        buffer: &mut Vec<u8>,
        limit: usize,
    ) -> io::Result<LineRead> {
        match self.settings.timeout {
            Some(duration) => timeout(duration, read_bounded_line(reader, buffer, limit))
                .await
                .unwrap_or(Ok(LineRead::Idle)),
            None => read_bounded_line(reader, buffer, limit).await,
        }
    }

    fn exceeds_size(&self, size: usize) -> bool {
        self.settings.max_message_size > 0 && size > self.settings.max_message_size
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn write_timeout<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let message = format!("{} Timeout, closing connection", self.settings.hostname);
        self.write_response(writer, 421, &message).await
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        let line = format!("{code}{separator}{message}");
        trace!(origin = %self.origin, line = %line, ">>");
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await
    }

    async fn write_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> io::Result<()> {
        self.write_inner(writer, code, message, " ").await
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[&str],
    ) -> io::Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let is_last = index == messages.len() - 1;
            let separator = if is_last { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await?;
        }
        Ok(())
    }
}

/// Maximum command line length, verb and CRLF included (RFC 5321 4.5.3.1.4).
const MAX_COMMAND_LINE: usize = 512;

/// Line cap used while draining an oversized payload, only the terminating
/// `.` line matters at that point.
const MAX_DISCARD_LINE: usize = 1024;

/// Outcome of reading a single line from the client.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    /// The line exceeded the limit, it was consumed up to its LF but
    /// not buffered.
    TooLong,
    Eof,
    Idle,
}

/// Reads up to and including the next LF, buffering at most `limit`
/// bytes. Bytes past the limit are consumed and dropped so memory stays
/// bounded whatever the client sends.
async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    let mut too_long = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (too_long, buffer.is_empty()) {
                (true, _) => LineRead::TooLong,
                (false, true) => LineRead::Eof,
                (false, false) => LineRead::Line,
            });
        }

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(index) => (&available[..=index], true),
            None => (available, false),
        };
        let used = chunk.len();
        if !too_long {
            if buffer.len() + used > limit {
                too_long = true;
                buffer.clear();
            } else {
                buffer.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if complete {
            return Ok(if too_long {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}

/// Maps the outcome of a relay attempt to the reply sent after `DATA`.
pub fn relay_reply(result: &RelayResult<MessageId>) -> (u16, String) {
    match result {
        Ok(message_id) => (250, format!("Ok: relayed as {}", message_id.header_value())),
        Err(RelayError::ParseFailure(_)) => (554, "Message could not be parsed".to_string()),
        Err(RelayError::InvalidSender(_)) => (553, "Invalid sender address".to_string()),
        Err(RelayError::InvalidRecipient(_)) => (553, "Invalid recipient address".to_string()),
        Err(RelayError::UpstreamDelivery(_)) => (
            451,
            "Unable to relay message, try again later".to_string(),
        ),
    }
}

/// Strips an ASCII case-insensitive keyword prefix such as `FROM:`.
fn strip_keyword<'a>(value: &'a str, keyword: &str) -> Option<&'a str> {
    let head = value.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &value[keyword.len()..])
}

/// Splits `<path> params` into the bare address and the parameter string.
///
/// Angle brackets are optional, the null path `<>` yields an empty address
/// and source routes (`<@a,@b:user@host>`) are dropped.
fn parse_path(value: &str) -> Option<(&str, &str)> {
    let value = value.trim_start();
    let (path, params) = match value.strip_prefix('<') {
        Some(rest) => {
            let end = rest.find('>')?;
            (rest[..end].trim(), rest[end + 1..].trim())
        }
        None => {
            let mut parts = value.splitn(2, char::is_whitespace);
            let path = parts.next().filter(|path| !path.is_empty())?;
            (path, parts.next().unwrap_or_default().trim())
        }
    };
    let path = match path.split_once(':') {
        Some((route, mailbox)) if route.starts_with('@') => mailbox,
        _ => path,
    };
    Some((path, params))
}
