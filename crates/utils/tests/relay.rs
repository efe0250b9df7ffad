use std::sync::{Arc, Mutex};

use smtp_relay_utils::{
    HandlerFuture, InboundEnvelope, ListenConfig, MessageHandler, MessageIdGenerator, RelayError,
    RelayHandler, SmtpServer, SmtpUpstream, TlsMode, UpstreamConfig,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

/// Stand-in for the upstream server, records every accepted transaction.
struct Mailbox {
    accept: bool,
    message_ids: MessageIdGenerator,
    received: Mutex<Vec<InboundEnvelope>>,
}

impl Mailbox {
    fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self {
            accept,
            message_ids: MessageIdGenerator::new("upstream.test".to_string()),
            received: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<InboundEnvelope> {
        self.received.lock().unwrap().clone()
    }
}

impl MessageHandler for Mailbox {
    fn handle<'a>(&'a self, envelope: &'a InboundEnvelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            if !self.accept {
                return Err(RelayError::UpstreamDelivery("mailbox unavailable".into()));
            }
            self.received.lock().unwrap().push(envelope.clone());
            Ok(self.message_ids.generate())
        })
    }

    fn name(&self) -> &str {
        "mailbox"
    }
}

fn listen_config(hostname: &str) -> ListenConfig {
    ListenConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        hostname: hostname.to_string(),
        ..Default::default()
    }
}

/// Starts a listener backed by `handler` and returns its port.
async fn start_server(hostname: &str, handler: Arc<dyn MessageHandler>) -> u16 {
    let server = SmtpServer::bind(&listen_config(hostname), handler)
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());
    port
}

fn relay_handler(upstream_port: u16, overwrite: Option<&str>) -> RelayHandler {
    let upstream = SmtpUpstream::new(&UpstreamConfig {
        host: "127.0.0.1".to_string(),
        port: upstream_port,
        tls: TlsMode::None,
        timeout: 10,
        ..Default::default()
    })
    .unwrap();
    RelayHandler::new(
        Arc::new(upstream),
        MessageIdGenerator::new("relay.test".to_string()),
    )
    .with_sender_overwrite(overwrite)
}

fn inbound(data: &str) -> InboundEnvelope {
    InboundEnvelope::new(
        "127.0.0.1:40000".parse().unwrap(),
        "alice@example.com",
        &["bob@example.net", "carol@example.org"],
        data.as_bytes(),
    )
}

async fn expect_reply<R: AsyncBufRead + Unpin>(reader: &mut R, code: &str) -> String {
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with(code), "expected {code}, got {line:?}");
        if line.as_bytes().get(3) != Some(&b'-') {
            return line;
        }
    }
}

#[tokio::test]
async fn test_relay_through_smtp_upstream() {
    let mailbox = Mailbox::new(true);
    let port = start_server("upstream.test", mailbox.clone()).await;
    let handler = relay_handler(port, Some("relay@example.com"));

    let message_id = handler
        .relay(&inbound(
            "From: Alice <alice@example.com>\r\n\
             To: Bob <bob@example.net>\r\n\
             Subject: Hi\r\n\
             Message-ID: <client@example.com>\r\n\
             \r\n\
             hello\r\n\
             .leading dot\r\n",
        ))
        .await
        .unwrap();

    let received = mailbox.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, "relay@example.com");
    assert_eq!(received[0].rcpts, vec!["bob@example.net", "carol@example.org"]);

    let data = String::from_utf8(received[0].data.clone()).unwrap();
    let expected = format!(
        "From: relay@example.com\r\n\
         To: bob@example.net, carol@example.org\r\n\
         Subject: Hi\r\n\
         Message-ID: {}\r\n\
         Content-Type: text/plain; charset=us-ascii\r\n\
         \r\n\
         hello\r\n\
         .leading dot\r\n",
        message_id.header_value()
    );
    assert_eq!(data, expected);
}

#[tokio::test]
async fn test_relay_body_without_final_line_break() {
    let mailbox = Mailbox::new(true);
    let port = start_server("upstream.test", mailbox.clone()).await;
    let handler = relay_handler(port, Some("relay@example.com"));

    let message_id = handler
        .relay(&inbound("Subject: Hi\r\n\r\nhello"))
        .await
        .unwrap();

    let data = String::from_utf8(mailbox.received()[0].data.clone()).unwrap();
    assert_eq!(
        data,
        format!(
            "From: relay@example.com\r\n\
             To: bob@example.net, carol@example.org\r\n\
             Subject: Hi\r\n\
             Message-ID: {}\r\n\
             Content-Type: text/plain; charset=us-ascii\r\n\
             \r\n\
             hello\r\n",
            message_id.header_value()
        )
    );
}

#[tokio::test]
async fn test_relay_folded_header_over_the_wire() {
    let mailbox = Mailbox::new(true);
    let port = start_server("upstream.test", mailbox.clone()).await;
    let handler = relay_handler(port, Some("relay@example.com"));

    let references = (0..40)
        .map(|index| format!("<thread-{index:03}.part@mail.client.example.com>"))
        .collect::<Vec<_>>()
        .join("\r\n ");
    let data = format!("Subject: Re: thread\r\nReferences: {references}\r\n\r\nhello\r\n");
    handler.relay(&inbound(&data)).await.unwrap();

    let data = String::from_utf8(mailbox.received()[0].data.clone()).unwrap();
    assert!(data.split("\r\n").all(|line| line.len() <= 998));
    assert!(data.contains(&format!("\r\nReferences: {references}\r\n")));
    assert!(data.ends_with("\r\n\r\nhello\r\n"));
}

#[tokio::test]
async fn test_relay_upstream_rejection() {
    let mailbox = Mailbox::new(false);
    let port = start_server("upstream.test", mailbox.clone()).await;
    let handler = relay_handler(port, None);

    let result = handler.relay(&inbound("Subject: Hi\r\n\r\nhello")).await;

    assert!(matches!(result, Err(RelayError::UpstreamDelivery(_))));
    assert!(mailbox.received().is_empty());
}

#[tokio::test]
async fn test_relay_upstream_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let handler = relay_handler(port, None);
    let result = handler.relay(&inbound("Subject: Hi\r\n\r\nhello")).await;

    assert!(matches!(result, Err(RelayError::UpstreamDelivery(_))));
}

#[tokio::test]
async fn test_full_chain_over_tcp() {
    let mailbox = Mailbox::new(true);
    let upstream_port = start_server("upstream.test", mailbox.clone()).await;
    let relay_port = start_server(
        "relay.test",
        Arc::new(relay_handler(upstream_port, Some("relay@example.com"))),
    )
    .await;

    let stream = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    expect_reply(&mut reader, "220").await;
    writer.write_all(b"EHLO client.test\r\n").await.unwrap();
    expect_reply(&mut reader, "250").await;
    writer
        .write_all(b"MAIL FROM:<alice@example.com>\r\n")
        .await
        .unwrap();
    expect_reply(&mut reader, "250").await;
    writer.write_all(b"RCPT TO:<bob@example.net>\r\n").await.unwrap();
    expect_reply(&mut reader, "250").await;
    writer.write_all(b"DATA\r\n").await.unwrap();
    expect_reply(&mut reader, "354").await;
    writer
        .write_all(b"Subject: Hi\r\nFrom: alice@example.com\r\n\r\nhello\r\n.\r\n")
        .await
        .unwrap();
    let reply = expect_reply(&mut reader, "250").await;
    assert!(reply.starts_with("250 Ok: relayed as <"));
    assert!(reply.contains("@relay.test>"));

    writer.write_all(b"DATA\r\n").await.unwrap();
    expect_reply(&mut reader, "503").await;
    writer.write_all(b"QUIT\r\n").await.unwrap();
    expect_reply(&mut reader, "221").await;

    let received = mailbox.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, "relay@example.com");
    assert_eq!(received[0].rcpts, vec!["bob@example.net"]);

    let data = String::from_utf8(received[0].data.clone()).unwrap();
    let relayed_id = reply
        .trim_end()
        .trim_start_matches("250 Ok: relayed as ")
        .to_string();
    assert_eq!(
        data,
        format!(
            "From: relay@example.com\r\n\
             To: bob@example.net\r\n\
             Subject: Hi\r\n\
             Message-ID: {relayed_id}\r\n\
             Content-Type: text/plain; charset=us-ascii\r\n\
             \r\n\
             hello\r\n"
        )
    );
}

#[tokio::test]
async fn test_full_chain_rejects_unparseable_message() {
    let mailbox = Mailbox::new(true);
    let upstream_port = start_server("upstream.test", mailbox.clone()).await;
    let relay_port = start_server("relay.test", Arc::new(relay_handler(upstream_port, None))).await;

    let stream = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    expect_reply(&mut reader, "220").await;
    writer
        .write_all(
            b"HELO client.test\r\n\
              MAIL FROM:<alice@example.com>\r\n\
              RCPT TO:<bob@example.net>\r\n\
              DATA\r\n",
        )
        .await
        .unwrap();
    expect_reply(&mut reader, "250").await;
    expect_reply(&mut reader, "250").await;
    expect_reply(&mut reader, "250").await;
    expect_reply(&mut reader, "354").await;
    writer
        .write_all(b"not a header line\r\n\r\nbody\r\n.\r\n")
        .await
        .unwrap();
    let reply = expect_reply(&mut reader, "554").await;

    assert_eq!(reply, "554 Message could not be parsed\r\n");
    assert!(mailbox.received().is_empty());
}
