//! End-to-end inbound sessions over an in-memory duplex stream.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use mxrelay_core::tls::acceptor_from;
use mxrelay_core::{
    Config, CredentialProvider, Envelope, NoReverseDns, PemFiles, Services, Session,
    StaticAcceptor,
};
use mxrelay_smtp::SmtpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct Client<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Client<T> {
    fn new(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    fn into_inner(self) -> T {
        assert!(self.reader.buffer().is_empty(), "unread bytes before handshake");
        self.reader.into_inner().unsplit(self.writer)
    }

    async fn send(&mut self, line: &str) {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Reads one full reply and returns its code and lines.
    async fn reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a reply");
            let line = line.trim_end_matches("\r\n").to_string();
            let last = line.as_bytes().get(3) == Some(&b' ') || line.len() == 3;
            lines.push(line);
            if last {
                break;
            }
        }
        let code = lines[0][..3].parse().unwrap();
        (code, lines)
    }

    async fn code(&mut self, line: &str) -> u16 {
        self.send(line).await;
        self.reply().await.0
    }

    async fn at_eof(&mut self) -> bool {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap() == 0
    }
}

/// Self-signed credentials for `mx.test` and a connector that trusts them.
struct TestCa {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TestCa {
    fn new() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["mx.test".to_string()]).unwrap();
        let der: CertificateDer<'static> = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let acceptor = acceptor_from(vec![der.clone()], key).unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(der).unwrap();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            acceptor,
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    fn credentials(&self) -> Arc<dyn CredentialProvider> {
        Arc::new(StaticAcceptor(self.acceptor.clone()))
    }

    async fn connect<T>(&self, stream: T) -> TlsStream<T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from("mx.test".to_string()).unwrap();
        self.connector.connect(name, stream).await.unwrap()
    }
}

fn config(domain: &str) -> Config {
    Config {
        domain: domain.to_string(),
        mx_domain: "mx.test".to_string(),
        banner: "mxrelay test".to_string(),
        idle_timeout_secs: 0,
        ..Config::default()
    }
}

fn missing_credentials() -> Arc<dyn CredentialProvider> {
    Arc::new(PemFiles::new(
        PathBuf::from("/nonexistent/cert.pem"),
        PathBuf::from("/nonexistent/key.pem"),
    ))
}

/// Options for a spawned session.
struct Setup {
    config: Config,
    credentials: Arc<dyn CredentialProvider>,
    authenticated: bool,
}

impl Setup {
    fn new(domain: &str) -> Self {
        Self {
            config: config(domain),
            credentials: missing_credentials(),
            authenticated: false,
        }
    }

    fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    /// Spawns the session on a plaintext duplex and returns the client end.
    fn start(self) -> (DuplexStream, mpsc::UnboundedReceiver<Envelope>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let rx = self.spawn(SmtpStream::new(theirs));
        (ours, rx)
    }

    fn spawn<S>(self, stream: SmtpStream<S>) -> mpsc::UnboundedReceiver<Envelope>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let services = Services {
            config: Arc::new(self.config),
            credentials: self.credentials,
            rdns: Arc::new(NoReverseDns),
            sink: Arc::new(tx),
        };

        let remote: SocketAddr = "192.0.2.10:40000".parse().unwrap();
        let authenticated = self.authenticated;
        tokio::spawn(async move {
            let _ = Session::new(stream, remote, services)
                .authenticated(authenticated)
                .run()
                .await;
        });
        rx
    }
}

fn start(domain: &str) -> (Client<DuplexStream>, mpsc::UnboundedReceiver<Envelope>) {
    let (stream, rx) = Setup::new(domain).start();
    (Client::new(stream), rx)
}

#[tokio::test]
async fn test_greeting_banner() {
    let (mut client, _rx) = start("example.com");
    let (code, lines) = client.reply().await;
    assert_eq!(code, 220);
    assert_eq!(lines, vec!["220 mxrelay test"]);
}

#[tokio::test]
async fn test_full_transaction() {
    let (mut client, mut rx) = start("y.com");
    client.reply().await;

    let (code, lines) = {
        client.send("EHLO mx1").await;
        client.reply().await
    };
    assert_eq!(code, 250);
    assert_eq!(lines, vec!["250-Hello there, mx1!", "250 STARTTLS"]);

    assert_eq!(client.code("MAIL FROM:<a@x.com>").await, 250);
    assert_eq!(client.code("RCPT TO:<b@y.com>").await, 250);
    assert_eq!(client.code("DATA").await, 354);
    client.send("Subject: test").await;
    client.send("").await;
    client.send("..hidden dot").await;
    assert_eq!(client.code(".").await, 250);

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.sender().to_string(), "a@x.com");
    assert_eq!(envelope.data(), b"Subject: test\r\n\r\n..hidden dot\r\n");
    // SHA-256 of the data plus the terminating ".\r\n".
    assert_eq!(
        envelope.id(),
        "04f82f7f493b7449ff96dc5635e6ce90086d969347cf2a0582aa1d3fc0aa8436"
    );

    let groups = envelope.by_domain();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, "y.com");
    assert_eq!(groups[0].1.len(), 1);

    let trace = envelope.received_for(&groups[0].1[0]);
    assert!(trace.starts_with("Received: from mx1 ( [192.0.2.10])\r\n"));
    assert!(trace.contains("\tby mx.test with ESMTP\r\n"));
    assert!(trace.contains(&format!("\tid {}\r\n", envelope.id())));
    assert!(trace.contains("\tfor <b@y.com>;\r\n"));

    // The session is back in the greeted state and accepts a new envelope.
    assert_eq!(client.code("MAIL FROM:<c@x.com>").await, 250);
    assert_eq!(client.code("QUIT").await, 221);
    assert!(client.at_eof().await);
}

#[tokio::test]
async fn test_helo_session_uses_smtp_label() {
    let (mut client, mut rx) = start("example.com");
    client.reply().await;

    assert_eq!(client.code("HELO legacy").await, 250);
    assert_eq!(client.code("MAIL FROM:<a@x.com>").await, 250);
    assert_eq!(client.code("RCPT TO:<b@example.com>").await, 250);
    assert_eq!(client.code("DATA").await, 354);
    assert_eq!(client.code(".").await, 250);

    let envelope = rx.recv().await.unwrap();
    assert!(envelope.data().is_empty());
    let trace = envelope.received_for(&envelope.recipients()[0]);
    assert!(trace.contains("\tby mx.test with SMTP\r\n"));
}

#[tokio::test]
async fn test_relay_authorization() {
    let (mut client, _rx) = start("example.com");
    client.reply().await;

    assert_eq!(client.code("EHLO client").await, 250);
    assert_eq!(client.code("MAIL FROM:<a@b.com>").await, 250);
    assert_eq!(client.code("RCPT TO:<x@remote.tld>").await, 530);
    assert_eq!(client.code("RCPT TO:<x@example.com>").await, 250);
}

#[tokio::test]
async fn test_authenticated_session_may_relay() {
    let (stream, mut rx) = Setup::new("example.com").authenticated().start();
    let mut client = Client::new(stream);
    client.reply().await;

    assert_eq!(client.code("EHLO client").await, 250);
    assert_eq!(client.code("MAIL FROM:<a@b.com>").await, 250);
    assert_eq!(client.code("RCPT TO:<x@remote.tld>").await, 250);
    assert_eq!(client.code("DATA").await, 354);
    assert_eq!(client.code(".").await, 250);

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.by_domain()[0].0, "remote.tld");
}

#[tokio::test]
async fn test_sequencing_errors() {
    let (mut client, _rx) = start("example.com");
    client.reply().await;

    assert_eq!(client.code("MAIL FROM:<a@b.com>").await, 503);
    assert_eq!(client.code("BOGUS").await, 500);
    assert_eq!(client.code("VRFY user").await, 252);
    assert_eq!(client.code("NOOP").await, 250);
    assert_eq!(client.code("EHLO client").await, 250);
    assert_eq!(client.code("RCPT TO:<x@example.com>").await, 503);
    assert_eq!(client.code("MAIL FROM:<a@b.com>").await, 250);
    assert_eq!(client.code("DATA").await, 354);
}

#[tokio::test]
async fn test_starttls_without_credentials_closes() {
    let (mut client, _rx) = start("example.com");
    client.reply().await;

    assert_eq!(client.code("EHLO client").await, 250);
    assert_eq!(client.code("STARTTLS").await, 220);
    let (code, lines) = client.reply().await;
    assert_eq!(code, 421);
    assert_eq!(lines, vec!["421 TLS handshake failed, terminating connection"]);
    assert!(client.at_eof().await);
}

#[tokio::test]
async fn test_starttls_upgrades_in_place() {
    let ca = TestCa::new();
    let (stream, mut rx) = Setup::new("example.com")
        .credentials(ca.credentials())
        .start();
    let mut client = Client::new(stream);
    client.reply().await;

    assert_eq!(client.code("EHLO client").await, 250);
    assert_eq!(client.code("MAIL FROM:<a@x.com>").await, 250);
    assert_eq!(client.code("STARTTLS").await, 220);

    let mut client = Client::new(ca.connect(client.into_inner()).await);

    // The envelope survives the upgrade.
    assert_eq!(client.code("RCPT TO:<b@example.com>").await, 250);

    client.send("EHLO client").await;
    let (code, lines) = client.reply().await;
    assert_eq!(code, 250);
    assert_eq!(lines, vec!["250-Hello there, client!", "250 AUTH PLAIN"]);

    // A second STARTTLS does not start another handshake.
    let (code, lines) = {
        client.send("STARTTLS").await;
        client.reply().await
    };
    assert_eq!(code, 454);
    assert_eq!(lines, vec!["454 TLS already in use"]);

    assert_eq!(client.code("MAIL FROM:<a@x.com>").await, 250);
    assert_eq!(client.code("RCPT TO:<b@example.com>").await, 250);
    assert_eq!(client.code("DATA").await, 354);
    client.send("hi").await;
    assert_eq!(client.code(".").await, 250);

    let envelope = rx.recv().await.unwrap();
    let trace = envelope.received_for(&envelope.recipients()[0]);
    assert!(trace.contains("\tby mx.test with ESMTPS\r\n"), "{trace}");
    assert!(trace.contains("\t(version=TLSv1_3 cipher=TLS13_"), "{trace}");

    assert_eq!(client.code("QUIT").await, 221);
}

#[tokio::test]
async fn test_pipelined_ehlo_and_starttls() {
    let ca = TestCa::new();
    let (stream, _rx) = Setup::new("example.com")
        .credentials(ca.credentials())
        .start();
    let mut client = Client::new(stream);
    client.reply().await;

    client.send_raw(b"EHLO client\r\nSTARTTLS\r\n").await;
    assert_eq!(client.reply().await.0, 250);
    assert_eq!(client.reply().await.0, 220);

    let mut client = Client::new(ca.connect(client.into_inner()).await);
    assert_eq!(client.code("NOOP").await, 250);
    assert_eq!(client.code("STARTTLS").await, 454);
}

#[tokio::test]
async fn test_failed_handshake_replies_421_and_closes() {
    let ca = TestCa::new();
    let (stream, _rx) = Setup::new("example.com")
        .credentials(ca.credentials())
        .start();
    let mut client = Client::new(stream);
    client.reply().await;

    assert_eq!(client.code("EHLO client").await, 250);
    assert_eq!(client.code("STARTTLS").await, 220);
    client.send("this is not a TLS ClientHello").await;

    // The server may emit a TLS alert before falling back to plaintext.
    let mut rest = Vec::new();
    client.reader.read_to_end(&mut rest).await.unwrap();
    let rest = String::from_utf8_lossy(&rest);
    assert!(
        rest.contains("421 TLS handshake failed, terminating connection\r\n"),
        "{rest:?}"
    );
}

#[tokio::test]
async fn test_implicit_tls_session_starts_encrypted() {
    let ca = TestCa::new();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let acceptor = ca.acceptor.clone();

    let accept = tokio::spawn(async move { acceptor.accept(theirs).await.unwrap() });
    let tls = ca.connect(ours).await;
    let server = accept.await.unwrap();

    let _rx = Setup::new("example.com")
        .spawn(SmtpStream::from_tls(tokio_rustls::TlsStream::Server(server)));
    let mut client = Client::new(tls);
    assert_eq!(client.reply().await.0, 220);

    client.send("EHLO client").await;
    let (_, lines) = client.reply().await;
    assert_eq!(lines.last().unwrap(), "250 AUTH PLAIN");
    assert_eq!(client.code("STARTTLS").await, 454);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout() {
    let mut setup = Setup::new("example.com");
    setup.config.idle_timeout_secs = 30;
    let (stream, _rx) = setup.start();
    let mut client = Client::new(stream);
    client.reply().await;

    let (code, _) = client.reply().await;
    assert_eq!(code, 421);
    assert!(client.at_eof().await);
}

#[tokio::test]
async fn test_overlong_line_closes_session() {
    let (client, _rx) = start("example.com");
    let Client {
        mut reader,
        mut writer,
    } = client;

    let mut greeting = String::new();
    reader.read_line(&mut greeting).await.unwrap();

    tokio::spawn(async move {
        let junk = vec![b'a'; mxrelay_smtp::connection::MAX_LINE_LENGTH + 4096];
        let _ = writer.write_all(&junk).await;
    });

    let mut reply = String::new();
    reader.read_line(&mut reply).await.unwrap();
    assert!(reply.starts_with("421 "), "{reply:?}");
}
