//! Low-level SMTP stream handling.
//!
//! [`SmtpStream`] owns the connection and frames it into CRLF-terminated
//! lines. Switching to TLS consumes the stream and returns a new one, so
//! no handle to the pre-handshake transport survives the upgrade.

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsAcceptor, TlsConnector, TlsStream,
    rustls::{ClientConfig, RootCertStore},
};
use tracing::warn;

/// Maximum line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MB

/// SMTP stream (plaintext or TLS) over any duplex transport.
#[derive(Debug)]
pub enum SmtpStream<S> {
    /// Plaintext connection.
    Plain(BufReader<S>),
    /// TLS-encrypted connection, client or server side.
    Tls(Box<BufReader<TlsStream<S>>>),
}

/// Negotiated TLS parameters, for trace headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Protocol version, e.g. `TLSv1_3`.
    pub version: String,
    /// Cipher suite, e.g. `TLS13_AES_256_GCM_SHA384`.
    pub cipher: String,
}

impl std::fmt::Display for TlsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(version={} cipher={})", self.version, self.cipher)
    }
}

impl<S> SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a plaintext transport.
    pub fn new(stream: S) -> Self {
        Self::Plain(BufReader::new(stream))
    }

    /// Wraps a transport that already completed a TLS handshake.
    pub fn from_tls(stream: TlsStream<S>) -> Self {
        Self::Tls(Box::new(BufReader::new(stream)))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Returns the negotiated TLS version and cipher suite.
    #[must_use]
    pub fn tls_info(&self) -> Option<TlsInfo> {
        let Self::Tls(reader) = self else {
            return None;
        };
        let (_, state) = reader.get_ref().get_ref();
        let version = state.protocol_version()?;
        let suite = state.negotiated_cipher_suite()?;
        Some(TlsInfo {
            version: format!("{version:?}"),
            cipher: format!("{:?}", suite.suite()),
        })
    }

    /// Reads one CRLF-terminated line, terminator included.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails, the peer closes the connection
    /// mid-line, or the line exceeds [`MAX_LINE_LENGTH`].
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Plain(reader) => read_crlf_line(reader).await,
            Self::Tls(reader) => read_crlf_line(&mut **reader).await,
        }
    }

    /// Writes data to the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    /// Shuts down the write half of the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Plain(reader) => reader.get_mut().shutdown().await?,
            Self::Tls(reader) => reader.get_mut().shutdown().await?,
        }
        Ok(())
    }

    /// Upgrades a plaintext stream to TLS as the client, verifying the
    /// server certificate against `hostname`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already encrypted, the hostname is
    /// not a valid DNS name, or the TLS handshake fails.
    pub async fn upgrade_to_tls(self, connector: &TlsConnector, hostname: &str) -> Result<Self> {
        let stream = match self {
            Self::Plain(reader) => into_unbuffered(reader),
            Self::Tls(_) => return Err(Error::InvalidState("Already using TLS".into())),
        };

        let server_name = ServerName::try_from(hostname.to_string())?;

        let tls_stream = connector.connect(server_name, stream).await?;
        Ok(Self::from_tls(TlsStream::Client(tls_stream)))
    }

    /// Performs the server side of a TLS handshake over this stream.
    ///
    /// On failure the plaintext stream is handed back when the transport
    /// survived the attempt, so the caller can still send a final reply.
    ///
    /// # Errors
    ///
    /// Returns the handshake error and, if recoverable, the original stream.
    pub async fn accept_tls(
        self,
        acceptor: &TlsAcceptor,
    ) -> std::result::Result<Self, (Error, Option<Self>)> {
        let stream = match self {
            Self::Plain(reader) => into_unbuffered(reader),
            Self::Tls(_) => {
                return Err((Error::InvalidState("Already using TLS".into()), Some(self)));
            }
        };

        match acceptor.accept(stream).into_fallible().await {
            Ok(tls_stream) => Ok(Self::from_tls(TlsStream::Server(tls_stream))),
            Err((e, stream)) => Err((Error::Io(e), Some(Self::new(stream)))),
        }
    }
}

/// Drops the read buffer before a TLS handshake.
///
/// Anything buffered was pipelined in plaintext after STARTTLS and must not
/// be interpreted once the channel is encrypted.
fn into_unbuffered<S: AsyncRead>(reader: BufReader<S>) -> S {
    let pending = reader.buffer().len();
    if pending > 0 {
        warn!(bytes = pending, "discarding plaintext pipelined after STARTTLS");
    }
    reader.into_inner()
}

async fn read_crlf_line<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }

        // A CR may end one read and its LF start the next.
        let carried_cr = line.last() == Some(&b'\r') && buf[0] == b'\n';
        if carried_cr {
            line.push(b'\n');
            reader.consume(1);
            break;
        }

        if let Some(pos) = find_crlf(buf) {
            line.extend_from_slice(&buf[..pos + 2]);
            reader.consume(pos + 2);
            break;
        }

        let len = buf.len();
        line.extend_from_slice(buf);
        reader.consume(len);

        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::Protocol("line too long".to_string()));
        }
    }

    Ok(line)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Connects to an SMTP server over plain TCP within `timeout`.
///
/// # Errors
///
/// Returns an error if the connection fails or does not complete in time.
pub async fn connect(hostname: &str, port: u16, timeout: Duration) -> Result<SmtpStream<TcpStream>> {
    let addr = format!("{hostname}:{port}");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    Ok(SmtpStream::new(stream))
}

/// Creates a TLS connector trusting the webpki root certificates.
#[must_use]
pub fn default_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
