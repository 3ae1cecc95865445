//! Type-state SMTP relay client.
//!
//! Drives one conversation with a remote mail exchanger: greeting,
//! EHLO (with a single HELO fallback), opportunistic STARTTLS, then any
//! number of single-recipient transactions and QUIT.

use super::SmtpStream;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply_lines};
use crate::types::{Address, Extension, Reply, ReplyCode};
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Type-state marker: greeting received, not yet introduced.
#[derive(Debug)]
pub struct Connected;

/// Type-state marker: EHLO/HELO accepted, ready for transactions.
#[derive(Debug)]
pub struct Ready;

/// SMTP client with type-state pattern.
#[derive(Debug)]
pub struct Client<S, State> {
    stream: SmtpStream<S>,
    /// Reply to the last successful EHLO, `None` after a HELO fallback.
    ehlo: Option<Reply>,
    _state: PhantomData<State>,
}

impl<S> Client<S, Connected>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a client from a stream and reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the greeting fails or the server does not
    /// answer 220. In the latter case QUIT is sent before giving up.
    pub async fn from_stream(mut stream: SmtpStream<S>) -> Result<Self> {
        let greeting = read_reply(&mut stream).await?;
        let mut client = Self {
            stream,
            ehlo: None,
            _state: PhantomData,
        };

        if greeting.code != ReplyCode::SERVICE_READY {
            client.abort().await;
            return Err(Error::smtp_error(
                greeting.code.as_u16(),
                greeting.message_text(),
            ));
        }

        Ok(client)
    }

    /// Introduces ourselves with EHLO, falling back to HELO once if the
    /// server does not recognise EHLO (500).
    ///
    /// # Errors
    ///
    /// Returns an error if neither greeting is accepted.
    pub async fn hello(mut self, our_hostname: &str) -> Result<Client<S, Ready>> {
        let reply = self.send_command(&Command::ehlo(our_hostname)).await?;

        if reply.code == ReplyCode::OK {
            self.ehlo = Some(reply);
            return Ok(self.into_state());
        }

        if reply.code != ReplyCode::SYNTAX_ERROR {
            self.abort().await;
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }

        let reply = self.send_command(&Command::helo(our_hostname)).await?;
        if reply.code != ReplyCode::OK {
            self.abort().await;
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }

        Ok(self.into_state())
    }
}

impl<S> Client<S, Ready>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns true if the EHLO reply mentions STARTTLS and the connection
    /// is still plaintext.
    #[must_use]
    pub fn offers_starttls(&self) -> bool {
        !self.stream.is_tls()
            && self
                .ehlo
                .as_ref()
                .is_some_and(|reply| reply.advertises(&Extension::StartTls.to_string()))
    }

    /// Returns true if the connection is encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Upgrades the connection with STARTTLS and greets again.
    ///
    /// The certificate is verified against `server_name` using the trust
    /// anchors of `connector`.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS is refused, the handshake fails or the
    /// post-handshake EHLO is not accepted.
    pub async fn starttls(
        mut self,
        connector: &TlsConnector,
        server_name: &str,
        our_hostname: &str,
    ) -> Result<Self> {
        let reply = self.send_command(&Command::starttls()).await?;
        if reply.code != ReplyCode::SERVICE_READY {
            self.abort().await;
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }

        debug!(server = server_name, "starting TLS handshake");
        self.stream = self.stream.upgrade_to_tls(connector, server_name).await?;

        let reply = self.send_command(&Command::ehlo(our_hostname)).await?;
        if reply.code != ReplyCode::OK {
            self.abort().await;
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }
        self.ehlo = Some(reply);

        Ok(self)
    }

    /// Runs one mail transaction for a single recipient.
    ///
    /// `trace` is written ahead of `data`, which must already be in wire
    /// form (CRLF lines, dot-stuffed); the terminator is appended here.
    ///
    /// # Errors
    ///
    /// A rejected MAIL, RCPT or DATA is answered with RSET and reported as
    /// [`Error::SmtpError`]; the connection remains usable. A non-2xx reply
    /// to the message itself is reported the same way. Any other error
    /// means the connection is broken.
    pub async fn send_mail(
        &mut self,
        from: &Address,
        to: &Address,
        trace: &[u8],
        data: &[u8],
    ) -> Result<Reply> {
        let reply = self.send_command(&Command::mail_from(from)).await?;
        if reply.code != ReplyCode::OK {
            return self.reject(reply).await;
        }

        let reply = self.send_command(&Command::rcpt_to(to)).await?;
        if reply.code != ReplyCode::OK {
            return self.reject(reply).await;
        }

        // 250 is not conformant here, but some servers send it.
        let reply = self.send_command(&Command::data()).await?;
        if reply.code != ReplyCode::START_DATA && reply.code != ReplyCode::OK {
            return self.reject(reply).await;
        }

        debug!(recipient = %to, bytes = data.len(), "C: <message data>");
        self.stream.write_all(trace).await?;
        self.stream.write_all(data).await?;
        if !data.is_empty() && !data.ends_with(b"\r\n") {
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;

        let reply = read_reply(&mut self.stream).await?;
        if !reply.is_success() {
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }

        Ok(reply)
    }

    async fn reject(&mut self, reply: Reply) -> Result<Reply> {
        self.send_command(&Command::rset()).await?;
        Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()))
    }
}

// Common implementation for all states
impl<S, State> Client<S, State>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send_command(&mut self, cmd: &Command) -> Result<Reply> {
        debug!("C: {cmd}");
        self.stream.write_all(&cmd.serialize()).await?;
        read_reply(&mut self.stream).await
    }

    fn into_state<Next>(self) -> Client<S, Next> {
        Client {
            stream: self.stream,
            ehlo: self.ehlo,
            _state: PhantomData,
        }
    }

    /// Best-effort QUIT before dropping the connection.
    async fn abort(&mut self) {
        if let Err(e) = self.send_command(&Command::quit()).await {
            debug!("QUIT after failure was not acknowledged: {e}");
        }
        let _ = self.stream.shutdown().await;
    }

    /// Sends QUIT and closes the connection (available in any state).
    ///
    /// # Errors
    ///
    /// Returns an error if the QUIT command fails.
    pub async fn quit(mut self) -> Result<()> {
        let reply = self.send_command(&Command::quit()).await?;
        let _ = self.stream.shutdown().await;

        if !reply.is_success() {
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }

        Ok(())
    }
}

/// Reads a complete, possibly multi-line, reply.
async fn read_reply<S>(stream: &mut SmtpStream<S>) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let raw = stream.read_line().await?;
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches("\r\n")
            .to_string();
        debug!("S: {line}");

        let is_last = line.len() <= 3 || is_last_reply_line(&line);
        lines.push(line);

        if is_last {
            break;
        }
    }

    parse_reply_lines(&lines)
}
