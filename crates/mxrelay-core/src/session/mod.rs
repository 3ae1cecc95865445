//! Inbound SMTP sessions.
//!
//! One [`Session`] per accepted connection. It owns the stream, reads one
//! CRLF line at a time, feeds it to the [`State`] machine and acts on the
//! [`Outcome`]: write a reply, upgrade to TLS, or hand a finished envelope
//! to the [`MailSink`].

mod state;

pub use state::{Outcome, Peer, Rejection, State};

use crate::config::Config;
use crate::dns::ReverseDns;
use crate::envelope::{Origin, Protocol};
use crate::relay::MailSink;
use crate::tls::CredentialProvider;
use crate::{Error, Result};
use mxrelay_smtp::{Reply, ReplyCode, SmtpStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

/// Shared collaborators of every session.
#[derive(Clone)]
pub struct Services {
    /// Configuration snapshot.
    pub config: Arc<Config>,
    /// Server credentials for STARTTLS.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Reverse DNS for Received traces.
    pub rdns: Arc<dyn ReverseDns>,
    /// Where finished envelopes go.
    pub sink: Arc<dyn MailSink>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One inbound SMTP conversation.
pub struct Session<S> {
    /// `None` only while a TLS handshake owns the transport.
    stream: Option<SmtpStream<S>>,
    state: State,
    peer: Peer,
    remote: SocketAddr,
    services: Services,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("state", &self.state.name())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a session for a freshly accepted connection. A stream that
    /// is already TLS (implicit TLS listener) starts out encrypted.
    pub fn new(stream: SmtpStream<S>, remote: SocketAddr, services: Services) -> Self {
        let peer = Peer {
            encrypted: stream.is_tls(),
            ..Peer::default()
        };
        Self {
            stream: Some(stream),
            state: State::Initial,
            peer,
            remote,
            services,
        }
    }

    /// Lets this client relay to foreign domains.
    #[must_use]
    pub const fn authenticated(mut self, authenticated: bool) -> Self {
        self.peer.authenticated = authenticated;
        self
    }

    /// Current protocol state.
    #[must_use]
    pub const fn state(&self) -> &State {
        &self.state
    }

    /// Sends the greeting and serves commands until QUIT, a fatal error or
    /// the client going away.
    ///
    /// # Errors
    ///
    /// Returns transport errors other than a clean disconnect.
    pub async fn run(mut self) -> Result<()> {
        info!(remote = %self.remote, tls = self.peer.encrypted, "session started");
        let banner = Reply::single(ReplyCode::SERVICE_READY, self.services.config.banner.clone());
        self.send(&banner).await?;

        let result = self.serve().await;

        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
        info!(remote = %self.remote, "session closed");
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(Error::Smtp(e)) if e.is_eof() => {
                    debug!(remote = %self.remote, "client disconnected");
                    return Ok(());
                }
                Err(Error::Smtp(mxrelay_smtp::Error::Timeout(after))) => {
                    info!(remote = %self.remote, ?after, "idle timeout");
                    let reply = Reply::single(
                        ReplyCode::SERVICE_UNAVAILABLE,
                        "Idle timeout, closing connection",
                    );
                    let _ = self.send(&reply).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(remote = %self.remote, "read failed: {e}");
                    let reply = Reply::single(ReplyCode::SERVICE_UNAVAILABLE, "Unknown error");
                    let _ = self.send(&reply).await;
                    return Err(e);
                }
            };

            let outcome = self
                .state
                .handle(&line, &mut self.peer, &self.services.config);

            match outcome {
                Outcome::Pending => {}
                Outcome::Reply(reply) => {
                    self.send(&reply).await?;
                    if reply.closes_connection() {
                        return Ok(());
                    }
                }
                Outcome::StartTls => {
                    if !self.start_tls().await? {
                        return Ok(());
                    }
                }
                Outcome::Complete(mail) => {
                    let rdns = self.services.rdns.hostname(self.remote.ip()).await;
                    let envelope = mail.finish(&self.origin(rdns));
                    info!(
                        remote = %self.remote,
                        id = envelope.id(),
                        from = %envelope.sender(),
                        recipients = envelope.recipients().len(),
                        "message accepted"
                    );
                    self.services.sink.submit(envelope);
                    self.send(&Reply::single(ReplyCode::OK, "OK")).await?;
                }
            }
        }
    }

    /// Runs STARTTLS. Returns false when the session must end.
    ///
    /// Once `220` is out the client expects a handshake, so any failure
    /// from here on, missing credentials included, ends the session.
    async fn start_tls(&mut self) -> Result<bool> {
        self.send(&Reply::single(ReplyCode::SERVICE_READY, "OK")).await?;

        let acceptor = match self.services.credentials.acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!(remote = %self.remote, "no TLS credentials: {e}");
                let _ = self.send(&handshake_failed()).await;
                return Ok(false);
            }
        };

        let stream = self.take_stream()?;
        match stream.accept_tls(&acceptor).await {
            Ok(stream) => {
                if let Some(info) = stream.tls_info() {
                    info!(remote = %self.remote, %info, "TLS established");
                }
                self.stream = Some(stream);
                self.peer.encrypted = true;
                Ok(true)
            }
            Err((e, recovered)) => {
                warn!(remote = %self.remote, "TLS handshake failed: {e}");
                if let Some(mut stream) = recovered {
                    let _ = stream.write_all(&handshake_failed().serialize()).await;
                    self.stream = Some(stream);
                }
                Ok(false)
            }
        }
    }

    fn origin(&self, rdns: Option<String>) -> Origin {
        Origin {
            helo: self.peer.helo.clone().unwrap_or_default(),
            rdns,
            ip: self.remote.ip(),
            protocol: Protocol::new(self.peer.extended, self.peer.encrypted),
            tls: self.stream.as_ref().and_then(SmtpStream::tls_info),
            by: self.services.config.mx_domain.clone(),
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let idle = self.services.config.idle_timeout();
        let receiving = matches!(self.state, State::ReceivingData(_));
        let stream = self.stream_mut()?;

        let line = match idle {
            Some(limit) => tokio::time::timeout(limit, stream.read_line())
                .await
                .map_err(|_| mxrelay_smtp::Error::Timeout(limit))??,
            None => stream.read_line().await?,
        };

        if receiving {
            trace!("C: {}", String::from_utf8_lossy(&line).trim_end());
        } else {
            debug!("C: {}", String::from_utf8_lossy(&line).trim_end());
        }
        Ok(line)
    }

    async fn send(&mut self, reply: &Reply) -> Result<()> {
        debug!("S: {}", reply.to_string().trim_end());
        self.stream_mut()?.write_all(&reply.serialize()).await?;
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut SmtpStream<S>> {
        self.stream.as_mut().ok_or_else(closed)
    }

    fn take_stream(&mut self) -> Result<SmtpStream<S>> {
        self.stream.take().ok_or_else(closed)
    }
}

fn handshake_failed() -> Reply {
    Reply::single(
        ReplyCode::SERVICE_UNAVAILABLE,
        "TLS handshake failed, terminating connection",
    )
}

fn closed() -> Error {
    Error::Smtp(mxrelay_smtp::Error::InvalidState("connection closed".into()))
}
