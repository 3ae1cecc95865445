//! Listeners.
//!
//! Every accepted connection is served by its own task. Plaintext
//! listeners offer STARTTLS; the implicit TLS listener handshakes before
//! the greeting.

use crate::config::Config;
use crate::dns::{MxResolver, SystemResolver};
use crate::mailbox::MailboxDir;
use crate::relay::Relay;
use crate::session::{Services, Session};
use crate::tls::PemFiles;
use crate::Result;
use mxrelay_smtp::SmtpStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsStream;
use tracing::{debug, error, info, warn};

/// The SMTP server.
#[derive(Debug, Clone)]
pub struct Server {
    services: Services,
}

impl Server {
    /// Creates a server with the given collaborators.
    #[must_use]
    pub const fn new(services: Services) -> Self {
        Self { services }
    }

    /// Wires the production collaborators: PEM credentials, system DNS,
    /// mailbox directory and the MX relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the system resolver cannot be configured.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let resolver = Arc::new(SystemResolver::from_system_conf()?);
        let mailboxes = Arc::new(MailboxDir::new(config.mailbox_dir.clone()));
        let mx: Arc<dyn MxResolver> = resolver.clone();
        let relay = Relay::new(Arc::clone(&config), mx, mailboxes);

        Ok(Self::new(Services {
            credentials: Arc::new(PemFiles::from_config(&config)),
            rdns: resolver,
            sink: Arc::new(relay),
            config,
        }))
    }

    /// Binds every configured listener and serves until one of them fails.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound or stops accepting.
    pub async fn run(self) -> Result<()> {
        let mut listeners = JoinSet::new();

        for addr in &self.services.config.listen {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "listening (plaintext, STARTTLS)");
            let server = self.clone();
            listeners.spawn(async move { server.serve(listener, false).await });
        }

        if let Some(addr) = self.services.config.tls_listen {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "listening (implicit TLS)");
            let server = self.clone();
            listeners.spawn(async move { server.serve(listener, true).await });
        }

        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => error!("listener task failed: {e}"),
            }
        }
        Ok(())
    }

    /// Accepts connections from `listener` forever. Failed accepts are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Does not return under normal operation.
    pub async fn serve(&self, listener: TcpListener, implicit_tls: bool) -> Result<()> {
        loop {
            let (tcp, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!(%remote, "connection accepted");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(tcp, remote, implicit_tls).await {
                    warn!(%remote, "session ended with error: {e}");
                }
            });
        }
    }

    async fn handle(&self, tcp: TcpStream, remote: SocketAddr, implicit_tls: bool) -> Result<()> {
        let stream = if implicit_tls {
            let acceptor = self.services.credentials.acceptor()?;
            let tls = acceptor.accept(tcp).await?;
            SmtpStream::from_tls(TlsStream::Server(tls))
        } else {
            SmtpStream::new(tcp)
        };

        Session::new(stream, remote, self.services.clone()).run().await
    }
}
