//! Outbound delivery.
//!
//! A finished [`Envelope`] is split by recipient domain. Local recipients
//! go to the mailbox sink; every other domain gets one SMTP connection to
//! the first of its exchangers that completes the handshake, and one
//! transaction per recipient on that connection.

use crate::config::Config;
use crate::dns::MxResolver;
use crate::envelope::Envelope;
use crate::error::{DeliveryError, DeliveryErrors};
use crate::mailbox::LocalDelivery;
use mxrelay_smtp::connection::{connect, default_connector};
use mxrelay_smtp::{Address, Client, Ready};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Receives envelopes once DATA completes.
///
/// Must return without waiting for delivery; the session replies 250 as
/// soon as this call returns.
pub trait MailSink: Send + Sync {
    /// Takes ownership of a finished envelope.
    fn submit(&self, envelope: Envelope);
}

impl MailSink for mpsc::UnboundedSender<Envelope> {
    fn submit(&self, envelope: Envelope) {
        if self.send(envelope).is_err() {
            warn!("mail sink closed, envelope dropped");
        }
    }
}

/// Delivers envelopes locally or to remote exchangers.
#[derive(Clone)]
pub struct Relay {
    config: Arc<Config>,
    resolver: Arc<dyn MxResolver>,
    local: Arc<dyn LocalDelivery>,
    connector: TlsConnector,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("domain", &self.config.domain)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Creates a relay.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn MxResolver>,
        local: Arc<dyn LocalDelivery>,
    ) -> Self {
        Self {
            config,
            resolver,
            local,
            connector: default_connector(),
        }
    }

    /// Attempts every recipient once.
    ///
    /// Domains are processed in first-seen order; a failing domain does not
    /// stop the others.
    ///
    /// # Errors
    ///
    /// Returns every failure collected along the way.
    pub async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryErrors> {
        let mut errors = DeliveryErrors::new();

        if envelope.recipients().is_empty() {
            warn!(id = envelope.id(), "envelope has no recipients, dropping");
            return Ok(());
        }

        for (domain, recipients) in envelope.by_domain() {
            if self.config.is_local(&domain) {
                self.deliver_local(envelope, &recipients, &mut errors).await;
            } else {
                self.deliver_remote(envelope, &domain, &recipients, &mut errors)
                    .await;
            }
        }

        errors.into_result()
    }

    async fn deliver_local(
        &self,
        envelope: &Envelope,
        recipients: &[Address],
        errors: &mut DeliveryErrors,
    ) {
        for recipient in recipients {
            if let Err(source) = self.local.deliver(envelope, recipient).await {
                warn!(recipient = %recipient, "local delivery failed: {source}");
                errors.push(DeliveryError::Local {
                    recipient: recipient.clone(),
                    source,
                });
            }
        }
    }

    async fn deliver_remote(
        &self,
        envelope: &Envelope,
        domain: &str,
        recipients: &[Address],
        errors: &mut DeliveryErrors,
    ) {
        let (host, mut client) = match self.open(domain).await {
            Ok(open) => open,
            Err(reason) => {
                warn!(domain, "giving up on domain: {reason}");
                errors.push(DeliveryError::Unreachable {
                    domain: domain.to_string(),
                    reason,
                });
                return;
            }
        };

        for recipient in recipients {
            let trace = envelope.received_for(recipient);
            match client
                .send_mail(envelope.sender(), recipient, trace.as_bytes(), envelope.data())
                .await
            {
                Ok(_) => info!(id = envelope.id(), recipient = %recipient, host = %host, "relayed"),
                Err(source @ mxrelay_smtp::Error::SmtpError { .. }) => {
                    warn!(recipient = %recipient, host = %host, "rejected: {source}");
                    errors.push(DeliveryError::Rejected {
                        recipient: recipient.clone(),
                        host: host.clone(),
                        source,
                    });
                }
                Err(source) => {
                    warn!(domain, host = %host, "connection lost: {source}");
                    errors.push(DeliveryError::ConnectionLost {
                        domain: domain.to_string(),
                        host,
                        source,
                    });
                    return;
                }
            }
        }

        if let Err(e) = client.quit().await {
            debug!(host = %host, "QUIT failed: {e}");
        }
    }

    /// Connects to the first exchanger of `domain` that completes greeting,
    /// EHLO and, when offered, STARTTLS.
    async fn open(&self, domain: &str) -> Result<(String, Client<TcpStream, Ready>), String> {
        let hosts = self
            .resolver
            .mail_exchangers(domain)
            .await
            .map_err(|e| e.to_string())?;

        let mut last_error = format!("no mail exchangers for {domain}");
        for host in hosts {
            match self.handshake(&host).await {
                Ok(client) => return Ok((host, client)),
                Err(e) => {
                    warn!(domain, host = %host, "exchanger failed: {e}");
                    last_error = format!("{host}: {e}");
                }
            }
        }

        Err(last_error)
    }

    async fn handshake(&self, host: &str) -> mxrelay_smtp::Result<Client<TcpStream, Ready>> {
        debug!(host, port = self.config.relay_port, "connecting");
        let stream = connect(host, self.config.relay_port, self.config.connect_timeout()).await?;
        let client = Client::from_stream(stream).await?;
        let client = client.hello(&self.config.mx_domain).await?;

        if client.offers_starttls() {
            return client
                .starttls(&self.connector, host, &self.config.mx_domain)
                .await;
        }

        debug!(host, "STARTTLS not offered, continuing in plaintext");
        Ok(client)
    }
}

impl MailSink for Relay {
    fn submit(&self, envelope: Envelope) {
        let relay = self.clone();
        tokio::spawn(async move {
            match relay.deliver(&envelope).await {
                Ok(()) => info!(id = envelope.id(), "delivery complete"),
                Err(errors) => warn!(id = envelope.id(), "{errors}"),
            }
        });
    }
}
