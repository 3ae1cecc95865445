//! # mxrelay-core
//!
//! Mail transfer agent logic for `mxrelay`.
//!
//! This crate provides:
//! - Configuration loading
//! - The inbound SMTP session state machine, with STARTTLS
//! - Envelopes and Received trace lines
//! - Local mailbox delivery
//! - Outbound relay to MX hosts with per-recipient failure reporting
//! - Listeners for plaintext and implicit TLS

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod dns;
pub mod envelope;
mod error;
pub mod mailbox;
pub mod relay;
pub mod server;
pub mod session;
pub mod tls;

pub use config::Config;
pub use dns::{MxResolver, NoReverseDns, ReverseDns, SystemResolver};
pub use envelope::{Envelope, Mail, Origin, Protocol, ReceivedTrace};
pub use error::{DeliveryError, DeliveryErrors, Error, Result};
pub use mailbox::{LocalDelivery, MailboxDir};
pub use relay::{MailSink, Relay};
pub use server::Server;
pub use session::{Outcome, Peer, Rejection, Services, Session, State};
pub use tls::{CredentialProvider, PemFiles, StaticAcceptor};
