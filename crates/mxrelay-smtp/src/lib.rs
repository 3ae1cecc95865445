//! # mxrelay-smtp
//!
//! SMTP wire layer for the mxrelay transfer agent (RFC 5321).
//!
//! ## Features
//!
//! - **Line framing**: CRLF-delimited reads with a hard line bound, over
//!   plaintext or TLS, with in-place STARTTLS upgrade for either side
//! - **Replies**: multi-line serialization and parsing
//! - **Relay client**: type-state conversation with a remote exchanger,
//!   EHLO with HELO fallback, opportunistic STARTTLS
//!
//! ## Quick Start
//!
//! ```ignore
//! use mxrelay_smtp::{Address, Client};
//! use mxrelay_smtp::connection::{connect, default_connector};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> mxrelay_smtp::Result<()> {
//!     let stream = connect("mx.example.com", 25, Duration::from_secs(300)).await?;
//!     let client = Client::from_stream(stream).await?;
//!     let mut client = client.hello("relay.example.org").await?;
//!     if client.offers_starttls() {
//!         client = client
//!             .starttls(&default_connector(), "mx.example.com", "relay.example.org")
//!             .await?;
//!     }
//!
//!     let from = Address::new("sender@example.org")?;
//!     let to = Address::new("recipient@example.com")?;
//!     client.send_mail(&from, &to, b"", b"Subject: Test\r\n\r\nHello\r\n").await?;
//!
//!     client.quit().await
//! }
//! ```
//!
//! ## Connection States
//!
//! ```text
//! ┌──────────────┐             ┌─────────┐
//! │  Connected   │ ── hello ──→ │  Ready  │ ── starttls / send_mail ──┐
//! └──────────────┘             └─────────┘ ←─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`command`]: SMTP command lines
//! - [`connection`]: Line-framed stream and relay client
//! - [`parser`]: Reply parser
//! - [`types`]: Core SMTP types (addresses, extensions, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod types;

pub use command::Command;
pub use connection::{Client, Connected, Ready, SmtpStream, TlsInfo};
pub use error::{Error, Result};
pub use types::{Address, AuthMechanism, Extension, Reply, ReplyCode};
