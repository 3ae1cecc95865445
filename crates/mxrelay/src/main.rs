//! `mxrelay` - SMTP mail transfer agent
//!
//! Accepts mail on 25/587 (STARTTLS) and 465 (implicit TLS), stores mail
//! for the local domain and relays everything else to the recipient's
//! MX hosts.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use anyhow::Context;
use mxrelay_core::{Config, Server};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mxrelay=debug,mxrelay_core=debug,mxrelay_smtp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    info!(
        domain = %config.domain,
        mx_domain = %config.mx_domain,
        "Starting mxrelay"
    );

    let server = Server::from_config(Arc::new(config)).context("failed to set up server")?;

    tokio::select! {
        result = server.run() => result.context("server stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
