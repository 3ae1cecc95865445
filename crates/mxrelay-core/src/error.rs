//! Error types for the core library.

use mxrelay_smtp::Address;
use std::fmt;
use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// SMTP wire operation failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] mxrelay_smtp::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// DNS resolution failed.
    #[error("DNS error: {0}")]
    Dns(#[from] hickory_resolver::ResolveError),

    /// DNS lookup did not answer in time.
    #[error("DNS lookup timed out: {0}")]
    DnsTimeout(String),

    /// Configuration file could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Default configuration could not be written.
    #[error("Configuration write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A single delivery failure.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No mail exchanger for the domain could be reached.
    #[error("{domain}: no reachable mail exchanger: {reason}")]
    Unreachable {
        /// Destination domain.
        domain: String,
        /// Last failure seen while trying hosts.
        reason: String,
    },

    /// The remote exchanger refused one recipient.
    #[error("<{recipient}>: rejected by {host}: {source}")]
    Rejected {
        /// Affected recipient.
        recipient: Address,
        /// Exchanger that refused the message.
        host: String,
        /// Reply received.
        source: mxrelay_smtp::Error,
    },

    /// The connection broke mid-transaction; remaining recipients of the
    /// domain were not attempted.
    #[error("{domain}: connection to {host} lost: {source}")]
    ConnectionLost {
        /// Destination domain.
        domain: String,
        /// Exchanger we were talking to.
        host: String,
        /// Transport failure.
        source: mxrelay_smtp::Error,
    },

    /// Writing to a local mailbox failed.
    #[error("<{recipient}>: local delivery failed: {source}")]
    Local {
        /// Local recipient.
        recipient: Address,
        /// Filesystem failure.
        source: std::io::Error,
    },
}

/// Every failure of one delivery run, in the order they occurred.
///
/// An empty aggregate means every recipient was delivered.
#[derive(Debug, Default)]
pub struct DeliveryErrors {
    errors: Vec<DeliveryError>,
}

impl DeliveryErrors {
    /// Creates an empty aggregate.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Records a failure.
    pub fn push(&mut self, error: DeliveryError) {
        self.errors.push(error);
    }

    /// Returns true if nothing failed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.errors.len()
    }

    /// Iterates over the recorded failures.
    pub fn iter(&self) -> std::slice::Iter<'_, DeliveryError> {
        self.errors.iter()
    }

    /// `Ok(())` when empty, the aggregate otherwise.
    ///
    /// # Errors
    ///
    /// Returns `self` if at least one failure was recorded.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for DeliveryErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery failed for {} target(s):", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n\t{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DeliveryErrors {}

impl<'a> IntoIterator for &'a DeliveryErrors {
    type Item = &'a DeliveryError;
    type IntoIter = std::slice::Iter<'a, DeliveryError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_aggregate_is_success() {
        assert!(DeliveryErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_aggregate_display_lists_each_failure() {
        let mut errors = DeliveryErrors::new();
        errors.push(DeliveryError::Unreachable {
            domain: "down.test".to_string(),
            reason: "connection refused".to_string(),
        });
        errors.push(DeliveryError::Rejected {
            recipient: Address::new("nobody@up.test").unwrap(),
            host: "mx.up.test".to_string(),
            source: mxrelay_smtp::Error::smtp_error(550, "no such user"),
        });

        let text = errors.to_string();
        assert_eq!(errors.len(), 2);
        assert!(text.starts_with("delivery failed for 2 target(s):"));
        assert!(text.contains("\n\tdown.test: no reachable mail exchanger: connection refused"));
        assert!(text.contains("<nobody@up.test>: rejected by mx.up.test"));
    }
}
