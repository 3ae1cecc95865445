//! Email address types.

use crate::error::{Error, Result};

/// Mailbox address used in the SMTP envelope.
///
/// The domain is case-folded so addresses can be grouped by destination.
/// The local part is kept verbatim: whether it is case sensitive is up to
/// the receiving server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    user: String,
    domain: String,
}

impl Address {
    /// Parses a `user@domain` mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error unless the input holds exactly one `@` with a
    /// non-empty part on each side.
    pub fn new(addr: impl AsRef<str>) -> Result<Self> {
        let addr = addr.as_ref();
        let mut parts = addr.split('@');

        let (Some(user), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidAddress(format!(
                "{addr} must have exactly one @"
            )));
        };

        if user.is_empty() || domain.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "{addr}: local and domain parts cannot be empty"
            )));
        }

        Ok(Self {
            user: user.to_string(),
            domain: domain.to_lowercase(),
        })
    }

    /// Returns the local part.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the lower-cased domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns the address in angle brackets, as used in `MAIL FROM`,
    /// `RCPT TO` and trace headers.
    #[must_use]
    pub fn bracketed(&self) -> String {
        format!("<{self}>")
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
