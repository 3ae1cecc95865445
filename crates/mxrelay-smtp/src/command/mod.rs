//! SMTP command lines.
//!
//! A [`Command`] is a verb plus positional arguments. The server side
//! parses them from received lines without validating the arguments; each
//! session state decides what a well-formed argument looks like. The client
//! side builds them with the constructors below.

use crate::types::Address;

/// SMTP command: upper-cased verb and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    args: Vec<String>,
}

impl Command {
    /// Creates a command from a verb and arguments.
    #[must_use]
    pub fn new<I, S>(verb: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verb: verb.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a received command line.
    ///
    /// Trailing whitespace and CRLF are dropped, the first token is
    /// upper-cased and the remaining tokens are kept verbatim. Argument 0
    /// therefore carries compound forms like `FROM:<addr>`.
    #[must_use]
    pub fn parse(line: &[u8]) -> Self {
        let line = String::from_utf8_lossy(line);
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default().to_uppercase();
        Self::new(verb, tokens)
    }

    /// HELO - Simple greeting
    #[must_use]
    pub fn helo(hostname: &str) -> Self {
        Self::new("HELO", [hostname])
    }

    /// EHLO - Extended greeting
    #[must_use]
    pub fn ehlo(hostname: &str) -> Self {
        Self::new("EHLO", [hostname])
    }

    /// STARTTLS - Upgrade to TLS
    #[must_use]
    pub fn starttls() -> Self {
        Self::new("STARTTLS", Vec::<String>::new())
    }

    /// MAIL FROM - Start mail transaction
    #[must_use]
    pub fn mail_from(from: &Address) -> Self {
        Self::new("MAIL", [format!("FROM:{}", from.bracketed())])
    }

    /// RCPT TO - Add recipient
    #[must_use]
    pub fn rcpt_to(to: &Address) -> Self {
        Self::new("RCPT", [format!("TO:{}", to.bracketed())])
    }

    /// DATA - Begin message data
    #[must_use]
    pub fn data() -> Self {
        Self::new("DATA", Vec::<String>::new())
    }

    /// RSET - Reset transaction
    #[must_use]
    pub fn rset() -> Self {
        Self::new("RSET", Vec::<String>::new())
    }

    /// QUIT - Close connection
    #[must_use]
    pub fn quit() -> Self {
        Self::new("QUIT", Vec::<String>::new())
    }

    /// Returns the verb.
    #[must_use]
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Returns the arguments following the verb.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the first argument, if any.
    #[must_use]
    pub fn arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Serializes the command to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.to_string().into_bytes();
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
