//! SMTP server state machine.
//!
//! Pure command dispatch: each received line moves the [`State`] and yields
//! an [`Outcome`] telling the session what to do on the wire. No I/O
//! happens here.

use crate::config::Config;
use crate::envelope::{DATA_TERMINATOR, Mail};
use mxrelay_smtp::{Address, AuthMechanism, Command, Extension, Reply, ReplyCode};
use thiserror::Error;

/// Protocol state of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum State {
    /// Connected, no EHLO/HELO yet.
    #[default]
    Initial,
    /// Client introduced itself; no transaction open.
    Greeted,
    /// `MAIL FROM` accepted; collecting recipients.
    SenderSet(Mail),
    /// `DATA` accepted; collecting message lines until `.`.
    ReceivingData(Mail),
}

/// Per-connection facts the state machine reads and updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peer {
    /// Name from the latest EHLO/HELO.
    pub helo: Option<String>,
    /// Latest greeting was EHLO.
    pub extended: bool,
    /// Client may relay to foreign domains.
    pub authenticated: bool,
    /// Connection is TLS-protected.
    pub encrypted: bool,
}

/// What the session must do after a line was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this reply.
    Reply(Reply),
    /// Nothing to send yet (a DATA line).
    Pending,
    /// Send 220 and run the server TLS handshake.
    StartTls,
    /// The message is complete: finish and hand off the envelope, then
    /// reply 250.
    Complete(Mail),
}

impl From<Reply> for Outcome {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

impl From<Rejection> for Outcome {
    fn from(rejection: Rejection) -> Self {
        Self::Reply(rejection.reply())
    }
}

/// A command refused without ending the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Unknown verb.
    #[error("Command unrecognized")]
    Unrecognized,
    /// Malformed argument.
    #[error("Syntax error")]
    Syntax,
    /// EHLO/HELO without a name.
    #[error("Syntax error, tell me who you are!")]
    MissingName,
    /// Verb not valid in the current state.
    #[error("Bad sequence of commands")]
    BadSequence,
    /// Reverse path is not `user@domain`.
    #[error("Invalid sender mailbox name (format should be user@domain)")]
    InvalidSender,
    /// Forward path is not `user@domain`.
    #[error("Invalid address {0}")]
    InvalidRecipient(String),
    /// Foreign recipient from an unauthenticated client.
    #[error("Authentication required for relay")]
    RelayDenied,
}

impl Rejection {
    /// Reply code for this rejection.
    #[must_use]
    pub const fn code(&self) -> ReplyCode {
        match self {
            Self::Unrecognized => ReplyCode::SYNTAX_ERROR,
            Self::Syntax | Self::MissingName => ReplyCode::PARAMETER_ERROR,
            Self::BadSequence => ReplyCode::BAD_SEQUENCE,
            Self::InvalidSender => ReplyCode::MAILBOX_NAME_INVALID,
            Self::InvalidRecipient(_) => ReplyCode::MAILBOX_UNAVAILABLE,
            Self::RelayDenied => ReplyCode::AUTH_REQUIRED,
        }
    }

    /// Reply sent to the client.
    #[must_use]
    pub fn reply(&self) -> Reply {
        Reply::single(self.code(), self.to_string())
    }
}

impl State {
    /// Handles one received line, CRLF included.
    pub fn handle(&mut self, line: &[u8], peer: &mut Peer, config: &Config) -> Outcome {
        let (next, outcome) = std::mem::take(self).step(line, peer, config);
        *self = next;
        outcome
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Greeted => "greeted",
            Self::SenderSet(_) => "sender-set",
            Self::ReceivingData(_) => "receiving-data",
        }
    }

    fn step(self, line: &[u8], peer: &mut Peer, config: &Config) -> (Self, Outcome) {
        let state = match self {
            Self::ReceivingData(mut mail) => {
                if line == DATA_TERMINATOR {
                    return (Self::Greeted, Outcome::Complete(mail));
                }
                mail.push_line(line);
                return (Self::ReceivingData(mail), Outcome::Pending);
            }
            state => state,
        };

        let cmd = Command::parse(line);
        match (cmd.verb(), state) {
            ("EHLO", state) => greet(state, &cmd, peer, true),
            ("HELO", state) => greet(state, &cmd, peer, false),

            ("MAIL", Self::Greeted) => match mail_from(&cmd) {
                Ok(from) => (
                    Self::SenderSet(Mail::new(from)),
                    Reply::single(ReplyCode::OK, "OK proceed").into(),
                ),
                Err(rejection) => (Self::Greeted, rejection.into()),
            },

            ("RCPT", Self::SenderSet(mut mail)) => match rcpt_to(&cmd, peer, config) {
                Ok(rcpt) => {
                    let reply = Reply::single(ReplyCode::OK, format!("RCPT {} OK", rcpt.bracketed()));
                    mail.add_recipient(rcpt);
                    (Self::SenderSet(mail), reply.into())
                }
                Err(rejection) => (Self::SenderSet(mail), rejection.into()),
            },

            ("DATA", Self::SenderSet(mail)) => (
                Self::ReceivingData(mail),
                Reply::single(ReplyCode::START_DATA, "Start mail input; end with <CRLF>.<CRLF>")
                    .into(),
            ),

            ("MAIL" | "RCPT" | "DATA", state) => (state, Rejection::BadSequence.into()),

            ("RSET", Self::Initial) => (Self::Initial, reset_reply()),
            ("RSET", _) => (Self::Greeted, reset_reply()),

            ("NOOP", state) => (state, Reply::single(ReplyCode::OK, "NOOP OK").into()),
            ("QUIT", state) => (state, Reply::single(ReplyCode::CLOSING, "Goodbye!").into()),
            ("VRFY", state) => (
                state,
                Reply::single(ReplyCode::CANNOT_VERIFY, "VRFY command currently disabled").into(),
            ),

            ("STARTTLS", state) if peer.encrypted => (
                state,
                Reply::single(ReplyCode::TLS_UNAVAILABLE, "TLS already in use").into(),
            ),
            ("STARTTLS", state) => (state, Outcome::StartTls),

            (_, state) => (state, Rejection::Unrecognized.into()),
        }
    }
}

fn reset_reply() -> Outcome {
    Reply::single(ReplyCode::OK, "Reset OK").into()
}

/// EHLO/HELO from any command state. Any open transaction is dropped.
fn greet(state: State, cmd: &Command, peer: &mut Peer, extended: bool) -> (State, Outcome) {
    let Some(name) = cmd.arg() else {
        return (state, Rejection::MissingName.into());
    };

    peer.helo = Some(name.to_string());
    peer.extended = extended;

    let reply = if extended {
        let feature = if peer.encrypted {
            Extension::Auth(vec![AuthMechanism::Plain])
        } else {
            Extension::StartTls
        };
        Reply::new(
            ReplyCode::OK,
            [format!("Hello there, {name}!"), feature.to_string()],
        )
    } else {
        Reply::single(ReplyCode::OK, format!("Hello there, {name}"))
    };

    (State::Greeted, reply.into())
}

/// Extracts `addr` from `<keyword>:<addr>` in argument 0.
fn path_argument<'a>(cmd: &'a Command, keyword: &str) -> Result<&'a str, Rejection> {
    let arg = cmd.arg().ok_or(Rejection::Syntax)?;
    let (key, path) = arg.split_once(':').ok_or(Rejection::Syntax)?;

    if path.contains(':') || !key.eq_ignore_ascii_case(keyword) {
        return Err(Rejection::Syntax);
    }

    path.strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .ok_or(Rejection::Syntax)
}

fn mail_from(cmd: &Command) -> Result<Address, Rejection> {
    let path = path_argument(cmd, "FROM")?;
    Address::new(path).map_err(|_| Rejection::InvalidSender)
}

fn rcpt_to(cmd: &Command, peer: &Peer, config: &Config) -> Result<Address, Rejection> {
    let path = path_argument(cmd, "TO")?;
    let rcpt = Address::new(path).map_err(|_| Rejection::InvalidRecipient(path.to_string()))?;

    if !peer.authenticated && !config.is_local(rcpt.domain()) {
        return Err(Rejection::RelayDenied);
    }

    Ok(rcpt)
}
