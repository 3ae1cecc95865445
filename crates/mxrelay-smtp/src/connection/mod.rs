//! SMTP connection handling: the line-framed stream shared by both sides
//! and the type-state relay client.

mod client;
mod stream;

pub use client::{Client, Connected, Ready};
pub use stream::{MAX_LINE_LENGTH, SmtpStream, TlsInfo, connect, default_connector};
