//! SMTP reply parser.

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Parses a complete SMTP reply from its wire bytes.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// # Errors
///
/// Returns an error if the first three bytes are not ASCII digits or a
/// line is too short to carry a code.
pub fn parse_reply(bytes: &[u8]) -> Result<Reply> {
    let text = String::from_utf8_lossy(bytes);
    let body = text.strip_suffix("\r\n").unwrap_or(&text);
    let lines: Vec<String> = body.split("\r\n").map(str::to_string).collect();
    parse_reply_lines(&lines)
}

/// Parses an SMTP reply from lines with their CRLF already removed.
///
/// # Errors
///
/// Returns an error if the reply is malformed.
pub fn parse_reply_lines(lines: &[String]) -> Result<Reply> {
    let Some(first) = lines.first() else {
        return Err(Error::Protocol("Empty reply".into()));
    };

    let code = parse_code(first)?;

    let mut message = Vec::with_capacity(lines.len());
    for line in lines {
        match line.len() {
            // Just code, no separator or text
            3 => message.push(String::new()),
            // Skip code and separator (e.g., "250-" or "250 ")
            n if n >= 4 && line.is_char_boundary(4) => message.push(line[4..].to_string()),
            _ => return Err(Error::Protocol(format!("Malformed reply line: {line}"))),
        }
    }

    Ok(Reply::new(code, message))
}

fn parse_code(line: &str) -> Result<ReplyCode> {
    let digits = line.as_bytes().get(..3).unwrap_or_default();
    if digits.len() != 3 || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::Protocol(format!("Invalid reply code: {line}")));
    }

    let code = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    Ok(ReplyCode::new(code))
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` for the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.len() >= 4 && line.as_bytes()[3] == b' '
}
