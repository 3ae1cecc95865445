//! Mail envelopes and Received trace lines.
//!
//! A [`Mail`] is built up by the session between `MAIL FROM` and the end
//! of `DATA`. Finishing it computes the content id and freezes it into an
//! [`Envelope`], which is then owned by the delivery path alone.

use chrono::{DateTime, Local};
use mxrelay_smtp::{Address, TlsInfo};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Envelope under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    from: Address,
    recipients: Vec<Address>,
    data: Vec<u8>,
}

impl Mail {
    /// Starts an envelope for `from` with no recipients and no data.
    #[must_use]
    pub const fn new(from: Address) -> Self {
        Self {
            from,
            recipients: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Reverse path.
    #[must_use]
    pub const fn sender(&self) -> &Address {
        &self.from
    }

    /// Forward paths in the order they were accepted.
    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Adds a recipient.
    pub fn add_recipient(&mut self, recipient: Address) {
        self.recipients.push(recipient);
    }

    /// Appends one received DATA line, CRLF included, as-is.
    pub fn push_line(&mut self, line: &[u8]) {
        self.data.extend_from_slice(line);
    }

    /// Message data accumulated so far.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Freezes the envelope, deriving its id and trace from `origin`.
    #[must_use]
    pub fn finish(self, origin: &Origin) -> Envelope {
        self.finish_at(origin, Local::now())
    }

    /// Like [`Mail::finish`] with an explicit timestamp.
    #[must_use]
    pub fn finish_at(self, origin: &Origin, at: DateTime<Local>) -> Envelope {
        let id = content_id(&self.data);
        let received = ReceivedTrace::new(origin, &id, at);
        Envelope {
            from: self.from,
            recipients: self.recipients,
            data: self.data,
            id,
            received,
        }
    }
}

/// The line that ends DATA.
pub(crate) const DATA_TERMINATOR: &[u8] = b".\r\n";

/// Lower-case hex SHA-256 of the message data as received, terminating
/// `.` line included.
#[must_use]
pub fn content_id(data: &[u8]) -> String {
    let digest = Sha256::new()
        .chain_update(data)
        .chain_update(DATA_TERMINATOR)
        .finalize();
    digest.iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

/// Protocol label of the Received `with` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Client used HELO.
    Smtp,
    /// Client used EHLO.
    Esmtp,
    /// Client used EHLO over TLS.
    Esmtps,
}

impl Protocol {
    /// Picks the label from the greeting kind and transport.
    #[must_use]
    pub const fn new(extended: bool, encrypted: bool) -> Self {
        match (extended, encrypted) {
            (false, _) => Self::Smtp,
            (true, false) => Self::Esmtp,
            (true, true) => Self::Esmtps,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Smtp => "SMTP",
            Self::Esmtp => "ESMTP",
            Self::Esmtps => "ESMTPS",
        })
    }
}

/// Where a message came from, captured when DATA completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Name the client gave in EHLO/HELO.
    pub helo: String,
    /// Reverse DNS of the client address, if any.
    pub rdns: Option<String>,
    /// Client address.
    pub ip: IpAddr,
    /// Protocol label.
    pub protocol: Protocol,
    /// Negotiated TLS parameters when encrypted.
    pub tls: Option<TlsInfo>,
    /// Our own name.
    pub by: String,
}

/// Received header fields shared by every recipient of one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedTrace {
    from: String,
    by: String,
    tls: Option<String>,
    id: String,
    timestamp: String,
}

impl ReceivedTrace {
    fn new(origin: &Origin, id: &str, at: DateTime<Local>) -> Self {
        Self {
            from: format!(
                "from {} ({} [{}])",
                origin.helo,
                origin.rdns.as_deref().unwrap_or_default(),
                origin.ip
            ),
            by: format!("by {} with {}", origin.by, origin.protocol),
            tls: origin.tls.as_ref().map(ToString::to_string),
            id: format!("id {id}"),
            timestamp: at.to_rfc2822(),
        }
    }

    /// Renders the full header for one recipient, folded, CRLF-terminated.
    #[must_use]
    pub fn render(&self, recipient: &Address) -> String {
        let mut header = format!("Received: {}\r\n\t{}\r\n", self.from, self.by);
        if let Some(tls) = &self.tls {
            header.push('\t');
            header.push_str(tls);
            header.push_str("\r\n");
        }
        let _ = write!(
            header,
            "\t{}\r\n\tfor {};\r\n\t{}\r\n",
            self.id,
            recipient.bracketed(),
            self.timestamp
        );
        header
    }
}

/// Completed envelope, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    from: Address,
    recipients: Vec<Address>,
    data: Vec<u8>,
    id: String,
    received: ReceivedTrace,
}

impl Envelope {
    /// Reverse path.
    #[must_use]
    pub const fn sender(&self) -> &Address {
        &self.from
    }

    /// All recipients in acceptance order.
    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Message data in wire form (dot-stuffed, without the terminator).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Hex SHA-256 of [`Envelope::data`].
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shared trace fields.
    #[must_use]
    pub const fn received(&self) -> &ReceivedTrace {
        &self.received
    }

    /// Received header for one recipient.
    #[must_use]
    pub fn received_for(&self, recipient: &Address) -> String {
        self.received.render(recipient)
    }

    /// Recipients grouped by domain, domains in first-seen order and
    /// recipients in acceptance order within each group.
    #[must_use]
    pub fn by_domain(&self) -> Vec<(String, Vec<Address>)> {
        let mut groups: Vec<(String, Vec<Address>)> = Vec::new();
        for rcpt in &self.recipients {
            match groups.iter_mut().find(|(domain, _)| domain == rcpt.domain()) {
                Some((_, members)) => members.push(rcpt.clone()),
                None => groups.push((rcpt.domain().to_string(), vec![rcpt.clone()])),
            }
        }
        groups
    }

    /// Message data with dot-stuffing removed, as stored in a mailbox.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.data.len());
        for line in self.data.split_inclusive(|&b| b == b'\n') {
            body.extend_from_slice(line.strip_prefix(b".").unwrap_or(line));
        }
        body
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn origin(tls: Option<TlsInfo>) -> Origin {
        Origin {
            helo: "client.test".to_string(),
            rdns: Some("host.client.test".to_string()),
            ip: "192.0.2.7".parse().unwrap(),
            protocol: Protocol::new(true, tls.is_some()),
            tls,
            by: "mx.example.com".to_string(),
        }
    }

    fn sample() -> Mail {
        let mut mail = Mail::new(addr("a@x.com"));
        mail.add_recipient(addr("b@y.com"));
        mail.add_recipient(addr("c@z.com"));
        mail.add_recipient(addr("d@Y.com"));
        mail.push_line(b"Subject: hi\r\n");
        mail.push_line(b"\r\n");
        mail.push_line(b"..leading dot\r\n");
        mail
    }

    #[test]
    fn test_id_is_sha256_of_data() {
        let envelope = sample().finish(&origin(None));
        assert_eq!(envelope.id().len(), 64);
        assert!(envelope.id().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(envelope.id(), content_id(envelope.data()));
    }

    #[test]
    fn test_content_id_covers_terminator() {
        assert_eq!(
            content_id(b""),
            "c0a317f60910eed08bbfc7b3ac6e6de1b2029bf4922d0b0d7d3759313a24b16c"
        );
        assert_eq!(
            content_id(b"hi\r\n"),
            "04361101c3c8b2a8c195e36c35caa74d490df0dc160b7f1e5b644c37ff309c4e"
        );
    }

    #[test]
    fn test_finished_id_matches_known_digest() {
        let mut mail = Mail::new(addr("a@x.com"));
        mail.push_line(b"hi\r\n");
        let envelope = mail.finish(&origin(None));
        assert_eq!(
            envelope.id(),
            "04361101c3c8b2a8c195e36c35caa74d490df0dc160b7f1e5b644c37ff309c4e"
        );
        assert_eq!(envelope.data(), b"hi\r\n");
    }

    #[test]
    fn test_group_by_domain_first_seen_order() {
        let envelope = sample().finish(&origin(None));
        let groups = envelope.by_domain();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "y.com");
        assert_eq!(groups[0].1, vec![addr("b@y.com"), addr("d@y.com")]);
        assert_eq!(groups[1].0, "z.com");
    }

    #[test]
    fn test_body_removes_dot_stuffing() {
        let envelope = sample().finish(&origin(None));
        assert_eq!(envelope.body(), b"Subject: hi\r\n\r\n.leading dot\r\n");
    }

    #[test]
    fn test_received_plaintext() {
        let at = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let envelope = sample().finish_at(&origin(None), at);
        let header = envelope.received_for(&addr("b@y.com"));

        let expected = format!(
            "Received: from client.test (host.client.test [192.0.2.7])\r\n\
             \tby mx.example.com with ESMTP\r\n\
             \tid {}\r\n\
             \tfor <b@y.com>;\r\n\
             \t{}\r\n",
            envelope.id(),
            at.to_rfc2822()
        );
        assert_eq!(header, expected);
    }

    #[test]
    fn test_received_tls() {
        let tls = TlsInfo {
            version: "TLSv1_3".to_string(),
            cipher: "TLS13_AES_256_GCM_SHA384".to_string(),
        };
        let envelope = sample().finish(&origin(Some(tls)));
        let header = envelope.received_for(&addr("c@z.com"));

        assert!(header.contains("\tby mx.example.com with ESMTPS\r\n"));
        assert!(header.contains("\t(version=TLSv1_3 cipher=TLS13_AES_256_GCM_SHA384)\r\n"));
        assert!(header.contains("\tfor <c@z.com>;\r\n"));
    }

    #[test]
    fn test_protocol_labels() {
        assert_eq!(Protocol::new(false, true).to_string(), "SMTP");
        assert_eq!(Protocol::new(true, false).to_string(), "ESMTP");
        assert_eq!(Protocol::new(true, true).to_string(), "ESMTPS");
    }

    #[test]
    fn test_missing_rdns_renders_empty() {
        let mut origin = origin(None);
        origin.rdns = None;
        let header = sample().finish(&origin).received_for(&addr("b@y.com"));
        assert!(header.starts_with("Received: from client.test ( [192.0.2.7])\r\n"));
    }
}
