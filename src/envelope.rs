//! The `Envelope`: the addressing and body of one in-flight message.
//!
//! An `Envelope` is created at the first `MAIL FROM` after greeting or
//! `RSET` and destroyed when the message is accepted or rejected by the
//! backend. A `ClientSession` may create
//! many envelopes sequentially over its lifetime; nothing here is reused
//! across messages — `ClientSession::reset_envelope` always installs a
//! fresh, empty one.

use std::collections::HashMap;

use crate::address::EmailAddress;

/// Maximum recipients per envelope.
pub const MAX_RCPT_TO: usize = 100;

/// One in-flight SMTP message.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub remote_ip: String,
    pub helo: String,
    pub mail_from: Option<EmailAddress>,
    rcpt_to: Vec<EmailAddress>,
    seen_recipients: std::collections::HashSet<String>,
    pub data: Vec<u8>,
    pub tls: bool,
    pub subject: String,
    pub header: HashMap<String, String>,
}

impl Envelope {
    pub fn new(remote_ip: String, helo: String, tls: bool) -> Self {
        Envelope {
            remote_ip,
            helo,
            tls,
            ..Default::default()
        }
    }

    /// Sets the sender. At most one `MailFrom` per envelope —
    /// callers must reset the envelope (via a fresh `MAIL FROM`) rather
    /// than calling this twice on the same envelope.
    pub fn set_mail_from(&mut self, addr: Option<EmailAddress>) {
        self.mail_from = addr;
    }

    /// Appends a recipient, deduplicating case-insensitively on
    /// `local@domain`. Returns `false` (no-op) if the recipient is already
    /// present, or if the 100-recipient cap is reached.
    pub fn add_rcpt_to(&mut self, addr: EmailAddress) -> Result<bool, TooManyRecipients> {
        let key = addr.dedup_key();
        if self.seen_recipients.contains(&key) {
            return Ok(false);
        }
        if self.rcpt_to.len() >= MAX_RCPT_TO {
            return Err(TooManyRecipients);
        }
        self.seen_recipients.insert(key);
        self.rcpt_to.push(addr);
        Ok(true)
    }

    pub fn rcpt_to(&self) -> &[EmailAddress] {
        &self.rcpt_to
    }

    pub fn has_accepted_rcpt(&self) -> bool {
        !self.rcpt_to.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyRecipients;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Domain;

    fn addr(local: &str, domain: &str) -> EmailAddress {
        EmailAddress {
            local_part: local.to_string(),
            domain: Some(Domain::Name(domain.to_string())),
        }
    }

    #[test]
    fn dedups_recipients_case_insensitively() {
        let mut env = Envelope::new("127.0.0.1".into(), "client".into(), false);
        assert!(env.add_rcpt_to(addr("Bob", "Example.com")).unwrap());
        assert!(!env.add_rcpt_to(addr("bob", "example.com")).unwrap());
        assert_eq!(env.rcpt_to().len(), 1);
    }

    #[test]
    fn caps_recipients_at_100() {
        let mut env = Envelope::new("127.0.0.1".into(), "client".into(), false);
        for i in 0..MAX_RCPT_TO {
            assert!(env.add_rcpt_to(addr(&format!("u{i}"), "example.com")).unwrap());
        }
        assert!(env.add_rcpt_to(addr("overflow", "example.com")).is_err());
    }
}
