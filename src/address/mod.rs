//! RFC 5321 address-grammar parsing for HELO/EHLO, MAIL FROM, RCPT TO and
//! their ESMTP parameters.
//!
//! This is a free-function parser rather than a struct with methods: each
//! production (`reverse-path`, `forward-path`, `Domain`, `esmtp-param`) maps
//! to one function returning `Result<_, AddressError>`, so the caller
//! (`protocol`) can translate a specific failed production into the exact
//! SMTP reply (`AddressError::to_reply`).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::AddressError;

const MAX_LOCAL_PART: usize = 64;
const MAX_PATH: usize = 256;
const MAX_DOMAIN: usize = 255;

/// A domain name or an RFC 5321 address literal (`[IPv4]` / `[IPv6:...]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Name(n) => write!(f, "{n}"),
            Domain::V4(ip) => write!(f, "[{ip}]"),
            // Ipv6Addr's Display follows RFC 5952 (lowercase, shortest form).
            Domain::V6(ip) => write!(f, "[IPv6:{ip}]"),
        }
    }
}

/// A parsed `local-part@domain` mailbox, or the bare `Postmaster` reserved
/// mailbox (RFC 5321 §4.1.1.3), which carries no domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub local_part: String,
    pub domain: Option<Domain>,
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(d) => write!(f, "{}@{}", self.local_part, d),
            None => write!(f, "{}", self.local_part),
        }
    }
}

impl EmailAddress {
    /// Lower-cased `local@domain` key used for case-insensitive RcptTo dedup.
    pub fn dedup_key(&self) -> String {
        self.to_string().to_lowercase()
    }

    /// The domain as a lower-cased string, or `""` for the bare Postmaster
    /// mailbox. Used by `IsHostAllowed`.
    pub fn domain_str(&self) -> String {
        match &self.domain {
            Some(d) => d.to_string().to_lowercase(),
            None => String::new(),
        }
    }
}

/// One `keyword[=value]` ESMTP parameter tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParam {
    pub keyword: String,
    pub value: Option<String>,
}

/// Validates a HELO/EHLO argument: a domain name or an address literal.
/// Used only for the length/shape check; HELO/EHLO domains are not
/// resolved or otherwise validated beyond the grammar.
pub fn parse_helo_domain(arg: &str) -> Result<Domain, AddressError> {
    parse_domain(arg.trim())
}

/// Parses a `MAIL FROM:<reverse-path>[ SP esmtp-params]` argument (the text
/// following the `MAIL FROM:` keyword). Returns `None` sender for the
/// null-path `<>` (bounce messages).
pub fn parse_reverse_path(
    arg: &str,
) -> Result<(Option<EmailAddress>, Vec<EsmtpParam>), AddressError> {
    let (path, params_str) = split_path_and_params(arg)?;
    if path.is_empty() {
        return Ok((None, parse_esmtp_params(params_str)?));
    }
    let addr = parse_path(&path)?;
    Ok((Some(addr), parse_esmtp_params(params_str)?))
}

/// Parses a `RCPT TO:<forward-path>[ SP esmtp-params]` argument. Recognizes
/// the bare `Postmaster` mailbox as valid with no domain.
pub fn parse_forward_path(arg: &str) -> Result<(EmailAddress, Vec<EsmtpParam>), AddressError> {
    let (path, params_str) = split_path_and_params(arg)?;
    if path.is_empty() {
        return Err(AddressError::MalformedPath);
    }
    if path.eq_ignore_ascii_case("postmaster") {
        return Ok((
            EmailAddress {
                local_part: path,
                domain: None,
            },
            parse_esmtp_params(params_str)?,
        ));
    }
    let addr = parse_path(&path)?;
    Ok((addr, parse_esmtp_params(params_str)?))
}

/// Splits `<path> [esmtp-params]` into the bracket contents and the
/// remaining parameter string. The overall argument (path, bracket-exclusive
/// of the surrounding `<>`) is length-checked against the 256 octet path
/// limit here, since that limit spans the whole reverse-/forward-path.
fn split_path_and_params(arg: &str) -> Result<(String, &str), AddressError> {
    let arg = arg.trim_start();
    let start = arg.find('<').ok_or(AddressError::MalformedPath)?;
    let end = find_matching_close(arg, start).ok_or(AddressError::MalformedPath)?;
    let inner = &arg[start + 1..end];
    if inner.len() > MAX_PATH {
        return Err(AddressError::PathTooLong);
    }
    let rest = arg[end + 1..].trim_start();
    Ok((inner.to_string(), rest))
}

/// Finds the `>` matching the `<` at `start`, respecting quoted local parts
/// so a `>` inside a quoted string does not terminate the path early.
fn find_matching_close(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = start + 1;
    let mut in_quotes = false;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'\\' if in_quotes => i += 1, // skip the escaped character
            b'>' if !in_quotes => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Parses a (source-route-stripped) mailbox: `[@a,@b:]local-part@domain`.
/// Source routes (RFC 5321 §4.1.1.1 A-D-L) are accepted and discarded.
fn parse_path(path: &str) -> Result<EmailAddress, AddressError> {
    let mailbox = match path.find(':') {
        // Only treat a leading '@' as a source route; a quoted local part
        // or an '@' inside quotes must not be mistaken for one.
        Some(colon) if path.starts_with('@') && !path[..colon].contains('"') => {
            &path[colon + 1..]
        }
        _ => path,
    };

    let (local_part, domain_str) = split_mailbox(mailbox)?;

    if local_part.len() > MAX_LOCAL_PART {
        return Err(AddressError::LocalPartTooLong);
    }
    let domain = parse_domain(domain_str)?;
    Ok(EmailAddress {
        local_part,
        domain: Some(domain),
    })
}

/// Splits `local-part@domain`, honoring a quoted local part that may itself
/// contain `@`.
fn split_mailbox(mailbox: &str) -> Result<(String, &str), AddressError> {
    if let Some(rest) = mailbox.strip_prefix('"') {
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 1,
                b'"' => break,
                _ => {}
            }
            i += 1;
        }
        if i >= bytes.len() {
            return Err(AddressError::MalformedPath);
        }
        let local = format!("\"{}\"", &rest[..i]);
        let after = &rest[i + 1..];
        let after = after.strip_prefix('@').ok_or(AddressError::MalformedPath)?;
        return Ok((local, after));
    }

    let at = mailbox.rfind('@').ok_or(AddressError::MalformedPath)?;
    let (local, domain) = mailbox.split_at(at);
    if local.is_empty() {
        return Err(AddressError::MalformedPath);
    }
    Ok((local.to_string(), &domain[1..]))
}

fn parse_domain(domain: &str) -> Result<Domain, AddressError> {
    if domain.is_empty() {
        return Err(AddressError::MalformedPath);
    }
    if domain.len() > MAX_DOMAIN {
        return Err(AddressError::DomainTooLong);
    }
    if let Some(literal) = domain.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return parse_address_literal(literal);
    }
    for label in domain.split('.') {
        if label.is_empty()
            || label.starts_with('-')
            || label.ends_with('-')
            || !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(AddressError::InvalidDomainLabel);
        }
    }
    Ok(Domain::Name(domain.to_string()))
}

fn parse_address_literal(literal: &str) -> Result<Domain, AddressError> {
    if let Some(v6) = literal.strip_prefix("IPv6:") {
        let addr: Ipv6Addr = v6.parse().map_err(|_| AddressError::InvalidAddressLiteral)?;
        return Ok(Domain::V6(addr));
    }
    let addr: Ipv4Addr = literal
        .parse()
        .map_err(|_| AddressError::InvalidAddressLiteral)?;
    Ok(Domain::V4(addr))
}

/// Parses the ESMTP parameter string following a path, e.g. `SIZE=1024
/// BODY=8BITMIME`. Keyword grammar: `Let-dig *(Let-dig / "-" Let-dig)` — a
/// trailing `-` is rejected.
pub fn parse_esmtp_params(s: &str) -> Result<Vec<EsmtpParam>, AddressError> {
    let mut out = Vec::new();
    for token in s.split_whitespace() {
        let (keyword, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (token, None),
        };
        validate_esmtp_keyword(keyword)?;
        out.push(EsmtpParam {
            keyword: keyword.to_string(),
            value,
        });
    }
    Ok(out)
}

fn validate_esmtp_keyword(keyword: &str) -> Result<(), AddressError> {
    let bytes = keyword.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphanumeric() {
        return Err(AddressError::InvalidParameter(keyword.to_string()));
    }
    if bytes.last() == Some(&b'-') {
        return Err(AddressError::InvalidParameter(keyword.to_string()));
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
    {
        return Err(AddressError::InvalidParameter(keyword.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mailbox() {
        let (addr, params) = parse_reverse_path("<a@grr.la>").unwrap();
        let addr = addr.unwrap();
        assert_eq!(addr.local_part, "a");
        assert_eq!(addr.domain_str(), "grr.la");
        assert!(params.is_empty());
    }

    #[test]
    fn parses_null_reverse_path() {
        let (addr, _) = parse_reverse_path("<>").unwrap();
        assert!(addr.is_none());
    }

    #[test]
    fn parses_postmaster_without_domain() {
        let (addr, _) = parse_forward_path("<Postmaster>").unwrap();
        assert_eq!(addr.local_part, "Postmaster");
        assert!(addr.domain.is_none());
    }

    #[test]
    fn discards_source_route() {
        let (addr, _) = parse_reverse_path("<@a,@b:user@dest.example>").unwrap();
        let addr = addr.unwrap();
        assert_eq!(addr.local_part, "user");
        assert_eq!(addr.domain_str(), "dest.example");
    }

    #[test]
    fn parses_quoted_local_part() {
        let (addr, _) = parse_reverse_path("<\"John Doe\"@example.com>").unwrap();
        let addr = addr.unwrap();
        assert_eq!(addr.local_part, "\"John Doe\"");
    }

    #[test]
    fn rejects_long_local_part() {
        let local = "a".repeat(65);
        let arg = format!("<{local}@example.com>");
        let err = parse_reverse_path(&arg).unwrap_err();
        assert_eq!(err, AddressError::LocalPartTooLong);
    }

    #[test]
    fn rejects_long_path() {
        let local = "a".repeat(260);
        let arg = format!("<{local}@example.com>");
        let err = parse_reverse_path(&arg).unwrap_err();
        assert_eq!(err, AddressError::PathTooLong);
    }

    #[test]
    fn rejects_bad_domain_label() {
        let err = parse_reverse_path("<a@-bad.example>").unwrap_err();
        assert_eq!(err, AddressError::InvalidDomainLabel);
    }

    #[test]
    fn parses_ipv4_literal() {
        let (addr, _) = parse_reverse_path("<a@[192.168.1.1]>").unwrap();
        let addr = addr.unwrap();
        assert_eq!(addr.domain, Some(Domain::V4("192.168.1.1".parse().unwrap())));
    }

    #[test]
    fn canonicalizes_ipv6_literal_to_shortest_lowercase_form() {
        let (addr, _) =
            parse_reverse_path("<a@[IPv6:2001:0000:3238:DFE1:0063:0000:0000:FEFB]>").unwrap();
        let addr = addr.unwrap();
        assert_eq!(addr.domain_str(), "[ipv6:2001:0:3238:dfe1:63::fefb]");
    }

    #[test]
    fn parses_esmtp_params() {
        let (_, params) = parse_reverse_path("<a@example.com> SIZE=1024 BODY=8BITMIME").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].keyword, "SIZE");
        assert_eq!(params[0].value.as_deref(), Some("1024"));
        assert_eq!(params[1].keyword, "BODY");
    }

    #[test]
    fn rejects_param_with_trailing_hyphen() {
        let err = parse_reverse_path("<a@example.com> SIZE-=1").unwrap_err();
        assert!(matches!(err, AddressError::InvalidParameter(_)));
    }

    #[test]
    fn helo_domain_accepts_address_literal() {
        let d = parse_helo_domain("[192.168.1.1]").unwrap();
        assert_eq!(d, Domain::V4("192.168.1.1".parse().unwrap()));
    }
}
