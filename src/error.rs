//! Typed error kinds for the receiver core.
//!
//! Session-scoped errors (`ProtocolError`) are mapped to an SMTP reply
//! and/or a kill decision by `protocol`; they never escape the session
//! task. `ConfigError`/`BackendError` surface at the `Daemon` boundary as
//! `anyhow::Error` via `#[from]`, matching the error plumbing already
//! used by `mail_laser::run()`.

use thiserror::Error;

/// A single SMTP reply line: `<basic-code> <enhanced-code> <text>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub enhanced: &'static str,
    pub text: &'static str,
}

impl Reply {
    pub const fn new(code: u16, enhanced: &'static str, text: &'static str) -> Self {
        Reply {
            code,
            enhanced,
            text,
        }
    }

    /// Render as the wire form, e.g. `250 2.1.0 OK`.
    pub fn render(&self) -> String {
        if self.enhanced.is_empty() {
            format!("{} {}", self.code, self.text)
        } else {
            format!("{} {} {}", self.code, self.enhanced, self.text)
        }
    }
}

/// Canonical reply table. Round-trips bit-exact.
pub mod replies {
    use super::Reply;

    pub const OK_SENDER: Reply = Reply::new(250, "2.1.0", "OK");
    pub const OK_RECIPIENT: Reply = Reply::new(250, "2.1.5", "OK");
    pub const TOO_MANY_RECIPIENTS: Reply = Reply::new(452, "4.5.3", "Too many recipients");
    pub const RELAY_DENIED: Reply = Reply::new(454, "4.1.1", "Error: Relay access denied");
    pub const INVALID_ADDRESS: Reply = Reply::new(501, "5.5.4", "Invalid address");
    pub const NESTED_MAIL: Reply = Reply::new(503, "5.5.1", "Error: nested MAIL command");
    pub const LOCAL_PART_TOO_LONG: Reply = Reply::new(550, "5.5.4", "Local part too long");
    pub const PATH_TOO_LONG: Reply = Reply::new(550, "5.5.4", "Path too long");
    pub const DOMAIN_INVALID: Reply = Reply::new(550, "5.5.4", "Invalid domain");
    pub const LINE_TOO_LONG: Reply = Reply::new(554, "5.5.1", "Line too long");
    pub const TIMEOUT: Reply = Reply::new(421, "4.3.0", "Error: timeout exceeded");
    pub const SHUTTING_DOWN: Reply = Reply::new(
        421,
        "4.3.0",
        "Server is shutting down. Please try again later. Sayonara!",
    );
    pub const READY_FOR_TLS: Reply = Reply::new(220, "2.0.0", "Ready to start TLS");
    pub const RSET_OK: Reply = Reply::new(250, "2.1.0", "OK");
    pub const NOOP_OK: Reply = Reply::new(250, "2.0.0", "OK");
    pub const BYE: Reply = Reply::new(221, "2.0.0", "Bye");
    pub const INVALID_COMMAND: Reply = Reply::new(500, "5.5.1", "Invalid command");
    pub const TOO_MANY_UNKNOWN: Reply = Reply::new(500, "", "Too many unrecognized commands");
    pub const DATA_SIZE_EXCEEDED_SOFT: Reply =
        Reply::new(451, "4.3.0", "Error: Maximum DATA size exceeded");
    pub const DATA_SIZE_EXCEEDED_HARD: Reply =
        Reply::new(451, "4.3.0", "Error: Maximum DATA size exceeded");
    pub const DATA_REQUIRES_RCPT: Reply =
        Reply::new(554, "5.5.1", "Error: no valid recipients");
    pub const START_DATA: Reply = Reply::new(354, "", "Enter message, ending with \".\" on a line by itself");
}

/// Failure kinds for the RFC 5321 address grammar.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("local part exceeds 64 octets")]
    LocalPartTooLong,
    #[error("path exceeds 256 octets")]
    PathTooLong,
    #[error("domain exceeds 255 octets")]
    DomainTooLong,
    #[error("invalid domain label")]
    InvalidDomainLabel,
    #[error("invalid address literal")]
    InvalidAddressLiteral,
    #[error("malformed reverse-path or forward-path")]
    MalformedPath,
    #[error("invalid esmtp parameter {0:?}")]
    InvalidParameter(String),
}

impl AddressError {
    /// Maps a parse failure to its canonical SMTP reply.
    pub fn to_reply(&self) -> Reply {
        match self {
            AddressError::LocalPartTooLong => replies::LOCAL_PART_TOO_LONG,
            AddressError::PathTooLong => replies::PATH_TOO_LONG,
            AddressError::DomainTooLong
            | AddressError::InvalidDomainLabel
            | AddressError::InvalidAddressLiteral => replies::DOMAIN_INVALID,
            AddressError::MalformedPath | AddressError::InvalidParameter(_) => {
                replies::INVALID_ADDRESS
            }
        }
    }
}

/// Protocol-level errors: malformed commands or a dead connection.
/// `protocol` matches each variant directly to decide whether the
/// session replies and continues or closes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command line exceeded the 1024 byte limit")]
    LineTooLong,
    #[error("too many unrecognized commands")]
    TooManyUnknownCommands,
    #[error("read deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Configuration validation/loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no enabled servers configured")]
    NoEnabledServers,
    #[error("duplicate listen_interface {0:?}")]
    DuplicateListenInterface(String),
    #[error("server {0:?}: tls_always_on requires private_key_file and public_key_file")]
    TlsAlwaysOnMissingMaterial(String),
    #[error("server {0:?}: start_tls_on requires private_key_file and public_key_file")]
    StartTlsMissingMaterial(String),
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by a `Backend` implementation's lifecycle operations.
/// `Backend::process` itself never returns this — it returns a reply line
/// but `start`/`shutdown`/`reinitialize` can fail.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend failed to start: {0}")]
    StartFailed(String),
    #[error("backend failed to reinitialize: {0}")]
    ReinitializeFailed(String),
    #[error("backend shutdown error: {0}")]
    ShutdownFailed(String),
}
