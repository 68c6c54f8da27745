//! The pluggable message-processing contract the protocol engine invokes
//! once per accepted DATA body.
//!
//! Generalizes `MailLaser`'s hard-wired `WebhookClient` call into the small
//! operation set a multi-backend daemon needs: `start`/`shutdown` bracket
//! the daemon's lifecycle, `reinitialize` supports a failed hot-swap
//! rolling back to the previous instance, and `process` is the hot path.
//! `validate_rcpt` is optional — most backends accept every allowed
//! recipient and only judge the message as a whole in `process`.

pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::BackendError;
use crate::logging::Logger;

#[async_trait]
pub trait Backend: Send + Sync {
    async fn start(&self) -> Result<(), BackendError>;
    async fn shutdown(&self) -> Result<(), BackendError>;
    async fn reinitialize(&self) -> Result<(), BackendError>;

    /// Consumes one accepted message and returns the single SMTP reply
    /// line to write back to the client. Must return a 4xx/5xx line on
    /// internal failure rather than propagate an error — the engine does
    /// not interpret failures further.
    async fn process(&self, envelope: &Envelope) -> String;

    /// Optional per-recipient policy check, consulted while `RCPT TO` is
    /// still being accumulated. `None` means no objection.
    async fn validate_rcpt(&self, _envelope: &Envelope, _recipient: &str) -> Option<String> {
        None
    }

    /// Installs the logger the backend should use once the daemon's
    /// logging configuration is known or changes.
    fn set_mainlog(&self, logger: Arc<Logger>);
}

/// A no-op backend that accepts every message. Used by tests that exercise
/// the protocol engine without a real downstream processor.
pub struct NullBackend;

#[async_trait]
impl Backend for NullBackend {
    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }
    async fn shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }
    async fn reinitialize(&self) -> Result<(), BackendError> {
        Ok(())
    }
    async fn process(&self, _envelope: &Envelope) -> String {
        "250 2.0.0 OK".to_string()
    }
    fn set_mainlog(&self, _logger: Arc<Logger>) {}
}
