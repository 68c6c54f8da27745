//! Forwards each accepted message to a configured HTTPS endpoint.
//!
//! Adapted from `MailLaser`'s `WebhookClient`: the same `hyper` +
//! `hyper-rustls` + native-roots client setup, generalized from a
//! single-recipient forwarder into a `Backend` that POSTs once per accepted
//! recipient and folds per-recipient failures into the single reply line
//! `Backend::process` must return. HTML-body extraction (an `html2text`/
//! `mailparse` pass over the raw body) is dropped — see DESIGN.md — so
//! `body` is the raw DATA octets, lossily decoded as UTF-8.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::BackendError;
use crate::logging::Logger;

use super::Backend;

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type WebhookHttpClient = Client<HttpsConn, Full<Bytes>>;

/// The shape of `AppConfig.backend_config` this backend expects.
#[derive(Debug, Deserialize)]
struct WebhookConfig {
    webhook_url: String,
}

/// The JSON body POSTed to `webhook_url` for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailPayload {
    sender: String,
    recipient: String,
    subject: String,
    body: String,
}

pub struct WebhookBackend {
    webhook_url: String,
    client: WebhookHttpClient,
    user_agent: String,
    logger: ArcSwapOption<Logger>,
}

impl WebhookBackend {
    /// Builds a client from the `backend_config` JSON object. Fails if
    /// `webhook_url` is missing or native root certificates can't load —
    /// both are treated as startup failures, not per-message ones.
    pub fn new(config: &serde_json::Map<String, serde_json::Value>) -> Result<WebhookBackend, BackendError> {
        let parsed: WebhookConfig = serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| BackendError::StartFailed(format!("invalid webhook backend config: {e}")))?;

        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| BackendError::StartFailed(format!("failed to load root certificates: {e}")))?
            .https_only()
            .enable_http1()
            .build();
        let client: WebhookHttpClient = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        Ok(WebhookBackend {
            webhook_url: parsed.webhook_url,
            client,
            user_agent,
            logger: ArcSwapOption::empty(),
        })
    }

    async fn forward_one(&self, payload: &EmailPayload) -> anyhow::Result<()> {
        let json_body = serde_json::to_string(payload)?;
        let request = Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.webhook_url)
            .header("content-type", "application/json")
            .header("user-agent", &self.user_agent)
            .body(Full::new(Bytes::from(json_body)))?;

        let response = self.client.request(request).await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook responded with status {}", response.status());
        }
        Ok(())
    }

    fn log(&self, args: std::fmt::Arguments<'_>) {
        if let Some(logger) = self.logger.load().as_ref() {
            logger.error(args);
        }
    }
}

#[async_trait::async_trait]
impl Backend for WebhookBackend {
    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn reinitialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn process(&self, envelope: &Envelope) -> String {
        let sender = envelope
            .mail_from
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let body = String::from_utf8_lossy(&envelope.data).into_owned();

        for rcpt in envelope.rcpt_to() {
            let payload = EmailPayload {
                sender: sender.clone(),
                recipient: rcpt.to_string(),
                subject: envelope.subject.clone(),
                body: body.clone(),
            };
            if let Err(e) = self.forward_one(&payload).await {
                self.log(format_args!(
                    "webhook delivery to {} failed for {}: {e}",
                    self.webhook_url, payload.recipient
                ));
                return "451 4.3.0 Error: backend delivery failed".to_string();
            }
        }

        "250 2.0.0 OK".to_string()
    }

    fn set_mainlog(&self, logger: Arc<Logger>) {
        self.logger.store(Some(logger));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_config_missing_webhook_url() {
        let config = serde_json::Map::new();
        assert!(WebhookBackend::new(&config).is_err());
    }

    #[test]
    fn accepts_valid_config() {
        let mut config = serde_json::Map::new();
        config.insert(
            "webhook_url".to_string(),
            serde_json::Value::String("https://example.com/hook".to_string()),
        );
        assert!(WebhookBackend::new(&config).is_ok());
    }
}
