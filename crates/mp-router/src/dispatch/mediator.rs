//! `ChatClient` — the external boundary the Dispatcher sends through, plus
//! the one concrete implementation shipped in-repo: an HMAC-signed
//! webhook POST.
//!
//! Grounded on the teacher's HTTP mediator: build a signed request, send
//! it, and classify the response into ok/transient/permanent so the
//! caller (the Dispatcher) can decide retry vs. quarantine without
//! knowing anything about HTTP status codes itself.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mp_common::{DispatchResult, PipelineError, Result};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send(&self, recipient_id: &str, title: &str, body: &str) -> Result<DispatchResult>;
}

pub struct WebhookChatClient {
    client: reqwest::Client,
    webhook_url: String,
    signing_secret: Option<String>,
}

impl WebhookChatClient {
    pub fn new(webhook_url: impl Into<String>, signing_secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            signing_secret,
        }
    }

    fn sign(&self, payload: &[u8]) -> Option<String> {
        let secret = self.signing_secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(payload);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ChatClient for WebhookChatClient {
    async fn send(&self, recipient_id: &str, title: &str, body: &str) -> Result<DispatchResult> {
        let payload = serde_json::json!({
            "recipient_id": recipient_id,
            "title": title,
            "body": body,
        });
        let bytes = serde_json::to_vec(&payload).map_err(|e| PipelineError::Serialization(e.to_string()))?;

        let mut request = self.client.post(&self.webhook_url).header("content-type", "application/json").body(bytes.clone());
        if let Some(signature) = self.sign(&bytes) {
            request = request.header("x-signature-sha256", signature);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() || e.is_connect() => return Ok(DispatchResult::transient(e.to_string(), None)),
            Err(e) => return Ok(DispatchResult::permanent(None, e.to_string())),
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);

        if status.is_success() {
            Ok(DispatchResult::ok())
        } else if status.as_u16() == 429 || status.is_server_error() {
            Ok(DispatchResult::transient(format!("upstream returned {status}"), retry_after))
        } else {
            Ok(DispatchResult::permanent(Some(status.as_u16()), format!("upstream returned {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_common::SendOutcome;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_send_reports_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let client = WebhookChatClient::new(server.uri(), None);
        let result = client.send("r1", "t", "b").await.unwrap();
        assert_eq!(result.outcome, SendOutcome::Ok);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let client = WebhookChatClient::new(server.uri(), None);
        let result = client.send("r1", "t", "b").await.unwrap();
        assert_eq!(result.outcome, SendOutcome::Transient);
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/")).respond_with(ResponseTemplate::new(400)).mount(&server).await;

        let client = WebhookChatClient::new(server.uri(), None);
        let result = client.send("r1", "t", "b").await.unwrap();
        assert_eq!(result.outcome, SendOutcome::Permanent);
    }

    #[tokio::test]
    async fn signing_secret_adds_signature_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/")).and(header_exists("x-signature-sha256")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let client = WebhookChatClient::new(server.uri(), Some("secret".to_string()));
        let result = client.send("r1", "t", "b").await.unwrap();
        assert_eq!(result.outcome, SendOutcome::Ok);
    }
}
