//! Z-API Client
//!
//! Sends group text messages through the Z-API REST gateway:
//! `POST {base}/instances/{id}/token/{token}/send-text` with the account's
//! `Client-Token` header. The instance-status probe uses the sibling
//! `/status` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use zc_common::SendOutcome;

use crate::{GatewayClient, GatewayError, InstanceStatus};

/// Z-API client configuration
#[derive(Debug, Clone)]
pub struct ZapiClientConfig {
    pub base_url: String,
    pub instance_id: String,
    pub token: String,
    /// Account-level security token, sent as the `Client-Token` header
    pub client_token: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ZapiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.z-api.io".to_string(),
            instance_id: String::new(),
            token: String::new(),
            client_token: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendTextRequest<'a> {
    phone: &'a str,
    message: &'a str,
}

/// Production `GatewayClient` backed by Z-API
pub struct ZapiClient {
    config: ZapiClientConfig,
    client: reqwest::Client,
}

impl ZapiClient {
    pub fn new(config: ZapiClientConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    fn has_credentials(&self) -> bool {
        !self.config.instance_id.is_empty() && !self.config.token.is_empty()
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/instances/{}/token/{}/{}",
            self.config.base_url, self.config.instance_id, self.config.token, path
        )
    }
}

#[async_trait]
impl GatewayClient for ZapiClient {
    async fn send_text(&self, group_handle: &str, text: &str) -> SendOutcome {
        // A broken config can never be fixed by retrying the recipient
        if !self.has_credentials() {
            return SendOutcome::Rejected("gateway credentials not configured".to_string());
        }

        let url = self.endpoint("send-text");
        let body = SendTextRequest {
            phone: group_handle,
            message: text,
        };

        let result = self
            .client
            .post(&url)
            .header("Client-Token", &self.config.client_token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(group_handle = %group_handle, "Gateway accepted message");
                    SendOutcome::Accepted
                } else {
                    let error_body = response.text().await.unwrap_or_default();
                    warn!(
                        group_handle = %group_handle,
                        status = status.as_u16(),
                        "Gateway refused message: {}",
                        error_body
                    );
                    let reason = format!("HTTP {}: {}", status.as_u16(), error_body);
                    if status.is_client_error() {
                        SendOutcome::Rejected(reason)
                    } else {
                        SendOutcome::TransientError(reason)
                    }
                }
            }
            Err(e) => {
                warn!(group_handle = %group_handle, "Gateway request failed: {}", e);
                SendOutcome::TransientError(e.to_string())
            }
        }
    }

    async fn get_instance_status(&self) -> Result<InstanceStatus, GatewayError> {
        if !self.has_credentials() {
            return Err(GatewayError::MissingCredentials);
        }

        let response = self
            .client
            .get(self.endpoint("status"))
            .header("Client-Token", &self.config.client_token)
            .send()
            .await?;

        let status = response.json::<InstanceStatus>().await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> ZapiClient {
        ZapiClient::new(ZapiClientConfig {
            base_url: base_url.to_string(),
            instance_id: "inst-1".to_string(),
            token: "tok-1".to_string(),
            client_token: "ct-1".to_string(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_text_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances/inst-1/token/tok-1/send-text"))
            .and(header("Client-Token", "ct-1"))
            .and(body_json_string(
                r#"{"phone":"group-a","message":"hello"}"#,
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "zaapId": "z1", "messageId": "m1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let outcome = client.send_text("group-a", "hello").await;
        assert_eq!(outcome, SendOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_send_text_rejected_on_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid phone"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let outcome = client.send_text("bad-handle", "hello").await;
        match outcome {
            SendOutcome::Rejected(reason) => {
                assert!(reason.contains("400"));
                assert!(reason.contains("invalid phone"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_text_transient_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let outcome = client.send_text("group-a", "hello").await;
        assert!(matches!(outcome, SendOutcome::TransientError(_)));
    }

    #[tokio::test]
    async fn test_send_text_transient_on_connection_failure() {
        // nothing listening on this port
        let client = test_client("http://127.0.0.1:1");
        let outcome = client.send_text("group-a", "hello").await;
        assert!(matches!(outcome, SendOutcome::TransientError(_)));
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected_at_send_time() {
        let client = ZapiClient::new(ZapiClientConfig::default()).unwrap();
        let outcome = client.send_text("group-a", "hello").await;
        assert!(matches!(outcome, SendOutcome::Rejected(_)));

        let err = client.get_instance_status().await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_instance_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/inst-1/token/tok-1/status"))
            .and(header("Client-Token", "ct-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connected": true, "smartphoneConnected": true
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let status = client.get_instance_status().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.smartphone_connected, Some(true));
    }
}
