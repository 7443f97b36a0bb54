//! WhatsApp Gateway Client
//!
//! Abstracts the upstream messaging gateway behind the `GatewayClient`
//! trait so the dispatcher can run against a mock in tests. The production
//! implementation talks to Z-API (`zapi` module).
//!
//! Send attempts never surface as `Err`: every HTTP and transport outcome
//! collapses into a `SendOutcome` tag the dispatcher can act on. Only the
//! instance-status probe has a hard error path.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use zc_common::SendOutcome;

pub mod zapi;

pub use zapi::{ZapiClient, ZapiClientConfig};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway credentials are not configured")]
    MissingCredentials,
}

/// Connection state of the gateway instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub smartphone_connected: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One text message to one group handle.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Attempt delivery of `text` to `group_handle`.
    ///
    /// Mapping: gateway acceptance -> `Accepted`; a definitive refusal
    /// (4xx, bad handle, missing credentials) -> `Rejected`; anything that
    /// may succeed on retry (5xx, timeout, connection failure) ->
    /// `TransientError`.
    async fn send_text(&self, group_handle: &str, text: &str) -> SendOutcome;

    /// Probe whether the gateway instance is connected to WhatsApp.
    async fn get_instance_status(&self) -> Result<InstanceStatus, GatewayError>;
}
