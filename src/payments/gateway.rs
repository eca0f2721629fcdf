//! Provider-agnostic payment gateway seam.
//!
//! A `PaymentGateway` knows how to create a charge, refund it and re-verify
//! its state. Concrete providers are registered by name at startup in a
//! `GatewayRegistry` (strategy pattern; no runtime SDK loading). The core
//! never trusts client-reported charge state; `verify` asks the provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::PaymentsConfig;
use crate::shared::error::ApiError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider API error: {0}")]
    Api(String),
    #[error("provider network error: {0}")]
    Network(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("provider returned an unparseable response: {0}")]
    Parse(String),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Provider(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// Our payment row id, passed to the provider for reconciliation.
    pub reference: Uuid,
    pub amount: i64,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub intent_id: String,
    pub charge_id: Option<String>,
    pub state: ChargeState,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund_id: String,
    pub amount: i64,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError>;
    async fn refund(&self, charge_ref: &str, amount: i64) -> Result<RefundOutcome, GatewayError>;
    async fn verify(&self, intent_id: &str) -> Result<ChargeOutcome, GatewayError>;
}

pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn from_config(config: &PaymentsConfig) -> anyhow::Result<Self> {
        let mut gateways: HashMap<String, Arc<dyn PaymentGateway>> = HashMap::new();
        for provider in &config.providers {
            let gateway = HttpGateway::new(
                provider.name.clone(),
                provider.base_url.clone(),
                provider.api_key.clone(),
                Duration::from_secs(config.provider_timeout_secs),
            )?;
            gateways.insert(provider.name.clone(), Arc::new(gateway));
        }
        Ok(Self { gateways })
    }

    pub fn empty() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.name().to_string(), gateway);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, ApiError> {
        self.gateways
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::BadRequest(format!("unknown payment provider '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.gateways.keys().map(String::as_str).collect()
    }
}

/// REST provider client. The wire shape is the common
/// charges/refunds/intents surface the platform's gateway adapters expose.
pub struct HttpGateway {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireCharge {
    intent_id: String,
    charge_id: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireRefund {
    refund_id: String,
    amount: i64,
}

impl HttpGateway {
    pub fn new(
        name: String,
        base_url: String,
        api_key: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name,
            base_url,
            api_key,
            client,
        })
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<serde_json::Value, GatewayError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(GatewayError::Api(format!("HTTP {status}: {body}")));
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Parse(e.to_string()))
    }

    fn charge_outcome(&self, raw: serde_json::Value) -> Result<ChargeOutcome, GatewayError> {
        let wire: WireCharge =
            serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Parse(e.to_string()))?;
        let state = match wire.status.as_str() {
            "succeeded" => ChargeState::Succeeded,
            "failed" => ChargeState::Failed,
            _ => ChargeState::Pending,
        };
        Ok(ChargeOutcome {
            intent_id: wire.intent_id,
            charge_id: wire.charge_id,
            state,
            raw,
        })
    }

    fn map_send_error(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "reference": request.reference,
                "amount": request.amount,
                "currency": request.currency,
                "description": request.description,
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let raw = self.read_body(response).await?;
        self.charge_outcome(raw)
    }

    async fn refund(&self, charge_ref: &str, amount: i64) -> Result<RefundOutcome, GatewayError> {
        let response = self
            .client
            .post(format!("{}/charges/{}/refunds", self.base_url, charge_ref))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "amount": amount }))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let raw = self.read_body(response).await?;
        let wire: WireRefund =
            serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Parse(e.to_string()))?;
        Ok(RefundOutcome {
            refund_id: wire.refund_id,
            amount: wire.amount,
            raw,
        })
    }

    async fn verify(&self, intent_id: &str) -> Result<ChargeOutcome, GatewayError> {
        let response = self
            .client
            .get(format!("{}/intents/{}", self.base_url, intent_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let raw = self.read_body(response).await?;
        self.charge_outcome(raw)
    }
}
