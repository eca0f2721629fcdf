//! In-memory scripted payment provider for tests.
//!
//! Implements `PaymentGateway` against a shared in-memory charge store, so
//! intent and reconciliation flows exercise the real registry plumbing
//! without a network. Failure behavior is scripted per call via
//! `set_next_failure`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::payments::gateway::{
    ChargeOutcome, ChargeRequest, ChargeState, GatewayError, PaymentGateway, RefundOutcome,
};

#[derive(Debug, Clone)]
pub struct MockCharge {
    pub intent_id: String,
    pub charge_id: String,
    pub reference: Uuid,
    pub amount: i64,
    pub currency: String,
    pub state: ChargeState,
    pub refunded: i64,
}

/// What the next gateway call should do instead of succeeding.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    Decline,
    Timeout,
    Network(String),
}

pub struct MockGateway {
    name: String,
    charges: Arc<RwLock<HashMap<String, MockCharge>>>,
    next_failure: Arc<RwLock<Option<ScriptedFailure>>>,
    /// Charges created while this is set come back `pending`, as a provider
    /// that settles asynchronously would report.
    settle_async: Arc<RwLock<bool>>,
}

impl MockGateway {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            charges: Arc::new(RwLock::new(HashMap::new())),
            next_failure: Arc::new(RwLock::new(None)),
            settle_async: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn set_next_failure(&self, failure: Option<ScriptedFailure>) {
        *self.next_failure.write().await = failure;
    }

    pub async fn set_settle_async(&self, value: bool) {
        *self.settle_async.write().await = value;
    }

    /// Flip a pending charge to succeeded, as a settlement webhook would
    /// report. Returns the updated charge for building the event payload.
    pub async fn settle(&self, intent_id: &str) -> Option<MockCharge> {
        let mut charges = self.charges.write().await;
        let charge = charges.get_mut(intent_id)?;
        charge.state = ChargeState::Succeeded;
        Some(charge.clone())
    }

    pub async fn charge(&self, intent_id: &str) -> Option<MockCharge> {
        self.charges.read().await.get(intent_id).cloned()
    }

    pub async fn charge_count(&self) -> usize {
        self.charges.read().await.len()
    }

    async fn take_failure(&self) -> Result<(), GatewayError> {
        let failure = self.next_failure.write().await.take();
        match failure {
            None => Ok(()),
            Some(ScriptedFailure::Decline) => {
                Err(GatewayError::Api("card_declined".to_string()))
            }
            Some(ScriptedFailure::Timeout) => Err(GatewayError::Timeout),
            Some(ScriptedFailure::Network(msg)) => Err(GatewayError::Network(msg)),
        }
    }

    fn outcome(charge: &MockCharge) -> ChargeOutcome {
        ChargeOutcome {
            intent_id: charge.intent_id.clone(),
            charge_id: Some(charge.charge_id.clone()),
            state: charge.state,
            raw: serde_json::json!({
                "intent_id": charge.intent_id,
                "charge_id": charge.charge_id,
                "status": match charge.state {
                    ChargeState::Succeeded => "succeeded",
                    ChargeState::Failed => "failed",
                    ChargeState::Pending => "pending",
                },
            }),
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string().replace('-', "")[..24].to_string()
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        self.take_failure().await?;

        let state = if *self.settle_async.read().await {
            ChargeState::Pending
        } else {
            ChargeState::Succeeded
        };
        let charge = MockCharge {
            intent_id: format!("pi_{}", short_id()),
            charge_id: format!("ch_{}", short_id()),
            reference: request.reference,
            amount: request.amount,
            currency: request.currency.clone(),
            state,
            refunded: 0,
        };
        self.charges
            .write()
            .await
            .insert(charge.intent_id.clone(), charge.clone());
        Ok(Self::outcome(&charge))
    }

    async fn refund(&self, charge_ref: &str, amount: i64) -> Result<RefundOutcome, GatewayError> {
        self.take_failure().await?;

        let mut charges = self.charges.write().await;
        let charge = charges
            .values_mut()
            .find(|c| c.intent_id == charge_ref || c.charge_id == charge_ref)
            .ok_or_else(|| GatewayError::Api(format!("no such charge {charge_ref}")))?;
        if charge.state != ChargeState::Succeeded {
            return Err(GatewayError::Api("charge not refundable".to_string()));
        }
        if charge.refunded + amount > charge.amount {
            return Err(GatewayError::Api("refund exceeds charge".to_string()));
        }
        charge.refunded += amount;
        Ok(RefundOutcome {
            refund_id: format!("re_{}", short_id()),
            amount,
            raw: serde_json::json!({
                "refund_id": format!("re_{}", short_id()),
                "amount": amount,
            }),
        })
    }

    async fn verify(&self, intent_id: &str) -> Result<ChargeOutcome, GatewayError> {
        self.take_failure().await?;

        let charges = self.charges.read().await;
        let charge = charges
            .get(intent_id)
            .ok_or_else(|| GatewayError::Api(format!("no such intent {intent_id}")))?;
        Ok(Self::outcome(charge))
    }
}
