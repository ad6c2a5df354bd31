use crate::config::DebitMode;
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::session::backend::StateBackend;
use crate::session::state::{keys, BudgetRecord};
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Budget middleware configuration. Money is integer micro-units.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub campaign_id: String,
    /// Cost debited per successful request
    pub cost_micros: i64,
    /// Debit timing; see [`DebitMode`]
    pub mode: DebitMode,
}

/// Budget-tracking middleware for one campaign.
///
/// Checks `remaining >= cost` against `budget:{campaign_id}` before
/// delegating and debits `spent_micros` with the backend's atomic
/// increment. In `Reserve` mode the debit happens before dispatch and is
/// rolled back on failure; in `PostSuccess` mode it happens after, and a
/// concurrent over-commit is rolled back so `spent <= total` holds at
/// every observable point. Backend errors fail closed.
pub struct BudgetUpstream {
    inner: Arc<dyn Upstream>,
    backend: Arc<dyn StateBackend>,
    config: BudgetConfig,
}

impl BudgetUpstream {
    pub fn new(
        inner: Arc<dyn Upstream>,
        backend: Arc<dyn StateBackend>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            inner,
            backend,
            config,
        }
    }

    /// Seed a campaign budget record. Intended for setup and tests; in
    /// production the record typically comes from the campaign store.
    pub async fn write_budget(
        backend: &dyn StateBackend,
        campaign_id: &str,
        total_micros: i64,
        currency: &str,
    ) -> Result<()> {
        let record = BudgetRecord {
            campaign_id: campaign_id.to_string(),
            total_micros,
            spent_micros: 0,
            currency: currency.to_string(),
        };
        backend
            .set(&keys::budget(campaign_id), record.to_value(), None)
            .await
    }

    async fn load(&self) -> Result<BudgetRecord> {
        let key = keys::budget(&self.config.campaign_id);
        let value = self.backend.get(&key).await?.ok_or_else(|| {
            // No budget record means nothing to spend from
            GatewayError::BudgetExceeded {
                campaign_id: self.config.campaign_id.clone(),
            }
        })?;
        BudgetRecord::from_value(&value)
    }

    fn exceeded(&self) -> GatewayError {
        metrics::record_budget_rejection(&self.config.campaign_id);
        GatewayError::BudgetExceeded {
            campaign_id: self.config.campaign_id.clone(),
        }
    }

    async fn debit(&self) -> Result<i64> {
        self.backend
            .increment(
                &keys::budget(&self.config.campaign_id),
                "spent_micros",
                self.config.cost_micros,
            )
            .await
    }

    async fn rollback(&self) {
        let result = self
            .backend
            .increment(
                &keys::budget(&self.config.campaign_id),
                "spent_micros",
                -self.config.cost_micros,
            )
            .await;
        if let Err(e) = result {
            warn!(
                campaign = self.config.campaign_id,
                error = %e,
                "budget rollback failed"
            );
        }
    }
}

#[async_trait]
impl Upstream for BudgetUpstream {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        // Backend errors propagate: budgets fail closed to avoid over-spend
        let record = self.load().await?;
        if record.remaining_micros() < self.config.cost_micros {
            return Err(self.exceeded());
        }

        match self.config.mode {
            DebitMode::Reserve => {
                let spent = self.debit().await?;
                if spent > record.total_micros {
                    self.rollback().await;
                    return Err(self.exceeded());
                }
                match self.inner.request(req).await {
                    Ok(body) => Ok(body),
                    Err(err) => {
                        self.rollback().await;
                        Err(err)
                    }
                }
            }
            DebitMode::PostSuccess => {
                let body = self.inner.request(req).await?;
                let spent = self.debit().await?;
                if spent > record.total_micros {
                    // Concurrent commits over-subscribed the budget: give
                    // the debit back and drop the response.
                    self.rollback().await;
                    return Err(self.exceeded());
                }
                Ok(body)
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
