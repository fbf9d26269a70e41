use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use flowcast_core::config::TariffConfig;
use flowcast_core::error::{FlowError, Result};
use flowcast_core::types::NodeType;

/// Process-wide credit balance with admission control.
///
/// Costs are fixed per node type, so admission happens before any network
/// call. The balance only moves down in `settle`, which callers invoke after
/// a dispatch fully succeeded.
pub struct CreditLedger {
    balance: AtomicU64,
    tariff: TariffConfig,
}

impl CreditLedger {
    pub fn new(balance: u64, tariff: TariffConfig) -> Self {
        Self {
            balance: AtomicU64::new(balance),
            tariff,
        }
    }

    pub fn balance(&self) -> u64 {
        self.balance.load(Ordering::SeqCst)
    }

    pub fn cost_of(&self, node_type: NodeType) -> u64 {
        self.tariff.cost(node_type)
    }

    /// Whether the balance covers `cost`.
    pub fn admit(&self, cost: u64) -> bool {
        self.balance() >= cost
    }

    /// Admission as a typed error.
    pub fn check(&self, cost: u64) -> Result<()> {
        let balance = self.balance();
        if balance < cost {
            debug!(cost, balance, "Dispatch rejected by credit admission");
            return Err(FlowError::InsufficientCredits {
                required: cost,
                balance,
            });
        }
        Ok(())
    }

    /// Debit `cost` and return the new balance. Never goes below zero.
    pub fn settle(&self, cost: u64) -> u64 {
        let previous = self
            .balance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(cost))
            })
            .unwrap_or_else(|b| b);
        let balance = previous.saturating_sub(cost);
        debug!(cost, balance, "Credits settled");
        balance
    }

    pub fn top_up(&self, amount: u64) -> u64 {
        let balance = self
            .balance
            .fetch_add(amount, Ordering::SeqCst)
            .saturating_add(amount);
        info!(amount, balance, "Credits topped up");
        balance
    }

    /// Replace the balance, e.g. with a persisted value.
    pub fn restore(&self, balance: u64) {
        self.balance.store(balance, Ordering::SeqCst);
    }
}
