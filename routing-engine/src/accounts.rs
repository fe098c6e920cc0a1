//! Account factory: binds fresh identities to topology slots on first use

use crate::error::{Result, RouteError};
use crate::graph::Slot;
use crate::state::RunState;
use ledger_client::{Account, LedgerClient};
use std::sync::Arc;
use tracing::debug;

const MAX_GENERATION_ATTEMPTS: usize = 8;

/// Generates fresh, unlinked accounts through the ledger's key generator
#[derive(Clone)]
pub struct AccountFactory {
    ledger: Arc<dyn LedgerClient>,
}

impl std::fmt::Debug for AccountFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountFactory").finish_non_exhaustive()
    }
}

impl AccountFactory {
    /// Create new factory
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    /// One fresh account that `state` has never seen
    pub fn generate(&self, state: &RunState) -> Result<Account> {
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let account = self.ledger.generate_account()?;
            if !state.knows_address(&account.address) {
                return Ok(account);
            }
        }
        Err(RouteError::AccountGeneration(format!(
            "no unused address after {} attempts",
            MAX_GENERATION_ATTEMPTS
        )))
    }

    /// Bind accounts to every slot in `slots` that has none; returns how
    /// many were created
    pub fn materialize(
        &self,
        state: &mut RunState,
        slots: impl IntoIterator<Item = Slot>,
    ) -> Result<usize> {
        let mut created = 0;
        for slot in slots {
            if state.address_of(&slot).is_some() {
                continue;
            }
            let account = self.generate(state)?;
            debug!("Bound {} to {}", slot, account.address);
            state.bind(slot, account);
            created += 1;
        }
        Ok(created)
    }
}
