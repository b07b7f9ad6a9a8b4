//! Usage: Hook for pushing the active account into the local system / external tool configs.

use crate::domain::accounts::CredentialRecord;
use crate::shared::error::AppResult;

/// Called after an account switch has been persisted. Failures are logged, never propagated.
pub trait SystemIntegration: Send + Sync {
    fn apply_account_to_system(&self, record: &CredentialRecord) -> AppResult<()>;

    fn apply_account_to_external_config(&self, record: &CredentialRecord) -> AppResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIntegration;

impl SystemIntegration for NoopIntegration {
    fn apply_account_to_system(&self, record: &CredentialRecord) -> AppResult<()> {
        tracing::debug!(account_id = %record.id, "no system integration configured");
        Ok(())
    }

    fn apply_account_to_external_config(&self, record: &CredentialRecord) -> AppResult<()> {
        tracing::debug!(account_id = %record.id, "no external config integration configured");
        Ok(())
    }
}

/// Runs the hooks, downgrading failures to warnings. The system hook (machine id) only runs
/// when `change_machine_id` is set.
pub(crate) fn propagate_switch(
    integration: &dyn SystemIntegration,
    record: &CredentialRecord,
    change_machine_id: bool,
) {
    if change_machine_id {
        if let Err(err) = integration.apply_account_to_system(record) {
            tracing::warn!(account_id = %record.id, "system integration failed: {err}");
        }
    }
    if let Err(err) = integration.apply_account_to_external_config(record) {
        tracing::warn!(account_id = %record.id, "external config integration failed: {err}");
    }
}
