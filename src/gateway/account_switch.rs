//! Usage: Account switch that first completes a record missing its user id or profile ARN.
//!
//! Network calls run without the registry lock; the results and the activation land in one commit.

use crate::domain::accounts::CredentialRecord;
use crate::domain::registry::{CredentialRegistry, SwitchRefresh, TokenRefresher};
use crate::gateway::usage::UsageFetcher;
use crate::shared::blocking;
use crate::shared::error::AppResult;
use std::sync::Arc;

/// Whether a switch to `record` should refresh first.
pub fn needs_identity_refresh(record: &CredentialRecord) -> bool {
    let missing = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
    !record.refresh_token.is_empty() && (missing(&record.user_id) || missing(&record.profile_arn))
}

/// Refresh and profile failures are logged and the switch still happens.
async fn gather_refresh(
    record: &CredentialRecord,
    refresher: &dyn TokenRefresher,
    usage: &dyn UsageFetcher,
) -> SwitchRefresh {
    let tokens = match refresher.refresh_tokens(record.refresh_token.expose()).await {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::warn!(account_id = %record.id, "token refresh before switch failed: {err}");
            return SwitchRefresh::default();
        }
    };

    let profile_arn = tokens.profile_arn.as_deref().or(record.profile_arn.as_deref());
    let user_id = match usage
        .fetch_usage(tokens.bearer_token.expose(), profile_arn)
        .await
    {
        Ok(snapshot) => snapshot.user_id,
        Err(err) => {
            tracing::warn!(account_id = %record.id, "profile fetch before switch failed: {err}");
            None
        }
    };

    SwitchRefresh {
        tokens: Some(tokens),
        user_id,
    }
}

/// Switches to `id`, refreshing its tokens and identity first when they are incomplete.
pub async fn switch_with_refresh(
    registry: &Arc<CredentialRegistry>,
    id: &str,
    refresher: &dyn TokenRefresher,
    usage: &dyn UsageFetcher,
) -> AppResult<CredentialRecord> {
    let target = registry.get_account(id)?;
    let refresh = if needs_identity_refresh(&target) {
        tracing::debug!(account_id = %target.id, "completing account identity before switch");
        gather_refresh(&target, refresher, usage).await
    } else {
        SwitchRefresh::default()
    };

    let registry = Arc::clone(registry);
    let id = target.id;
    blocking::run("account_switch.commit", move || {
        registry.switch_account_refreshed(&id, refresh)
    })
    .await
}
