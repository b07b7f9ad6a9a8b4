mod support;

use kiro_vault::domain::accounts::{CredentialRecord, LoginMethod, QuotaBucket, QuotaDetail, SubscriptionType};
use kiro_vault::domain::registry::TokenRefresher;
use kiro_vault::gateway::account_switch::switch_with_refresh;
use std::sync::Arc;
use support::{MockKiro, TestVault, PROFILE_ARN};

#[tokio::test]
async fn static_token_with_refresh_is_rotated_before_profile_lookup() {
    let vault = TestVault::new();
    let mock = MockKiro::start().await;
    let services = vault.services(mock.config());

    let record = services
        .token_client
        .create_account_from_token(
            "valid-bob-static-token-0000",
            Some("refresh-bob-long-token-0001"),
        )
        .await
        .expect("create from token");
    assert_eq!(record.email, "bob@example.com");
    assert_eq!(record.login_method, LoginMethod::Token);
    assert_eq!(record.bearer_token.expose(), "valid-bob-refreshed-access-0002");
    assert_eq!(record.refresh_token.expose(), "refresh-bob-rotated");
    assert_eq!(record.profile_arn.as_deref(), Some(PROFILE_ARN));
    assert!(record.token_expiry.is_some(), "string expiresIn is honoured");
    assert_eq!(record.subscription_type, SubscriptionType::Pro);
    assert!(!record.is_active);

    let hits = mock.hits();
    assert_eq!(hits.refreshes, vec!["refresh-bob-long-token-0001"]);
    assert_eq!(hits.usage_tokens, vec!["valid-bob-refreshed-access-0002"]);
}

#[tokio::test]
async fn static_token_without_refresh_is_used_as_is() {
    let vault = TestVault::new();
    let mock = MockKiro::start().await;
    let services = vault.services(mock.config());

    let record = services
        .token_client
        .create_account_from_token("valid-erin-static-token-0000", None)
        .await
        .expect("create from token");
    assert_eq!(record.email, "erin@example.com");
    assert!(record.refresh_token.is_empty());
    assert!(mock.hits().refreshes.is_empty());

    let err = services
        .token_client
        .create_account_from_token("short", None)
        .await
        .expect_err("too short");
    assert_eq!(err.code(), "SEC_INVALID_INPUT");

    let err = services
        .token_client
        .create_account_from_token("rejected-static-token-000000", None)
        .await
        .expect_err("rejected by usage endpoint");
    assert_eq!(err.code(), "REMOTE_FORBIDDEN");
}

#[tokio::test]
async fn validate_distinguishes_live_and_rejected_tokens() {
    let vault = TestVault::new();
    let mock = MockKiro::start().await;
    let services = vault.services(mock.config());

    assert!(services
        .token_client
        .validate("valid-bob-static-token-0000")
        .await
        .expect("validate"));
    assert!(!services
        .token_client
        .validate("stale-bob-static-token-0000")
        .await
        .expect("validate"));
}

#[tokio::test]
async fn batch_refresh_reports_partial_failures_and_persists_successes() {
    let vault = TestVault::new();
    let mock = MockKiro::start().await;
    let services = vault.services(mock.config());
    let registry = &services.registry;

    let good = registry
        .add_account(
            CredentialRecord::new("good@example.com", LoginMethod::Oauth)
                .with_tokens("valid-good-old-access-0000", "refresh-good-long-token-0001"),
        )
        .expect("good");
    let revoked = registry
        .add_account(
            CredentialRecord::new("revoked@example.com", LoginMethod::Oauth)
                .with_tokens("valid-revoked-old-access-0000", "revoked-refresh-token-0001"),
        )
        .expect("revoked");
    let bare = registry
        .add_account(CredentialRecord::new("bare@example.com", LoginMethod::Token))
        .expect("bare");

    let refresher: Arc<dyn TokenRefresher> = services.token_client.clone();
    let ids = vec![
        good.id.clone(),
        revoked.id.clone(),
        bare.id.clone(),
        "missing-account".to_string(),
    ];
    let result = registry
        .batch_refresh_tokens(&ids, refresher)
        .await
        .expect("batch refresh");
    assert_eq!(result.total_count, 4);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.errors.len(), 3);
    assert!(!result.is_complete_success());
    let revoked_error = result
        .errors
        .iter()
        .find(|e| e.id == revoked.id)
        .expect("revoked error");
    assert!(revoked_error.error.contains("401"), "{}", revoked_error.error);

    let good_after = registry.get_account(&good.id).expect("good");
    assert_eq!(good_after.bearer_token.expose(), "valid-good-refreshed-access-0002");
    assert_eq!(good_after.refresh_token.expose(), "refresh-good-rotated");
    assert!(good_after.token_expiry.is_some());
    let revoked_after = registry.get_account(&revoked.id).expect("revoked");
    assert_eq!(revoked_after.bearer_token.expose(), "valid-revoked-old-access-0000");
    drop(services);

    let reopened = vault.services(mock.config());
    assert_eq!(
        reopened
            .registry
            .get_account(&good.id)
            .expect("good")
            .bearer_token
            .expose(),
        "valid-good-refreshed-access-0002"
    );
}

#[tokio::test]
async fn monitor_pass_writes_back_quota_and_raises_alerts() {
    let vault = TestVault::new();
    let mock = MockKiro::start().await;
    let services = vault.services(mock.config());
    let registry = &services.registry;

    let carol = registry
        .add_account(
            CredentialRecord::new("carol@example.com", LoginMethod::Oauth)
                .with_tokens("valid-carol-access-token-0001", "refresh-carol-long-token-0001"),
        )
        .expect("carol");
    registry
        .add_account(CredentialRecord::new("nobody@example.com", LoginMethod::Token))
        .expect("no token");
    registry
        .add_account(
            CredentialRecord::new("dave@example.com", LoginMethod::Oauth)
                .with_tokens("blocked-dave-access-token-0001", "refresh-dave-long-token-0001"),
        )
        .expect("dave");

    let mut alerts = services.monitor.subscribe();
    let report = services.monitor.run_once().await.expect("monitor pass");
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 1);

    let carol_after = registry.get_account(&carol.id).expect("carol");
    assert_eq!(carol_after.quota.main, QuotaDetail::new(950, 1000));
    assert_eq!(carol_after.subscription_type, SubscriptionType::Pro);

    assert_eq!(report.alerts.len(), 1);
    let alert = &report.alerts[0];
    assert_eq!(alert.account_id, carol.id);
    assert_eq!(alert.bucket, QuotaBucket::Main);
    assert!((alert.percentage - 0.95).abs() < 1e-9);
    let broadcast = alerts.recv().await.expect("alert broadcast");
    assert_eq!(broadcast.len(), 1);

    // The monitor pass primed the cache for this token.
    let before = mock.hits().usage_tokens.len();
    services
        .quota_cache
        .get_quota("valid-carol-access-token-0001")
        .await
        .expect("cached");
    services
        .quota_cache
        .get_quota("valid-carol-access-token-0001")
        .await
        .expect("cached");
    assert_eq!(mock.hits().usage_tokens.len(), before);
    assert_eq!(services.quota_cache.stats().entries, 1);
}

#[tokio::test]
async fn switch_completes_missing_identity_through_the_auth_service() {
    let vault = TestVault::new();
    let mock = MockKiro::start().await;
    let services = vault.services(mock.config());
    let registry = &services.registry;

    registry
        .add_account(
            CredentialRecord::new("first@example.com", LoginMethod::Token)
                .with_tokens("valid-first-access-token-0001", ""),
        )
        .expect("first");
    let erin = registry
        .add_account(
            CredentialRecord::new("erin@example.com", LoginMethod::Oauth)
                .with_tokens("valid-erin-old-access-0000", "refresh-erin-long-token-0001"),
        )
        .expect("erin");
    assert!(erin.user_id.is_none());

    let switched = switch_with_refresh(
        registry,
        &erin.id,
        services.token_client.as_ref(),
        services.usage_client.as_ref(),
    )
    .await
    .expect("switch");
    assert!(switched.is_active);
    assert_eq!(switched.user_id.as_deref(), Some("user-from-usage"));
    assert_eq!(switched.profile_arn.as_deref(), Some(PROFILE_ARN));
    assert_eq!(switched.bearer_token.expose(), "valid-erin-refreshed-access-0002");
    assert_eq!(switched.refresh_token.expose(), "refresh-erin-rotated");

    let hits = mock.hits();
    assert_eq!(hits.refreshes, vec!["refresh-erin-long-token-0001"]);
    assert_eq!(hits.usage_tokens, vec!["valid-erin-refreshed-access-0002"]);
    drop(hits);

    // Identity is complete now, so switching back and forth stays offline.
    let again = switch_with_refresh(
        registry,
        &erin.id,
        services.token_client.as_ref(),
        services.usage_client.as_ref(),
    )
    .await
    .expect("switch again");
    assert_eq!(again.bearer_token.expose(), "valid-erin-refreshed-access-0002");
    assert_eq!(mock.hits().refreshes.len(), 1);
}
