//! Usage: Background quota refresher that writes results back to the registry and broadcasts low-quota alerts.

use crate::domain::registry::{CredentialRegistry, QuotaAlert};
use crate::gateway::quota_cache::QuotaCache;
use crate::shared::blocking;
use crate::shared::error::AppResult;
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::now_utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

const ALERT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub alerts: Vec<QuotaAlert>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct QuotaMonitor {
    registry: Arc<CredentialRegistry>,
    cache: Arc<QuotaCache>,
    alerts: broadcast::Sender<Vec<QuotaAlert>>,
    running: Mutex<Option<Running>>,
}

impl QuotaMonitor {
    pub fn new(registry: Arc<CredentialRegistry>, cache: Arc<QuotaCache>) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            registry,
            cache,
            alerts,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<QuotaAlert>> {
        self.alerts.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock_or_recover()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// One pass over every account. Never holds the registry lock across a network call.
    pub async fn run_once(&self) -> AppResult<MonitorReport> {
        let accounts = self.registry.list_accounts();
        let now = now_utc();
        let mut report = MonitorReport::default();

        for account in accounts {
            if account.bearer_token.is_empty() || account.is_token_expired(now) {
                tracing::debug!(account_id = %account.id, "skipping quota refresh (no valid token)");
                report.skipped += 1;
                continue;
            }

            let snapshot = match self
                .cache
                .refresh_quota(
                    &account.id,
                    account.bearer_token.expose(),
                    account.profile_arn.as_deref(),
                )
                .await
            {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(account_id = %account.id, "quota refresh failed: {err}");
                    report.failed += 1;
                    continue;
                }
            };

            let registry = Arc::clone(&self.registry);
            let id = account.id.clone();
            let write_back = blocking::run("quota_monitor.apply_quota", move || {
                registry.apply_quota(&id, snapshot.quota, Some(snapshot.subscription))
            })
            .await;
            match write_back {
                Ok(_) => report.refreshed += 1,
                Err(err) => {
                    tracing::warn!(account_id = %account.id, "quota write-back failed: {err}");
                    report.failed += 1;
                }
            }
        }

        let threshold = self.registry.settings().quota_alert_threshold;
        report.alerts = self.registry.quota_alerts(threshold);
        if !report.alerts.is_empty() {
            tracing::info!(alerts = report.alerts.len(), "low quota detected");
            // No subscribers is not an error.
            let _ = self.alerts.send(report.alerts.clone());
        }
        Ok(report)
    }

    /// Starts the periodic loop. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut running = self.running.lock_or_recover();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let interval = interval.max(Duration::from_secs(1));
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match monitor.run_once().await {
                            Ok(report) => tracing::debug!(
                                refreshed = report.refreshed,
                                skipped = report.skipped,
                                failed = report.failed,
                                "quota monitor pass finished"
                            ),
                            Err(err) => tracing::warn!("quota monitor pass failed: {err}"),
                        }
                    }
                }
            }
            tracing::info!("quota monitor stopped");
        });

        tracing::info!(interval_secs = interval.as_secs(), "quota monitor started");
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Starts with the interval from the current settings. Returns `false` without starting
    /// when `autoRefreshQuota` is off.
    pub fn start_from_settings(self: &Arc<Self>) -> bool {
        let settings = self.registry.settings();
        if !settings.auto_refresh_quota {
            tracing::info!("automatic quota refresh is disabled");
            return false;
        }
        self.start(Duration::from_secs(u64::from(settings.quota_refresh_interval)))
    }

    /// Signals the loop and waits for it to exit. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock_or_recover().take() else {
            return false;
        };
        let _ = running.shutdown.send(());
        if let Err(err) = running.handle.await {
            tracing::warn!("quota monitor task ended abnormally: {err}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::accounts::{CredentialRecord, LoginMethod, QuotaBucket, QuotaDetail};
    use crate::domain::integration::NoopIntegration;
    use crate::gateway::usage::{UsageFetcher, UsageFuture, UsageSnapshot};
    use crate::infra::settings::VaultSettings;
    use crate::test_support::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedFetcher {
        calls: AtomicUsize,
        profiles: Mutex<Vec<Option<String>>>,
    }

    impl UsageFetcher for FixedFetcher {
        fn fetch_usage<'a>(&'a self, _bearer_token: &'a str, profile_arn: Option<&'a str>) -> UsageFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.profiles
                    .lock_or_recover()
                    .push(profile_arn.map(str::to_string));
                let mut snapshot = UsageSnapshot::default();
                snapshot.quota.main = QuotaDetail::new(95, 100);
                Ok(snapshot)
            })
        }
    }

    fn setup() -> (Arc<CredentialRegistry>, Arc<FixedFetcher>, Arc<QuotaMonitor>) {
        let registry = Arc::new(
            CredentialRegistry::open(Arc::new(MemoryStore::default()), Arc::new(NoopIntegration))
                .expect("open"),
        );
        let fetcher = Arc::new(FixedFetcher {
            calls: AtomicUsize::new(0),
            profiles: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(QuotaCache::new(fetcher.clone()));
        let monitor = Arc::new(QuotaMonitor::new(Arc::clone(&registry), cache));
        (registry, fetcher, monitor)
    }

    #[tokio::test]
    async fn run_once_updates_quota_skips_tokenless_and_alerts() {
        let (registry, fetcher, monitor) = setup();
        let with_token = registry
            .add_account(
                CredentialRecord::new("a@example.com", LoginMethod::Oauth)
                    .with_tokens("bearer-token-value-a", "refresh-a"),
            )
            .expect("a");
        let mut expired = CredentialRecord::new("b@example.com", LoginMethod::Oauth)
            .with_tokens("bearer-token-value-b", "refresh-b");
        expired.token_expiry = Some(now_utc() - chrono::Duration::minutes(1));
        registry.add_account(expired).expect("b");
        registry
            .add_account(CredentialRecord::new("c@example.com", LoginMethod::Token))
            .expect("c");

        let mut alerts_rx = monitor.subscribe();
        let report = monitor.run_once().await.expect("run");

        assert_eq!(report.refreshed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.get_account(&with_token.id).expect("a").quota.main,
            QuotaDetail::new(95, 100)
        );

        let alerts = alerts_rx.try_recv().expect("alert published");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].bucket, QuotaBucket::Main);
    }

    #[tokio::test]
    async fn run_once_queries_usage_with_the_account_profile() {
        let (registry, fetcher, monitor) = setup();
        let mut scoped = CredentialRecord::new("a@example.com", LoginMethod::Oauth)
            .with_tokens("bearer-token-value-a", "refresh-a");
        scoped.profile_arn = Some("arn:aws:codewhisperer:us-east-1:1:profile/A".to_string());
        registry.add_account(scoped).expect("a");
        registry
            .add_account(
                CredentialRecord::new("b@example.com", LoginMethod::Oauth)
                    .with_tokens("bearer-token-value-b", "refresh-b"),
            )
            .expect("b");

        monitor.run_once().await.expect("run");

        let mut seen = fetcher.profiles.lock_or_recover().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                None,
                Some("arn:aws:codewhisperer:us-east-1:1:profile/A".to_string())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_from_settings_honours_auto_refresh_switch() {
        let (registry, _fetcher, monitor) = setup();
        registry
            .update_settings(VaultSettings {
                auto_refresh_quota: false,
                ..registry.settings()
            })
            .expect("disable");
        assert!(!monitor.start_from_settings());
        assert!(!monitor.is_running());

        registry
            .update_settings(VaultSettings {
                auto_refresh_quota: true,
                ..registry.settings()
            })
            .expect("enable");
        assert!(monitor.start_from_settings());
        assert!(monitor.is_running());
        assert!(monitor.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let (registry, fetcher, monitor) = setup();
        registry
            .add_account(
                CredentialRecord::new("a@example.com", LoginMethod::Oauth)
                    .with_tokens("bearer-token-value-a", "refresh-a"),
            )
            .expect("a");

        assert!(monitor.start(Duration::from_secs(300)));
        assert!(!monitor.start(Duration::from_secs(300)));
        assert!(monitor.is_running());

        // Let the immediate first tick run.
        for _ in 0..50 {
            if fetcher.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 1);

        assert!(monitor.stop().await);
        assert!(!monitor.stop().await);
        assert!(!monitor.is_running());
    }
}
