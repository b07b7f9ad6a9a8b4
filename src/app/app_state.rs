//! Usage: Service container built once per process; every consumer gets `Arc` handles from here.

use crate::domain::integration::{NoopIntegration, SystemIntegration};
use crate::domain::registry::CredentialRegistry;
use crate::gateway::oauth::backend::TokenBackend;
use crate::gateway::oauth::callback_server::{CallbackServer, CompletionHandler};
use crate::gateway::oauth::coordinator::OAuthCoordinator;
use crate::gateway::oauth::desktop::DesktopBackend;
use crate::gateway::oauth::web_portal::WebPortalBackend;
use crate::gateway::quota_cache::QuotaCache;
use crate::gateway::quota_monitor::QuotaMonitor;
use crate::gateway::token_client::TokenClient;
use crate::gateway::usage::UsageClient;
use crate::infra::api_config::ApiConfig;
use crate::infra::app_paths::{ensure_dir, VaultPaths};
use crate::infra::crypto::CryptoService;
use crate::infra::master_key::load_or_create_master_key;
use crate::infra::store::EncryptedStore;
use crate::shared::error::AppResult;
use std::path::PathBuf;
use std::sync::Arc;

pub struct AppServices {
    pub paths: VaultPaths,
    pub config: Arc<ApiConfig>,
    pub store: Arc<EncryptedStore>,
    pub registry: Arc<CredentialRegistry>,
    pub token_client: Arc<TokenClient>,
    pub usage_client: Arc<UsageClient>,
    pub quota_cache: Arc<QuotaCache>,
    pub monitor: Arc<QuotaMonitor>,
    pub coordinator: Arc<OAuthCoordinator>,
    pub callback_server: Arc<CallbackServer>,
}

impl AppServices {
    pub fn build(data_dir: PathBuf, config: ApiConfig) -> AppResult<Self> {
        Self::build_with_integration(data_dir, config, Arc::new(NoopIntegration))
    }

    pub fn build_with_integration(
        data_dir: PathBuf,
        config: ApiConfig,
        integration: Arc<dyn SystemIntegration>,
    ) -> AppResult<Self> {
        config.validate()?;
        let paths = VaultPaths::new(data_dir);
        ensure_dir(&paths.data_dir)?;

        let master_key = load_or_create_master_key(&paths.master_key_file())?;
        let crypto = Arc::new(CryptoService::new(master_key.as_str())?);
        let store = Arc::new(EncryptedStore::new(paths.clone(), crypto)?);
        let registry = Arc::new(CredentialRegistry::open(store.clone(), integration)?);

        let config = Arc::new(config);
        let http = config.build_http_client()?;
        let usage_client = Arc::new(UsageClient::new(http.clone(), Arc::clone(&config)));
        let token_client = Arc::new(TokenClient::new(http.clone(), Arc::clone(&config)));
        let quota_cache = Arc::new(QuotaCache::new(usage_client.clone()));
        let monitor = Arc::new(QuotaMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&quota_cache),
        ));

        let backends: Vec<Arc<dyn TokenBackend>> = vec![
            Arc::new(DesktopBackend::new(http.clone(), Arc::clone(&config))),
            Arc::new(WebPortalBackend::new(http, Arc::clone(&config))),
        ];
        let coordinator = Arc::new(OAuthCoordinator::new(
            Arc::clone(&config),
            backends,
            usage_client.clone(),
        ));

        let registry_for_login = Arc::clone(&registry);
        let on_complete: CompletionHandler =
            Arc::new(move |record| registry_for_login.add_account(record));
        let callback_server = Arc::new(CallbackServer::new(
            Arc::clone(&coordinator),
            on_complete,
            config.callback_port,
        ));

        tracing::debug!(data_dir = %paths.data_dir.display(), "services ready");
        Ok(Self {
            paths,
            config,
            store,
            registry,
            token_client,
            usage_client,
            quota_cache,
            monitor,
            coordinator,
            callback_server,
        })
    }

    /// Stops background tasks; safe to call when nothing is running.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.callback_server.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::accounts::{CredentialRecord, LoginMethod};

    #[tokio::test]
    async fn build_creates_key_and_reopens_same_vault() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ApiConfig::with_base_url("http://127.0.0.1:9");

        let services = AppServices::build(dir.path().to_path_buf(), config.clone()).expect("build");
        assert!(services.paths.master_key_file().exists() || std::env::var("KIRO_VAULT_MASTER_KEY").is_ok());
        services
            .registry
            .add_account(CredentialRecord::new("a@example.com", LoginMethod::Token))
            .expect("add");
        services.shutdown().await;
        drop(services);

        let reopened = AppServices::build(dir.path().to_path_buf(), config).expect("reopen");
        assert_eq!(reopened.registry.account_count(), 1);
        assert!(reopened.registry.get_active_account().is_some());
    }
}
