//! Usage: Remote endpoint and HTTP client configuration (defaults + env overrides).

use crate::shared::error::{AppError, AppResult};
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_AUTH_ENDPOINT: &str = "https://prod.us-east-1.auth.desktop.kiro.dev";
pub const DEFAULT_USAGE_ENDPOINT: &str = "https://codewhisperer.us-east-1.amazonaws.com";
pub const DEFAULT_WEB_PORTAL_ENDPOINT: &str = "https://app.kiro.dev";
pub const DEFAULT_PROFILE_ARN: &str =
    "arn:aws:codewhisperer:us-east-1:699475941385:profile/EHGA3GRVQMUK";
pub const DEFAULT_CALLBACK_PORT: u16 = 34115;
pub const CALLBACK_PATH: &str = "/oauth/callback";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_HTTP_TIMEOUT_SECS: u64 = 10 * 60;

const ENV_AUTH_ENDPOINT: &str = "KIRO_AUTH_ENDPOINT";
const ENV_USAGE_ENDPOINT: &str = "KIRO_USAGE_ENDPOINT";
const ENV_WEB_PORTAL_ENDPOINT: &str = "KIRO_WEB_PORTAL_ENDPOINT";
const ENV_CALLBACK_PORT: &str = "KIRO_OAUTH_CALLBACK_PORT";
const ENV_HTTP_TIMEOUT_SECS: &str = "KIRO_HTTP_TIMEOUT_SECS";

/// Thresholds for inferring a subscription tier from quota size when the provider is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub pro_plus_min_total: i64,
    pub pro_min_total: i64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            pro_plus_min_total: 100_000,
            pro_min_total: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub auth_endpoint: String,
    pub usage_endpoint: String,
    pub web_portal_endpoint: String,
    pub default_profile_arn: String,
    pub callback_port: u16,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub tier_policy: TierPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            auth_endpoint: DEFAULT_AUTH_ENDPOINT.to_string(),
            usage_endpoint: DEFAULT_USAGE_ENDPOINT.to_string(),
            web_portal_endpoint: DEFAULT_WEB_PORTAL_ENDPOINT.to_string(),
            default_profile_arn: DEFAULT_PROFILE_ARN.to_string(),
            callback_port: DEFAULT_CALLBACK_PORT,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: format!("kiro-vault/{}", env!("CARGO_PKG_VERSION")),
            tier_policy: TierPolicy::default(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn trim_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

impl ApiConfig {
    pub fn from_env() -> AppResult<Self> {
        let mut config = Self::default();
        if let Some(v) = env_value(ENV_AUTH_ENDPOINT) {
            config.auth_endpoint = trim_base_url(&v);
        }
        if let Some(v) = env_value(ENV_USAGE_ENDPOINT) {
            config.usage_endpoint = trim_base_url(&v);
        }
        if let Some(v) = env_value(ENV_WEB_PORTAL_ENDPOINT) {
            config.web_portal_endpoint = trim_base_url(&v);
        }
        if let Some(v) = env_value(ENV_CALLBACK_PORT) {
            config.callback_port = v.parse::<u16>().map_err(|_| {
                AppError::invalid_input(format!("{ENV_CALLBACK_PORT} must be a port number"))
            })?;
        }
        if let Some(v) = env_value(ENV_HTTP_TIMEOUT_SECS) {
            let secs = v.parse::<u64>().map_err(|_| {
                AppError::invalid_input(format!("{ENV_HTTP_TIMEOUT_SECS} must be an integer"))
            })?;
            config.http_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    /// Same defaults with every endpoint pointed at one base URL (local mock servers).
    pub fn with_base_url(base_url: &str) -> Self {
        let base = trim_base_url(base_url);
        Self {
            auth_endpoint: base.clone(),
            usage_endpoint: base.clone(),
            web_portal_endpoint: base,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("auth endpoint", &self.auth_endpoint),
            ("usage endpoint", &self.usage_endpoint),
            ("web portal endpoint", &self.web_portal_endpoint),
        ] {
            let url = Url::parse(value)
                .map_err(|e| AppError::invalid_input(format!("{name} is not a valid url: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AppError::invalid_input(format!(
                    "{name} must use http or https"
                )));
            }
        }
        if self.http_timeout.is_zero() || self.http_timeout.as_secs() > MAX_HTTP_TIMEOUT_SECS {
            return Err(AppError::invalid_input(format!(
                "http timeout must be within 1..={MAX_HTTP_TIMEOUT_SECS} seconds"
            )));
        }
        Ok(())
    }

    pub fn redirect_uri(&self, port: u16) -> String {
        format!("http://localhost:{port}{CALLBACK_PATH}")
    }

    pub fn build_http_client(&self) -> AppResult<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.http_timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| AppError::new("SYSTEM_ERROR", format!("failed to build http client: {e}")))
    }
}
