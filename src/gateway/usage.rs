//! Usage: Kiro `getUsageLimits` client and the mapping from its payload to quota buckets / subscription tier.

use crate::domain::accounts::{QuotaDetail, QuotaInfo, SubscriptionType};
use crate::gateway::http_errors::{read_json, transport_error};
use crate::gateway::retry::{retry_with_backoff, RetryPolicy};
use crate::infra::api_config::{ApiConfig, TierPolicy};
use crate::shared::error::AppResult;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const USAGE_ORIGIN: &str = "AI_EDITOR";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUserInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub subscription_title: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAmount {
    #[serde(default)]
    pub usage_limit: f64,
    #[serde(default)]
    pub current_usage: f64,
}

impl UsageAmount {
    fn to_detail(self) -> QuotaDetail {
        QuotaDetail::new(
            self.current_usage.round() as i64,
            self.usage_limit.round() as i64,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub usage_limit: f64,
    #[serde(default)]
    pub current_usage: f64,
    #[serde(default)]
    pub free_trial_info: Option<UsageAmount>,
    #[serde(default)]
    pub bonuses: Vec<UsageAmount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitsResponse {
    #[serde(default)]
    pub user_info: Option<UsageUserInfo>,
    #[serde(default)]
    pub subscription_info: Option<SubscriptionInfo>,
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
}

/// Quota and identity learned from one usage call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub quota: QuotaInfo,
    pub subscription: SubscriptionType,
    pub email: Option<String>,
    pub user_id: Option<String>,
}

fn primary_breakdown(list: &[UsageBreakdown]) -> Option<&UsageBreakdown> {
    list.iter()
        .find(|b| {
            let kind = b.resource_type.to_ascii_uppercase();
            kind.contains("CHAT") || kind.contains("CREDIT")
        })
        .or_else(|| list.first())
}

pub fn map_quota(response: &UsageLimitsResponse) -> QuotaInfo {
    let Some(primary) = primary_breakdown(&response.usage_breakdown_list) else {
        return QuotaInfo::default();
    };

    let main = UsageAmount {
        usage_limit: primary.usage_limit,
        current_usage: primary.current_usage,
    }
    .to_detail();
    let trial = primary
        .free_trial_info
        .map(UsageAmount::to_detail)
        .unwrap_or_default();
    let reward = primary.bonuses.iter().fold(UsageAmount::default(), |acc, b| UsageAmount {
        usage_limit: acc.usage_limit + b.usage_limit,
        current_usage: acc.current_usage + b.current_usage,
    });

    QuotaInfo {
        main,
        trial,
        reward: reward.to_detail(),
    }
}

fn explicit_tier(raw: &str) -> Option<SubscriptionType> {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return None;
    }
    if upper.contains("PRO_PLUS") || upper.contains("PRO+") || upper.contains("PRO PLUS") {
        return Some(SubscriptionType::ProPlus);
    }
    if upper.contains("PRO") {
        return Some(SubscriptionType::Pro);
    }
    if upper.contains("FREE") {
        return Some(SubscriptionType::Free);
    }
    None
}

/// Provider-stated tier wins; otherwise the quota size decides.
pub fn map_subscription(response: &UsageLimitsResponse, quota: &QuotaInfo, policy: &TierPolicy) -> SubscriptionType {
    let stated = response.subscription_info.as_ref().and_then(|info| {
        info.kind
            .as_deref()
            .and_then(explicit_tier)
            .or_else(|| info.subscription_title.as_deref().and_then(explicit_tier))
    });
    if let Some(tier) = stated {
        return tier;
    }

    let total = quota.main.total;
    if total > policy.pro_plus_min_total {
        SubscriptionType::ProPlus
    } else if total > policy.pro_min_total {
        SubscriptionType::Pro
    } else {
        SubscriptionType::Free
    }
}

pub fn map_usage(response: &UsageLimitsResponse, policy: &TierPolicy) -> UsageSnapshot {
    let quota = map_quota(response);
    let subscription = map_subscription(response, &quota, policy);
    let user = response.user_info.clone().unwrap_or_default();
    let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    UsageSnapshot {
        quota,
        subscription,
        email: clean(user.email),
        user_id: clean(user.user_id),
    }
}

pub type UsageFuture<'a> = Pin<Box<dyn Future<Output = AppResult<UsageSnapshot>> + Send + 'a>>;

/// Source of usage data for the quota cache, monitor and login flows.
///
/// `profile_arn` is the account's own profile; `None` falls back to the configured default.
pub trait UsageFetcher: Send + Sync {
    fn fetch_usage<'a>(&'a self, bearer_token: &'a str, profile_arn: Option<&'a str>) -> UsageFuture<'a>;
}

#[derive(Clone)]
pub struct UsageClient {
    client: reqwest::Client,
    config: Arc<ApiConfig>,
    retry: RetryPolicy,
}

impl UsageClient {
    pub fn new(client: reqwest::Client, config: Arc<ApiConfig>) -> Self {
        Self {
            client,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn fetch_raw(&self, bearer_token: &str, profile_arn: Option<&str>) -> AppResult<UsageLimitsResponse> {
        let url = format!("{}/getUsageLimits", self.config.usage_endpoint);
        let profile_arn = profile_arn
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.config.default_profile_arn.as_str());

        let response = self
            .client
            .get(&url)
            .query(&[
                ("isEmailRequired", "true"),
                ("origin", USAGE_ORIGIN),
                ("profileArn", profile_arn),
            ])
            .bearer_auth(bearer_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error("usage fetch", e))?;
        read_json("usage fetch", response).await
    }

    pub async fn fetch_snapshot(&self, bearer_token: &str, profile_arn: Option<&str>) -> AppResult<UsageSnapshot> {
        let raw = retry_with_backoff("usage fetch", self.retry, || {
            self.fetch_raw(bearer_token, profile_arn)
        })
        .await?;
        Ok(map_usage(&raw, &self.config.tier_policy))
    }
}

impl UsageFetcher for UsageClient {
    fn fetch_usage<'a>(&'a self, bearer_token: &'a str, profile_arn: Option<&'a str>) -> UsageFuture<'a> {
        Box::pin(self.fetch_snapshot(bearer_token, profile_arn))
    }
}
