//! Usage: Credential record model (accounts, quota buckets, tags, registry snapshot).

use crate::infra::settings::VaultSettings;
use crate::shared::security::SecretToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: &str = "1.0";
pub const ACCOUNT_ID_PREFIX: &str = "kiro-";
pub const DEFAULT_TAG_COLOR: &str = "#3b82f6";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    #[default]
    Oauth,
    Token,
    Password,
}

impl LoginMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oauth => "oauth",
            Self::Token => "token",
            Self::Password => "password",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OAuthProvider {
    #[default]
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "github")]
    Github,
    #[serde(rename = "builderid")]
    BuilderId,
}

impl OAuthProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Github => "github",
            Self::BuilderId => "builderid",
        }
    }

    /// Identity provider name expected by the Kiro login endpoints.
    pub fn idp_name(self) -> &'static str {
        match self {
            Self::Google => "Google",
            Self::Github => "Github",
            Self::BuilderId => "BuilderId",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "google" => Some(Self::Google),
            "github" => Some(Self::Github),
            "builderid" | "builder_id" | "awsbuilderid" => Some(Self::BuilderId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    #[default]
    Free,
    Pro,
    ProPlus,
}

impl SubscriptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::ProPlus => "pro_plus",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaDetail {
    pub used: i64,
    pub total: i64,
}

impl QuotaDetail {
    pub fn new(used: i64, total: i64) -> Self {
        Self { used, total }
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }

    /// A bucket with no allowance is never reported as low.
    pub fn is_low(&self, threshold: f64) -> bool {
        self.total > 0 && self.usage_percentage() >= threshold
    }

    pub fn remaining(&self) -> i64 {
        (self.total - self.used).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBucket {
    Main,
    Trial,
    Reward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaInfo {
    pub main: QuotaDetail,
    pub trial: QuotaDetail,
    pub reward: QuotaDetail,
}

impl QuotaInfo {
    pub fn buckets(&self) -> [(QuotaBucket, QuotaDetail); 3] {
        [
            (QuotaBucket::Main, self.main),
            (QuotaBucket::Trial, self.trial),
            (QuotaBucket::Reward, self.reward),
        ]
    }

    pub fn total_used(&self) -> i64 {
        self.main.used + self.trial.used + self.reward.used
    }

    pub fn total_limit(&self) -> i64 {
        self.main.total + self.trial.total + self.reward.total
    }

    pub fn low_buckets(&self, threshold: f64) -> Vec<QuotaBucket> {
        self.buckets()
            .into_iter()
            .filter(|(_, detail)| detail.is_low(threshold))
            .map(|(bucket, _)| bucket)
            .collect()
    }
}

/// One managed account. Tokens never appear in this type's JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    #[serde(default)]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(skip)]
    pub bearer_token: SecretToken,
    #[serde(skip)]
    pub refresh_token: SecretToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub login_method: LoginMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<OAuthProvider>,
    #[serde(default)]
    pub subscription_type: SubscriptionType,
    #[serde(default)]
    pub quota: QuotaInfo,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

impl CredentialRecord {
    pub fn new(email: impl Into<String>, login_method: LoginMethod) -> Self {
        let now = crate::shared::time::now_utc();
        Self {
            id: String::new(),
            email: email.into(),
            display_name: String::new(),
            avatar: String::new(),
            bearer_token: SecretToken::default(),
            refresh_token: SecretToken::default(),
            token_expiry: None,
            login_method,
            provider: None,
            subscription_type: SubscriptionType::Free,
            quota: QuotaInfo::default(),
            tags: Vec::new(),
            notes: String::new(),
            is_active: false,
            last_used: now,
            created_at: now,
            machine_id: None,
            sqm_id: None,
            dev_device_id: None,
            user_id: None,
            profile_arn: None,
        }
    }

    pub fn with_tokens(mut self, bearer: impl Into<String>, refresh: impl Into<String>) -> Self {
        self.bearer_token = SecretToken::new(bearer);
        self.refresh_token = SecretToken::new(refresh);
        self
    }

    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expiry.is_some_and(|expiry| expiry <= now)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Appends tags not already present, returning how many were added.
    pub fn add_tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) -> usize {
        let mut added = 0;
        for tag in tags {
            let tag = tag.trim();
            if tag.is_empty() || self.has_tag(tag) {
                continue;
            }
            self.tags.push(tag.to_string());
            added += 1;
        }
        added
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        before != self.tags.len()
    }
}

pub fn generate_account_id() -> String {
    format!("{ACCOUNT_ID_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub name: String,
    #[serde(default = "default_tag_color")]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_tag_color() -> String {
    DEFAULT_TAG_COLOR.to_string()
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: default_tag_color(),
            description: None,
        }
    }
}

/// Full persisted registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub version: String,
    #[serde(default)]
    pub accounts: Vec<CredentialRecord>,
    #[serde(default)]
    pub active_account_id: Option<String>,
    #[serde(default)]
    pub settings: VaultSettings,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub last_updated: DateTime<Utc>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            accounts: Vec::new(),
            active_account_id: None,
            settings: VaultSettings::default(),
            tags: Vec::new(),
            last_updated: DateTime::<Utc>::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    pub id: String,
    pub error: String,
}

/// Aggregate outcome of a batch operation: partial success stays distinguishable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success_count: usize,
    pub total_count: usize,
    pub errors: Vec<BatchError>,
}

impl BatchResult {
    pub fn new(total_count: usize) -> Self {
        Self {
            success_count: 0,
            total_count,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, id: impl Into<String>, error: impl ToString) {
        self.errors.push(BatchError {
            id: id.into(),
            error: error.to_string(),
        });
    }

    pub fn is_complete_success(&self) -> bool {
        self.success_count == self.total_count && self.errors.is_empty()
    }
}
