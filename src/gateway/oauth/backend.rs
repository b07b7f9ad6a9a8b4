//! Usage: `TokenBackend` trait - the seam between the login coordinator and a Kiro token service.
//!
//! Two implementations exist: the desktop auth service (JSON) and the web portal (Smithy RPCv2 CBOR).

use crate::domain::accounts::OAuthProvider;
use crate::shared::error::AppResult;
use crate::shared::security::SecretToken;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Desktop,
    WebPortal,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::WebPortal => "web_portal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "desktop" => Some(Self::Desktop),
            "web_portal" | "web" | "portal" => Some(Self::WebPortal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub provider: OAuthProvider,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub provider: OAuthProvider,
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub state: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangedTokens {
    pub access_token: SecretToken,
    pub refresh_token: SecretToken,
    pub csrf_token: Option<SecretToken>,
    pub expires_in: i64,
    pub profile_arn: Option<String>,
    /// Identity provider echoed back by the service (web portal `Idp` cookie).
    pub idp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendProfile {
    pub email: Option<String>,
    pub user_id: Option<String>,
}

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'a>>;

pub trait TokenBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// URL the user's browser should open.
    fn authorize_url<'a>(&'a self, req: &'a AuthorizeRequest) -> BackendFuture<'a, String>;

    fn exchange_code<'a>(&'a self, req: &'a ExchangeRequest) -> BackendFuture<'a, ExchangedTokens>;

    /// Identity details the backend can supply beyond the usage endpoint. Default: none.
    fn fetch_profile<'a>(&'a self, _tokens: &'a ExchangedTokens) -> BackendFuture<'a, BackendProfile> {
        Box::pin(async { Ok(BackendProfile::default()) })
    }
}
