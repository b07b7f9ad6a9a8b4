#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use kiro_vault::infra::api_config::ApiConfig;
use kiro_vault::AppServices;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::oneshot;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct EnvRestore {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvRestore {
    fn save_once(&mut self, key: &'static str) {
        if self.saved.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.saved.push((key, std::env::var_os(key)));
    }

    fn set_var(&mut self, key: &'static str, value: impl Into<OsString>) {
        self.save_once(key);
        std::env::set_var(key, value.into());
    }

    fn remove_var(&mut self, key: &'static str) {
        self.save_once(key);
        std::env::remove_var(key);
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Isolated data directory with the vault env vars cleared for the test's lifetime.
pub struct TestVault {
    _lock: MutexGuard<'static, ()>,
    _env: EnvRestore,
    dir: TempDir,
}

impl TestVault {
    pub fn new() -> Self {
        let lock = env_lock();
        let dir = tempfile::tempdir().expect("tempdir");

        let mut env = EnvRestore::default();
        env.remove_var("KIRO_VAULT_MASTER_KEY");
        env.set_var("KIRO_VAULT_HOME", dir.path().as_os_str().to_os_string());

        Self {
            _lock: lock,
            _env: env,
            dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn services(&self, config: ApiConfig) -> AppServices {
        AppServices::build(self.data_dir().to_path_buf(), config).expect("build services")
    }

    /// Services wired to an endpoint that is never contacted.
    pub fn offline_services(&self) -> AppServices {
        self.offline_services_at(self.data_dir())
    }

    /// Same, for a second vault directory under the same env guard.
    pub fn offline_services_at(&self, data_dir: &Path) -> AppServices {
        let mut config = ApiConfig::with_base_url("http://127.0.0.1:9");
        config.callback_port = 0;
        AppServices::build(data_dir.to_path_buf(), config).expect("build services")
    }
}

pub const PROFILE_ARN: &str = "arn:aws:codewhisperer:us-east-1:000000000000:profile/TEST";
pub const VALID_BEARER_PREFIX: &str = "valid-";

/// What the mock Kiro service saw.
#[derive(Default)]
pub struct MockHits {
    pub token_exchanges: Vec<Value>,
    pub refreshes: Vec<String>,
    pub usage_tokens: Vec<String>,
    pub portal_operations: Vec<String>,
    pub user_info_cookies: Vec<String>,
}

type SharedHits = Arc<Mutex<MockHits>>;

fn lock_hits(hits: &SharedHits) -> MutexGuard<'_, MockHits> {
    match hits.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process stand-in for the desktop auth service, usage API and web portal.
pub struct MockKiro {
    pub addr: SocketAddr,
    hits: SharedHits,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockKiro {
    pub async fn start() -> Self {
        let hits: SharedHits = Arc::default();
        let portal = "/service/KiroWebPortalService/operation";
        let app = Router::new()
            .route("/oauth/token", post(desktop_token))
            .route("/refreshToken", post(desktop_refresh))
            .route("/validateToken", get(desktop_validate))
            .route("/getUsageLimits", get(usage_limits))
            .route(&format!("{portal}/InitiateLogin"), post(portal_initiate))
            .route(&format!("{portal}/ExchangeToken"), post(portal_exchange))
            .route(&format!("{portal}/GetUserInfo"), post(portal_user_info))
            .with_state(Arc::clone(&hits));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// All endpoints on the mock, callback listener on an ephemeral port.
    pub fn config(&self) -> ApiConfig {
        let mut config = ApiConfig::with_base_url(&self.base_url());
        config.callback_port = 0;
        config.default_profile_arn = PROFILE_ARN.to_string();
        config
    }

    pub fn hits(&self) -> MutexGuard<'_, MockHits> {
        lock_hits(&self.hits)
    }
}

impl Drop for MockKiro {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// `valid-<name>-...` tokens belong to `<name>@example.com`.
fn email_for_token(token: &str) -> String {
    let name = token
        .strip_prefix(VALID_BEARER_PREFIX)
        .and_then(|rest| rest.split('-').next())
        .unwrap_or("user");
    format!("{name}@example.com")
}

async fn desktop_token(State(hits): State<SharedHits>, Json(body): Json<Value>) -> Response {
    let code = body["code"].as_str().unwrap_or_default().to_string();
    lock_hits(&hits).token_exchanges.push(body);
    if code == "bad-code" {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "invalid_grant"}))).into_response();
    }
    Json(json!({
        "accessToken": format!("{VALID_BEARER_PREFIX}{code}-access-token-0001"),
        "refreshToken": format!("refresh-{code}-0001"),
        "expiresIn": 3600,
        "profileArn": PROFILE_ARN,
    }))
    .into_response()
}

async fn desktop_refresh(State(hits): State<SharedHits>, Json(body): Json<Value>) -> Response {
    let refresh = body["refreshToken"].as_str().unwrap_or_default().to_string();
    lock_hits(&hits).refreshes.push(refresh.clone());
    if refresh.starts_with("revoked") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "token revoked"}))).into_response();
    }
    let name = refresh
        .strip_prefix("refresh-")
        .and_then(|rest| rest.split('-').next())
        .unwrap_or("user");
    Json(json!({
        "accessToken": format!("{VALID_BEARER_PREFIX}{name}-refreshed-access-0002"),
        "refreshToken": format!("refresh-{name}-rotated"),
        "expiresIn": "7200",
        "profileArn": PROFILE_ARN,
    }))
    .into_response()
}

async fn desktop_validate(headers: HeaderMap) -> StatusCode {
    match bearer(&headers) {
        Some(token) if token.starts_with(VALID_BEARER_PREFIX) => StatusCode::OK,
        _ => StatusCode::UNAUTHORIZED,
    }
}

async fn usage_limits(
    State(hits): State<SharedHits>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(token) = bearer(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !token.starts_with(VALID_BEARER_PREFIX) {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "bad token"}))).into_response();
    }
    if query.get("profileArn").map(String::as_str) != Some(PROFILE_ARN)
        || query.get("origin").map(String::as_str) != Some("AI_EDITOR")
    {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad query"}))).into_response();
    }
    lock_hits(&hits).usage_tokens.push(token.clone());
    Json(json!({
        "userInfo": {"email": email_for_token(&token), "userId": "user-from-usage"},
        "subscriptionInfo": {"subscriptionTitle": "KIRO PRO", "type": "Q_DEVELOPER_STANDALONE_PRO"},
        "usageBreakdownList": [{
            "resourceType": "CREDIT",
            "usageLimit": 1000.0,
            "currentUsage": 950.0,
            "freeTrialInfo": {"usageLimit": 500.0, "currentUsage": 20.0},
            "bonuses": [{"usageLimit": 100.0, "currentUsage": 10.4}]
        }]
    }))
    .into_response()
}

fn cbor_response(status: StatusCode, value: &Value, cookies: &[&str]) -> Response {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body).expect("encode cbor");
    let mut response = (status, Bytes::from(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/cbor"),
    );
    for cookie in cookies {
        headers.append(
            header::SET_COOKIE,
            header::HeaderValue::from_str(cookie).expect("cookie header"),
        );
    }
    response
}

fn decode_cbor(headers: &HeaderMap, body: &Bytes) -> Result<Value, Response> {
    let ok = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
        == Some("application/cbor")
        && headers.get("smithy-protocol").and_then(|v| v.to_str().ok()) == Some("rpc-v2-cbor");
    if !ok {
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response());
    }
    ciborium::from_reader(body.as_ref()).map_err(|_| StatusCode::BAD_REQUEST.into_response())
}

async fn portal_initiate(State(hits): State<SharedHits>, headers: HeaderMap, body: Bytes) -> Response {
    let req = match decode_cbor(&headers, &body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    lock_hits(&hits).portal_operations.push("InitiateLogin".to_string());
    let state = req["state"].as_str().unwrap_or_default();
    let idp = req["idp"].as_str().unwrap_or_default();
    cbor_response(
        StatusCode::OK,
        &json!({"redirectUrl": format!("https://portal.invalid/signin?idp={idp}&state={state}")}),
        &[],
    )
}

async fn portal_exchange(State(hits): State<SharedHits>, headers: HeaderMap, body: Bytes) -> Response {
    let req = match decode_cbor(&headers, &body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    lock_hits(&hits).portal_operations.push("ExchangeToken".to_string());
    if req["codeVerifier"].as_str().unwrap_or_default().is_empty() {
        return cbor_response(StatusCode::BAD_REQUEST, &json!({"message": "missing verifier"}), &[]);
    }
    let code = req["code"].as_str().unwrap_or_default();
    cbor_response(
        StatusCode::OK,
        &json!({
            "accessToken": format!("{VALID_BEARER_PREFIX}portal-{code}-access"),
            "csrfToken": "csrf-1",
            "expiresIn": 3600,
            "profileArn": PROFILE_ARN,
        }),
        &[
            "RefreshToken=portal-refresh-cookie; Path=/; HttpOnly; Secure",
            "Idp=Google; Path=/",
        ],
    )
}

async fn portal_user_info(State(hits): State<SharedHits>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(resp) = decode_cbor(&headers, &body) {
        return resp;
    }
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    lock_hits(&hits).portal_operations.push("GetUserInfo".to_string());
    lock_hits(&hits).user_info_cookies.push(cookie.clone());
    if !cookie.contains("AccessToken=") {
        return cbor_response(StatusCode::UNAUTHORIZED, &json!({"message": "no session"}), &[]);
    }
    cbor_response(
        StatusCode::OK,
        &json!({
            "email": "portal@example.com",
            "userId": "portal-user",
            "idp": "Google",
            "status": "ACTIVE",
        }),
        &[],
    )
}
