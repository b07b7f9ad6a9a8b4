//! Usage: Long-lived loopback listener (`GET /oauth/callback`) that finishes browser logins.
//!
//! Each callback resolves its pending login through the `OAuthCoordinator`, hands the new record
//! to the completion handler (registry insert) and publishes a `LoginOutcome`.

use crate::domain::accounts::CredentialRecord;
use crate::gateway::oauth::coordinator::OAuthCoordinator;
use crate::infra::api_config::CALLBACK_PATH;
use crate::shared::blocking;
use crate::shared::error::{AppError, AppResult, ErrorKind};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

const OUTCOME_CHANNEL_CAPACITY: usize = 16;

pub type CompletionHandler =
    Arc<dyn Fn(CredentialRecord) -> AppResult<CredentialRecord> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub state: String,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub error: Option<String>,
}

impl LoginOutcome {
    fn failed(state: &str, error: impl Into<String>) -> Self {
        Self {
            state: state.to_string(),
            account_id: None,
            email: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    #[serde(rename = "fullUrl")]
    full_url: Option<String>,
}

impl CallbackQuery {
    /// Some portals forward the whole redirect URL in `fullUrl`; its query wins when it parses.
    fn resolve(self) -> Self {
        let Some(full_url) = self.full_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return self;
        };
        let Ok(url) = Url::parse(full_url.trim()) else {
            tracing::debug!("ignoring unparsable fullUrl in login callback");
            return self;
        };
        let mut nested = CallbackQuery::default();
        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "state" => nested.state = value,
                "code" => nested.code = value,
                "error" => nested.error = value,
                "error_description" => nested.error_description = value,
                _ => {}
            }
        }
        if nested.state.is_none() {
            return self;
        }
        nested
    }
}

struct ServerState {
    coordinator: Arc<OAuthCoordinator>,
    on_complete: CompletionHandler,
    outcomes: broadcast::Sender<LoginOutcome>,
}

struct RunningServer {
    port: u16,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct CallbackServer {
    state: Arc<ServerState>,
    bind_port: u16,
    running: Mutex<Option<RunningServer>>,
}

impl CallbackServer {
    /// `bind_port` 0 picks a free port; the bound port is pushed to the coordinator on start.
    pub fn new(
        coordinator: Arc<OAuthCoordinator>,
        on_complete: CompletionHandler,
        bind_port: u16,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(ServerState {
                coordinator,
                on_complete,
                outcomes,
            }),
            bind_port,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoginOutcome> {
        self.state.outcomes.subscribe()
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }

    /// Binds and serves. Calling it while running returns the existing port.
    pub async fn start(&self) -> AppResult<u16> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref().filter(|r| !r.handle.is_finished()) {
            return Ok(r.port);
        }

        let listener = TcpListener::bind(("127.0.0.1", self.bind_port))
            .await
            .map_err(|e| {
                AppError::new(
                    "SYSTEM_ERROR",
                    format!("login callback bind on 127.0.0.1:{} failed: {e}", self.bind_port),
                )
                .with_source(e)
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::new("SYSTEM_ERROR", format!("login callback local_addr failed: {e}")))?
            .port();
        self.state.coordinator.set_callback_port(port);

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(Arc::clone(&self.state));
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(port, "login callback server error: {err}");
            }
        });

        tracing::info!(port, "login callback server listening");
        *running = Some(RunningServer {
            port,
            shutdown,
            handle,
        });
        Ok(port)
    }

    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        let _ = running.shutdown.send(());
        if let Err(err) = running.handle.await {
            tracing::warn!("login callback server task ended abnormally: {err}");
        }
        tracing::info!(port = running.port, "login callback server stopped");
        true
    }
}

async fn handle_callback(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, Html<String>) {
    let query = query.resolve();
    let Some(login_state) = query.state.filter(|s| !s.trim().is_empty()) else {
        return failure_page(StatusCode::BAD_REQUEST, "The callback is missing its state parameter.");
    };

    if let Some(error) = query.error.filter(|e| !e.is_empty()) {
        state.coordinator.fail_flow(&login_state);
        let detail = match query.error_description.filter(|d| !d.is_empty()) {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        tracing::warn!("provider rejected login: {detail}");
        let _ = state
            .outcomes
            .send(LoginOutcome::failed(&login_state, detail.clone()));
        return failure_page(StatusCode::BAD_REQUEST, &detail);
    }

    let code = query.code.unwrap_or_default();
    let result = match state.coordinator.complete_flow(&login_state, &code).await {
        Ok(record) => {
            let on_complete = Arc::clone(&state.on_complete);
            blocking::run("oauth_callback.store_account", move || on_complete(record)).await
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(stored) => {
            let _ = state.outcomes.send(LoginOutcome {
                state: login_state,
                account_id: Some(stored.id.clone()),
                email: Some(stored.email.clone()),
                error: None,
            });
            success_page(&stored.email)
        }
        Err(err) => {
            tracing::warn!(code = err.code(), "login callback failed: {err}");
            let _ = state
                .outcomes
                .send(LoginOutcome::failed(&login_state, err.to_string()));
            let status = match err.kind() {
                ErrorKind::Validation | ErrorKind::NotFound => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Remote => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            failure_page(status, err.message())
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{body}</p><p>You may close this window.</p></body></html>"
    )
}

fn success_page(email: &str) -> (StatusCode, Html<String>) {
    let body = format!("Signed in as {}.", escape_html(email));
    (StatusCode::OK, Html(page("Login successful", &body)))
}

fn failure_page(status: StatusCode, detail: &str) -> (StatusCode, Html<String>) {
    (status, Html(page("Login failed", &escape_html(detail))))
}
