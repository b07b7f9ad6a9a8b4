//! Usage: Map Kiro HTTP responses and transport failures onto `REMOTE_*` error codes (with redacted snippets).

use crate::shared::error::{
    AppError, CODE_REMOTE_FORBIDDEN, CODE_REMOTE_FORMAT, CODE_REMOTE_NETWORK, CODE_REMOTE_OTHER,
    CODE_REMOTE_RATE_LIMITED, CODE_REMOTE_SERVER, CODE_REMOTE_UNAUTHORIZED,
};
use crate::shared::security::mask_token;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

const SNIPPET_MAX_CHARS: usize = 500;
const DETAIL_MAX_CHARS: usize = 240;
const REASON_SUSPENDED: &str = "TEMPORARILY_SUSPENDED";

pub fn code_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => CODE_REMOTE_UNAUTHORIZED,
        StatusCode::FORBIDDEN => CODE_REMOTE_FORBIDDEN,
        StatusCode::TOO_MANY_REQUESTS => CODE_REMOTE_RATE_LIMITED,
        s if s.is_server_error() => CODE_REMOTE_SERVER,
        _ => CODE_REMOTE_OTHER,
    }
}

/// Builds the error for a non-success response. `what` names the call (e.g. `token refresh`).
pub fn status_error(what: &str, status: StatusCode, body: &str) -> AppError {
    let code = code_for_status(status);
    let (reason, detail) = parse_error_details(body);

    let mut msg = format!("{what} returned status={}", status.as_u16());
    if reason.as_deref() == Some(REASON_SUSPENDED) {
        msg.push_str(" (account temporarily suspended)");
    } else if let Some(reason) = reason {
        msg.push_str(" reason=");
        msg.push_str(&reason);
    }
    if let Some(detail) = detail {
        msg.push_str(" message=");
        msg.push_str(&detail.chars().take(DETAIL_MAX_CHARS).collect::<String>());
    } else {
        let snippet = sanitize_error_body_snippet(body);
        if !snippet.is_empty() {
            msg.push_str(" body=");
            msg.push_str(&snippet);
        }
    }
    AppError::new(code, msg)
}

pub fn transport_error(what: &str, err: reqwest::Error) -> AppError {
    let code = if err.is_decode() {
        CODE_REMOTE_FORMAT
    } else {
        CODE_REMOTE_NETWORK
    };
    // Query strings can carry the profile ARN or state.
    let err = err.without_url();
    AppError::new(code, format!("{what} request failed: {err}")).with_source(err)
}

pub fn format_error(what: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::new(CODE_REMOTE_FORMAT, format!("{what} response is malformed: {detail}"))
}

/// Reads the body of a JSON response, mapping status and parse failures.
pub async fn read_json<T: DeserializeOwned>(what: &str, response: reqwest::Response) -> Result<T, AppError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(what, e))?;
    if !status.is_success() {
        return Err(status_error(what, status, &body));
    }
    serde_json::from_str(&body).map_err(|e| format_error(what, e))
}

pub fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token")
        || key_lc.contains("secret")
        || key_lc.contains("cookie")
        || key_lc == "authorization"
}

fn redact_sensitive_json_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        Value::Array(items) => {
            for nested in items {
                redact_sensitive_json_fields(nested);
            }
        }
        _ => {}
    }
}

pub fn sanitize_error_body_snippet(body: &str) -> String {
    if let Ok(mut value) = serde_json::from_str::<Value>(body) {
        redact_sensitive_json_fields(&mut value);
        if let Ok(encoded) = serde_json::to_string(&value) {
            return encoded.chars().take(SNIPPET_MAX_CHARS).collect();
        }
    }
    body.trim().chars().take(SNIPPET_MAX_CHARS).collect()
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Extracts `(reason, message)` from a Kiro error body.
fn parse_error_details(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, None);
    };
    let reason = non_empty_str(&value, "reason").or_else(|| non_empty_str(&value, "error"));
    let message = non_empty_str(&value, "message")
        .or_else(|| non_empty_str(&value, "error_description"))
        .or_else(|| non_empty_str(&value, "Message"));
    (reason, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_remote_kinds() {
        assert_eq!(code_for_status(StatusCode::UNAUTHORIZED), "REMOTE_UNAUTHORIZED");
        assert_eq!(code_for_status(StatusCode::FORBIDDEN), "REMOTE_FORBIDDEN");
        assert_eq!(code_for_status(StatusCode::TOO_MANY_REQUESTS), "REMOTE_RATE_LIMITED");
        assert_eq!(code_for_status(StatusCode::BAD_GATEWAY), "REMOTE_SERVER_ERROR");
        assert_eq!(code_for_status(StatusCode::BAD_REQUEST), "REMOTE_ERROR");
    }

    #[test]
    fn status_error_flags_suspension_and_is_classified() {
        let err = status_error(
            "usage fetch",
            StatusCode::FORBIDDEN,
            r#"{"message":"Your account is suspended","reason":"TEMPORARILY_SUSPENDED"}"#,
        );
        assert_eq!(err.code(), "REMOTE_FORBIDDEN");
        assert!(err.message().contains("temporarily suspended"));
        assert!(!err.is_retryable());

        let err = status_error("token refresh", StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(err.is_retryable());
    }

    #[test]
    fn snippets_redact_token_fields() {
        let body = r#"{"error":"bad","refreshToken":"aorAAAAAG-super-secret-token-value"}"#;
        let snippet = sanitize_error_body_snippet(body);
        assert!(!snippet.contains("super-secret"));
        assert!(snippet.contains("aorAAA...alue"));
    }

    #[test]
    fn parse_i64_lossy_accepts_numbers_floats_and_strings() {
        assert_eq!(parse_i64_lossy(&serde_json::json!(42)), Some(42));
        assert_eq!(parse_i64_lossy(&serde_json::json!(2.6)), Some(3));
        assert_eq!(parse_i64_lossy(&serde_json::json!(" 7 ")), Some(7));
        assert_eq!(parse_i64_lossy(&serde_json::json!(null)), None);
    }
}
