//! Usage: Unified vault error model (maps internal failures to `CODE: message` strings).

use std::sync::Arc;

pub type AppResult<T> = Result<T, AppError>;

pub const CODE_INVALID_INPUT: &str = "SEC_INVALID_INPUT";
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_CONFLICT: &str = "CONFLICT";
pub const CODE_PERSISTENCE: &str = "PERSISTENCE_ERROR";
pub const CODE_DECRYPTION: &str = "DECRYPTION_FAILED";
pub const CODE_REMOTE_UNAUTHORIZED: &str = "REMOTE_UNAUTHORIZED";
pub const CODE_REMOTE_FORBIDDEN: &str = "REMOTE_FORBIDDEN";
pub const CODE_REMOTE_RATE_LIMITED: &str = "REMOTE_RATE_LIMITED";
pub const CODE_REMOTE_SERVER: &str = "REMOTE_SERVER_ERROR";
pub const CODE_REMOTE_NETWORK: &str = "REMOTE_NETWORK";
pub const CODE_REMOTE_FORMAT: &str = "REMOTE_FORMAT";
pub const CODE_REMOTE_OTHER: &str = "REMOTE_ERROR";

/// Coarse classification of an [`AppError`] code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Persistence,
    Decryption,
    Remote,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    code: String,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code.as_str() {
            CODE_INVALID_INPUT => ErrorKind::Validation,
            CODE_NOT_FOUND => ErrorKind::NotFound,
            CODE_CONFLICT => ErrorKind::Conflict,
            CODE_PERSISTENCE => ErrorKind::Persistence,
            CODE_DECRYPTION => ErrorKind::Decryption,
            code if code.starts_with("REMOTE_") => ErrorKind::Remote,
            _ => ErrorKind::Internal,
        }
    }

    /// Transient remote failures worth another attempt. Auth and payload-shape errors are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code.as_str(),
            CODE_REMOTE_SERVER | CODE_REMOTE_NETWORK | CODE_REMOTE_RATE_LIMITED
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_INPUT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CODE_NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(CODE_CONFLICT, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(CODE_PERSISTENCE, message)
    }
}

fn split_code_message(raw: &str) -> Option<(&str, &str)> {
    let msg = raw.trim();
    let msg = msg.strip_prefix("Error:").unwrap_or(msg).trim();
    if msg.is_empty() {
        return None;
    }

    let (maybe_code, rest) = msg.split_once(':')?;
    let code = maybe_code.trim();
    if code.is_empty() {
        return None;
    }
    let mut chars = code.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_') {
        return None;
    }
    Some((code, rest.trim()))
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        if let Some((code, rest)) = split_code_message(&value) {
            let message = if rest.is_empty() { value.trim() } else { rest };
            return AppError::new(code.to_string(), message.to_string());
        }
        AppError::new("INTERNAL_ERROR", value)
    }
}

impl From<&'static str> for AppError {
    fn from(value: &'static str) -> Self {
        AppError::from(value.to_string())
    }
}

impl From<AppError> for String {
    fn from(value: AppError) -> Self {
        value.to_string()
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::persistence(format!("io failure: {value}")).with_source(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::persistence(format!("json failure: {value}")).with_source(value)
    }
}
