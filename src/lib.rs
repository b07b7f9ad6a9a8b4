//! Kiro account vault: encrypted multi-account credential storage, browser login and quota tracking.

pub mod app;
pub mod domain;
pub mod gateway;
pub mod infra;
pub mod shared;
pub mod test_support;

pub use app::app_state::AppServices;
pub use app::cli::{run, Cli};
pub use shared::error::{AppError, AppResult};
