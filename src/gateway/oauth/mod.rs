//! Usage: Browser login for Kiro accounts (PKCE, loopback callback, desktop and web portal backends).

pub mod backend;
pub mod browser;
pub mod callback_server;
pub mod coordinator;
pub mod desktop;
pub mod pkce;
pub mod web_portal;
