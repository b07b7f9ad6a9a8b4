//! Usage: Process wiring (service container, logging, command-line front end).

pub mod app_state;
pub mod cli;
pub mod logging;
