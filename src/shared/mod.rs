pub mod blocking;
pub mod error;
pub(crate) mod mutex_ext;
pub mod security;
pub mod time;
