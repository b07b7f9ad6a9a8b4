//! Usage: Domain modules (account model, registry, system integration seam).

pub mod accounts;
pub mod integration;
pub mod registry;
