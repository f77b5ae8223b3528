//! Shared E2E helpers.

pub mod assertions;
pub mod config;
pub mod modules;
