//! Shared fixtures for the integration tests

pub mod intercepting_store;

pub use intercepting_store::*;
