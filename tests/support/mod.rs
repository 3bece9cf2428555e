//! Shared fixtures for integration tests.

pub mod crawl_api;
