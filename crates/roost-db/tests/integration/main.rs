//! PostgreSQL integration tests.
//!
//! Each test starts its own `postgres:16` container, so they need a Docker
//! daemon and are ignored by default. Run with `cargo test -- --ignored`.

mod common;
mod job_tests;
mod property_tests;
