#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared plumbing for the 1sub billing core: database pool construction,
//! migration running, and the process-scoped rate limiter that guards the
//! credit consumption API.

pub mod db;
pub mod rate_limit;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use rate_limit::{RateLimitResult, RateLimiter};
