// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! 1sub API Library
//!
//! This crate contains the HTTP server components for the 1sub billing
//! core: vendor credit consumption and subscription verification,
//! payment-collaborator checkout completion, and the health probe.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
