//! Request authentication for the 1sub API
//!
//! Two distinct callers reach this server, each with its own guard:
//! vendor tool backends hold `sk-tool-` bearer keys, and the payment
//! collaborator signs request bodies with a shared HMAC secret.

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use middleware::{require_collaborator_signature, require_tool_key, AuthTool};
