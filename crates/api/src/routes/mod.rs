//! HTTP route handlers and router assembly.

pub mod checkout;
pub mod credits;
pub mod health;
pub mod subscriptions;
pub mod verify;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth;
use crate::state::AppState;

/// Assemble the full application router.
///
/// Vendor endpoints sit behind API-key auth; payment-collaborator
/// endpoints sit behind raw-body signature verification. The health
/// probe is open.
pub fn create_router(state: AppState) -> Router {
    let vendor = Router::new()
        .route("/api/v1/credits/consume", post(credits::consume_credits))
        .route(
            "/api/v1/tools/subscriptions/verify",
            post(verify::verify_subscription),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_tool_key,
        ));

    let collaborator = Router::new()
        .route(
            "/api/v1/credits/balance/{user_id}",
            get(credits::get_balance),
        )
        .route(
            "/api/v1/checkout/credits/complete",
            post(checkout::complete_credit_checkout),
        )
        .route(
            "/api/v1/checkout/tools/complete",
            post(checkout::complete_tool_checkout),
        )
        .route(
            "/api/v1/subscriptions/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/api/v1/subscriptions/renew",
            post(subscriptions::renew_subscription),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_collaborator_signature,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(vendor)
        .merge(collaborator)
        .with_state(state)
}
