//! Route assembly

mod admin;
mod plans;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(webhooks::receive_webhook))
        .route("/plans", get(plans::list_plans))
        .route("/users/{user_id}/balance", get(plans::get_balance))
        .route("/users/{user_id}/transactions", get(plans::list_transactions))
        .route("/admin/users/{user_id}/tokens/grant", post(admin::grant_tokens))
        .route("/admin/users/{user_id}/tokens/deduct", post(admin::deduct_tokens))
        .route("/admin/users/{user_id}/plan", post(admin::switch_plan))
        .route("/admin/users/{user_id}/plan/cancel", post(admin::cancel_plan))
        .route("/admin/users/{user_id}/unlimited/enroll", post(admin::enroll_unlimited))
        .route("/admin/users/{user_id}/unlimited/unenroll", post(admin::unenroll_unlimited))
        .route("/admin/webhooks", get(webhooks::list_webhooks))
        .route("/admin/webhooks/{event_id}/replay", post(webhooks::replay_webhook))
        .route("/admin/invariants", get(admin::run_invariants))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
