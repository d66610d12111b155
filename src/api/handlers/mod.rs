//! REST endpoint handlers organized by resource.

pub mod internal;
pub mod outbox;
pub mod rewards;
pub mod system;
pub mod wallet;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(wallet::routes())
        .merge(rewards::routes())
        .merge(outbox::routes())
}
