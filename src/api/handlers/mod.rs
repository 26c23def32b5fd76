//! REST endpoint handlers organized by resource.

pub mod account;
pub mod admin;
pub mod generation;
pub mod payment;
pub mod system;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes under `/api/v1`. Admin routes are added
/// only when `with_admin` is set.
pub fn routes(with_admin: bool) -> Router<AppState> {
    let router = Router::new()
        .merge(generation::routes())
        .merge(payment::routes())
        .merge(account::routes());
    if with_admin {
        router.merge(admin::routes())
    } else {
        router
    }
}
