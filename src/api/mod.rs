//! REST API layer: route handlers, DTOs, extractors, and router
//! composition.
//!
//! Resource endpoints are mounted under `/api/v1`; health and pricing sit
//! at the root.

pub mod auth;
pub mod docs;
pub mod dto;
pub mod handlers;

use axum::Router;

use crate::app_state::AppState;

/// Builds the complete API router with all REST endpoints.
///
/// Admin routes are mounted only when `with_admin` is set. With the
/// `swagger-ui` feature the UI is served at `/swagger-ui`.
pub fn build_router(with_admin: bool) -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes(with_admin))
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = {
        use utoipa::OpenApi;
        router.merge(
            utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
        )
    };

    router
}
