//! OpenAPI document.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// Registers the `bearer` security scheme referenced by the handlers.
#[derive(Debug)]
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// OpenAPI description of every endpoint.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "banana-gateway", description = "Credits-metered AI image generation API"),
    paths(
        crate::api::handlers::generation::generate_image,
        crate::api::handlers::generation::analyze_image,
        crate::api::handlers::payment::purchase_webhook,
        crate::api::handlers::payment::create_checkout,
        crate::api::handlers::payment::verify_checkout,
        crate::api::handlers::account::get_account,
        crate::api::handlers::admin::adjust_balance,
        crate::api::handlers::admin::reconcile,
        crate::api::handlers::system::health_handler,
        crate::api::handlers::system::pricing_handler,
    ),
    components(schemas(
        crate::error::ErrorResponse,
        crate::api::dto::GenerateImageRequest,
        crate::api::dto::GenerateImageResponse,
        crate::api::dto::AnalyzeImageRequest,
        crate::api::dto::AnalyzeImageResponse,
        crate::api::dto::CheckoutRequest,
        crate::api::dto::CheckoutResponse,
        crate::api::dto::VerifyCheckoutResponse,
        crate::api::dto::WebhookAck,
        crate::api::dto::AccountResponse,
        crate::api::dto::AdjustBalanceRequest,
        crate::api::dto::AdjustBalanceResponse,
        crate::service::ReconcileReport,
        crate::persistence::BillingDiscrepancy,
        crate::domain::PricingTable,
        crate::domain::PlanOffer,
        crate::domain::BillingPeriod,
        crate::domain::GenerationMode,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "Generation", description = "Metered image generation and image analysis"),
        (name = "Payments", description = "Checkout and purchase notifications"),
        (name = "Account", description = "Caller balance"),
        (name = "Admin", description = "Operator tooling"),
        (name = "System", description = "Health and configuration"),
    )
)]
pub struct ApiDoc;
