//! Domain layer: accounts, purchase events, pricing, and generation requests.
//!
//! This module contains the server-side domain model: account identity and
//! balance records, processor purchase events with their idempotency keys,
//! the authoritative pricing table, and validated generation and analysis
//! requests.

pub mod account;
pub mod account_id;
pub mod generation;
pub mod pricing;
pub mod purchase_event;

pub use account::{Account, Identity};
pub use account_id::AccountId;
pub use generation::{
    AnalysisRequest, GenerationMode, GenerationParams, GenerationPolicy, GenerationRequest,
};
pub use pricing::{BillingPeriod, DEFAULT_GENERATION_COST, PlanOffer, PricingError, PricingTable};
pub use purchase_event::{PurchaseEvent, PurchaseEventId, PurchaseStatus, PurchaseTarget};
