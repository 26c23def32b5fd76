//! # banana-gateway
//!
//! Credits-metered back-end for an AI image storefront.
//!
//! Callers authenticate with a bearer token issued by a hosted auth
//! provider, buy credits through a payment processor, and spend them on
//! image generations proxied to a hosted multimodal model. The part that
//! must be right is the ledger: balances never go negative, a purchase is
//! credited at most once no matter how often its webhook is delivered, and
//! a generation is only debited after it produced an image.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP)          Payment processor (webhooks)
//!     │                          │
//!     ├── REST Handlers (api/) ──┤
//!     │     └── AuthenticatedUser ── IdentityProvider (upstream/)
//!     │
//!     ├── GenerationService ── ImageGenerator (upstream/)
//!     ├── AnalysisService ──── ImageAnalyzer (upstream/)
//!     ├── PaymentService ───── PaymentGateway (upstream/)
//!     │
//!     ├── LedgerService (gate, debit, credit, reconcile)
//!     │
//!     └── LedgerStore: PostgreSQL | in-process
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
pub mod signature;
pub mod upstream;
