//! Data Transfer Objects for REST request/response serialization.
//!
//! Client-facing bodies use camelCase field names.

pub mod account_dto;
pub mod generation_dto;
pub mod payment_dto;

pub use account_dto::*;
pub use generation_dto::*;
pub use payment_dto::*;
