pub mod auth;
pub mod config;
pub mod orders;

pub use auth::{AuthTokenProvider, PartnerAuthError};
pub use orders::{PartnerOrderClient, PartnerOrderError, PartnerOrderItem, PartnerOrderPayload};
