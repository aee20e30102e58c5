// Library exports for the invoice-delivery crate
// The binary and the integration tests go through these modules

pub mod config;
pub mod error;
pub mod invoice;

// Document rendering through Chromium
pub mod renderer;

// Mail credentials and outgoing mail
pub mod auth;
pub mod dispatch;

pub mod delivery;

pub use delivery::{DeliveryPipeline, DeliveryReport, DeliveryRequest, DeliverySettings, DeliveryState};
pub use error::{DeliveryError, ErrorKind};
