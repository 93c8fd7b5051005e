//! hotspot core library
//!
//! Shared functionality for hotspotd components:
//! - Subscriber, package and access-state model
//! - Hotspot policy engine
//! - Phone, MAC and payment order-id canonicalisation
//! - Configuration resolution and hierarchy
//! - Storage helpers, counters and tracing setup

pub mod config;
pub mod counters;
pub mod db;
pub mod error;
pub mod mac;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod model;
pub mod order_id;
pub mod phone;
pub mod policy;
pub mod tracing_init;

pub use config::Config;
pub use counters::Counters;
pub use error::{Error, Result};
pub use model::{AccessState, ApprovalStatus, Package, QuotaState, Role, Subscriber};
pub use policy::{Decision, PolicyConfig, decide};
