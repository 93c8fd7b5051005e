//! hotspotd library
//!
//! Core functionality for the hotspot daemon:
//! - `SQLite` storage for subscribers, packages, devices, transactions and the ledger log
//! - Quota & Debt Ledger and Device Binding Registry
//! - RouterOS Reconciler driven by the policy engine in `hotspot-core`
//! - Payment Settlement Flow with exactly-once effects
//! - Scheduled sync and sweep loops
//! - HTTP API (axum)

pub mod app;
pub mod cache;
pub mod devices;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod locks;
pub mod notify;
pub mod payment;
pub mod reconcile;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod storage;

pub use app::{App, AppParts};
pub use error::{HotspotError, Result};
