//! `SQLite` storage for hotspotd.
//!
//! Subscribers, packages, devices, transactions and their events, manual debt
//! items, the quota mutation log, settings and the audit trail.

mod db;
mod devices;
mod ledger;
mod models;
mod settings;
mod subscribers;
mod transactions;

pub use db::{Database, DatabaseError};
pub use ledger::LockedSubscriber;
pub use models::*;
pub use subscribers::{Approval, NewPackage};
pub use transactions::{ChargeUpdate, NewTransaction};
