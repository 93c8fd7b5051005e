//! The four primitives every router backend provides.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Record;

/// Raw access to a RouterOS resource tree.
///
/// `path` is relative to the API root, e.g. `ip/hotspot/user`. `query`
/// filters on exact attribute equality.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn print(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Record>>;

    /// Create a record and return its `.id`.
    async fn add(&self, path: &str, attrs: &Record) -> Result<String>;

    async fn set(&self, path: &str, id: &str, attrs: &Record) -> Result<()>;

    /// Remove by `.id`. Fails with `NotFound` when the id is gone.
    async fn remove(&self, path: &str, id: &str) -> Result<()>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;
}
