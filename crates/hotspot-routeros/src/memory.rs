//! In-process router.
//!
//! Backs the `memory` router backend (dry run) and every test that needs a
//! router. Records live in a map keyed by resource path. Mutating commands are
//! counted and logged so callers can assert on what was sent, and the whole
//! router can be switched offline to simulate an outage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, RouterError};
use crate::transport::Transport;
use crate::types::Record;

#[derive(Debug, Default)]
pub struct MemoryTransport {
    tables: Mutex<BTreeMap<String, Vec<Record>>>,
    log: Mutex<Vec<String>>,
    next_id: AtomicU64,
    mutations: AtomicU64,
    offline: AtomicBool,
}

fn row_matches(rec: &Record, query: &[(&str, &str)]) -> bool {
    query
        .iter()
        .all(|(k, v)| rec.get(*k).is_some_and(|have| have == v))
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the router going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of add/set/remove commands accepted so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// `"add ip/hotspot/user"`-style log of accepted mutations.
    pub async fn command_log(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    /// Insert a record the router produced on its own (hosts, dynamic leases,
    /// active sessions). Not counted as a mutation.
    pub async fn seed(&self, path: &str, mut record: Record) -> String {
        let id = self.fresh_id();
        record.insert(".id".to_string(), id.clone());
        self.tables
            .lock()
            .await
            .entry(path.to_string())
            .or_default()
            .push(record);
        id
    }

    /// Overwrite fields on seeded records matching `query`. Not counted.
    pub async fn update_where(&self, path: &str, query: &[(&str, &str)], attrs: &[(&str, &str)]) {
        let mut tables = self.tables.lock().await;
        if let Some(rows) = tables.get_mut(path) {
            for row in rows.iter_mut().filter(|r| row_matches(r, query)) {
                for (k, v) in attrs {
                    row.insert((*k).to_string(), (*v).to_string());
                }
            }
        }
    }

    /// Every record under `path`.
    pub async fn records(&self, path: &str) -> Vec<Record> {
        self.tables
            .lock()
            .await
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    fn fresh_id(&self) -> String {
        format!("*{:X}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RouterError::Unreachable("memory router is offline".into()))
        } else {
            Ok(())
        }
    }

    async fn record_mutation(&self, verb: &str, path: &str) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.log.lock().await.push(format!("{verb} {path}"));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn print(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Record>> {
        self.check_online()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(path)
            .map(|rows| rows.iter().filter(|r| row_matches(r, query)).cloned().collect())
            .unwrap_or_default())
    }

    async fn add(&self, path: &str, attrs: &Record) -> Result<String> {
        self.check_online()?;
        let id = self.fresh_id();
        let mut record = attrs.clone();
        record.insert(".id".to_string(), id.clone());
        self.tables
            .lock()
            .await
            .entry(path.to_string())
            .or_default()
            .push(record);
        self.record_mutation("add", path).await;
        Ok(id)
    }

    async fn set(&self, path: &str, id: &str, attrs: &Record) -> Result<()> {
        self.check_online()?;
        {
            let mut tables = self.tables.lock().await;
            let row = tables
                .get_mut(path)
                .and_then(|rows| rows.iter_mut().find(|r| r.get(".id").is_some_and(|v| v == id)))
                .ok_or_else(|| RouterError::NotFound(format!("{path}/{id}")))?;
            for (k, v) in attrs {
                row.insert(k.clone(), v.clone());
            }
        }
        self.record_mutation("set", path).await;
        Ok(())
    }

    async fn remove(&self, path: &str, id: &str) -> Result<()> {
        self.check_online()?;
        {
            let mut tables = self.tables.lock().await;
            let rows = tables
                .get_mut(path)
                .ok_or_else(|| RouterError::NotFound(format!("{path}/{id}")))?;
            let before = rows.len();
            rows.retain(|r| r.get(".id").is_none_or(|v| v != id));
            if rows.len() == before {
                return Err(RouterError::NotFound(format!("{path}/{id}")));
            }
        }
        self.record_mutation("remove", path).await;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn add_print_set_remove() {
        let t = MemoryTransport::new();
        let id = t.add("ip/hotspot/user", &rec(&[("name", "0812")])).await.unwrap();
        t.set("ip/hotspot/user", &id, &rec(&[("profile", "fup")])).await.unwrap();

        let rows = t.print("ip/hotspot/user", &[("name", "0812")]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("profile").map(String::as_str), Some("fup"));

        t.remove("ip/hotspot/user", &id).await.unwrap();
        assert!(t.remove("ip/hotspot/user", &id).await.unwrap_err().is_not_found());
        assert_eq!(t.mutation_count(), 3);
    }

    #[tokio::test]
    async fn seeded_records_are_not_mutations() {
        let t = MemoryTransport::new();
        t.seed("ip/hotspot/host", rec(&[("mac-address", "AA:BB:CC:DD:EE:FF")])).await;
        t.update_where("ip/hotspot/host", &[], &[("bytes-in", "10")]).await;
        assert_eq!(t.mutation_count(), 0);
        assert_eq!(t.records("ip/hotspot/host").await[0].get("bytes-in").unwrap(), "10");
    }

    #[tokio::test]
    async fn offline_router_is_unreachable() {
        let t = MemoryTransport::new();
        t.set_offline(true);
        assert!(t.print("ip/hotspot/user", &[]).await.unwrap_err().is_unreachable());
        assert!(t.ping().await.is_err());
        t.set_offline(false);
        assert!(t.ping().await.is_ok());
    }
}
