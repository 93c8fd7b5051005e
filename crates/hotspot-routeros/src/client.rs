//! Typed, idempotent router operations.
//!
//! Every write reads the current record first and only sends the attributes
//! that differ, so repeating an operation with the same input sends nothing.
//! Deletes of things already gone report [`Change::Absent`] rather than fail.

use async_trait::async_trait;
use tracing::debug;

use crate::duration::format_duration;
use crate::error::{Result, RouterError};
use crate::memory::MemoryTransport;
use crate::transport::Transport;
use crate::types::{
    ActiveSession, AddressEntrySpec, AddressListEntry, BindingSpec, Change, DhcpLease,
    HotspotHost, HotspotUser, IpBinding, LeaseSpec, Record, UserSpec, paths,
};

/// Operations the reconciler and the payment flow need from the router.
#[async_trait]
pub trait RouterApi: Send + Sync {
    async fn health(&self) -> Result<()>;

    async fn get_user(&self, name: &str) -> Result<Option<HotspotUser>>;
    async fn upsert_user(&self, spec: &UserSpec) -> Result<Change>;
    /// Remove the user together with its active sessions and IP bindings.
    async fn purge_user(&self, name: &str) -> Result<Change>;

    async fn snapshot_bindings(&self) -> Result<Vec<IpBinding>>;
    async fn upsert_binding(&self, spec: &BindingSpec) -> Result<Change>;
    async fn remove_binding_by_mac(&self, mac: &str) -> Result<Change>;

    async fn snapshot_leases(&self) -> Result<Vec<DhcpLease>>;
    async fn create_static_lease(&self, spec: &LeaseSpec) -> Result<Change>;
    async fn remove_lease_by_mac(&self, mac: &str) -> Result<Change>;

    /// Entries of one list, or of every list when `list` is `None`.
    async fn snapshot_list(&self, list: Option<&str>) -> Result<Vec<AddressListEntry>>;
    async fn upsert_entry(&self, spec: &AddressEntrySpec) -> Result<Change>;
    async fn remove_entry(&self, address: &str, list: &str) -> Result<Change>;

    async fn snapshot_hosts(&self) -> Result<Vec<HotspotHost>>;
    async fn remove_host_by_mac(&self, mac: &str) -> Result<Change>;

    async fn snapshot_active(&self) -> Result<Vec<ActiveSession>>;
    async fn lookup_by_ip(&self, ip: &str) -> Result<Option<ActiveSession>>;
    async fn remove_by_ip(&self, ip: &str) -> Result<Change>;
}

/// [`RouterApi`] over any [`Transport`].
#[derive(Debug)]
pub struct RouterClient<T> {
    transport: T,
}

/// Router kept entirely in process.
pub type MemoryRouter = RouterClient<MemoryTransport>;

impl MemoryRouter {
    pub fn memory() -> Self {
        Self::new(MemoryTransport::new())
    }
}

/// Values the router reports for attributes that were never set.
fn same(existing: Option<&String>, desired: &str) -> bool {
    match existing {
        Some(have) => have == desired,
        None => desired.is_empty() || desired == "0" || desired == "0s",
    }
}

fn attrs(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

impl<T: Transport> RouterClient<T> {
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Converge `existing` (rows matching the identity key) towards `desired`.
    /// Extra rows beyond the first are duplicates and get removed.
    async fn apply(
        &self,
        path: &str,
        existing: &[Record],
        desired: Record,
        create_only: &[&str],
    ) -> Result<Change> {
        let Some((first, duplicates)) = existing.split_first() else {
            self.transport.add(path, &desired).await?;
            return Ok(Change::Created);
        };

        let mut changed = false;
        for dupe in duplicates {
            if let Some(id) = dupe.get(".id") {
                debug!(path, id = %id, "removing duplicate router record");
                self.remove_tolerant(path, id).await?;
                changed = true;
            }
        }

        let diff: Record = desired
            .into_iter()
            .filter(|(k, v)| !create_only.contains(&k.as_str()) && !same(first.get(k), v))
            .collect();
        if !diff.is_empty() {
            let id = first
                .get(".id")
                .ok_or_else(|| RouterError::Decode(format!("{path}: record without .id")))?;
            self.transport.set(path, id, &diff).await?;
            changed = true;
        }

        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    async fn upsert(
        &self,
        path: &str,
        key: &[(&str, &str)],
        desired: Record,
        create_only: &[&str],
    ) -> Result<Change> {
        let existing = self.transport.print(path, key).await?;
        self.apply(path, &existing, desired, create_only).await
    }

    async fn remove_tolerant(&self, path: &str, id: &str) -> Result<bool> {
        match self.transport.remove(path, id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_where(&self, path: &str, key: &[(&str, &str)]) -> Result<Change> {
        let rows = self.transport.print(path, key).await?;
        let mut removed = false;
        for id in rows.iter().filter_map(|r| r.get(".id")) {
            removed |= self.remove_tolerant(path, id).await?;
        }
        Ok(if removed { Change::Removed } else { Change::Absent })
    }
}

#[async_trait]
impl<T: Transport> RouterApi for RouterClient<T> {
    async fn health(&self) -> Result<()> {
        self.transport.ping().await
    }

    async fn get_user(&self, name: &str) -> Result<Option<HotspotUser>> {
        let rows = self
            .transport
            .print(paths::HOTSPOT_USER, &[("name", name)])
            .await?;
        Ok(rows.iter().find_map(HotspotUser::from_record))
    }

    async fn upsert_user(&self, spec: &UserSpec) -> Result<Change> {
        let existing = self
            .transport
            .print(paths::HOTSPOT_USER, &[("name", spec.name.as_str())])
            .await?;

        let limit_bytes = spec.limit_bytes_total.unwrap_or(0).to_string();
        let limit_uptime = format_duration(spec.session_timeout_secs.unwrap_or(0));
        let mut desired = attrs(&[
            ("name", spec.name.as_str()),
            ("password", spec.password.as_str()),
            ("profile", spec.profile.as_str()),
            ("comment", spec.comment.as_str()),
            ("limit-bytes-total", limit_bytes.as_str()),
            ("limit-uptime", limit_uptime.as_str()),
        ]);
        if let Some(server) = &spec.server {
            desired.insert("server".into(), server.clone());
        }

        let current_profile = existing
            .first()
            .and_then(|r| r.get("profile"))
            .filter(|p| !p.is_empty());
        if let Some(current) = current_profile
            && !spec.force_profile
            && !spec.replaceable_profiles.iter().any(|p| p == current)
        {
            debug!(user = %spec.name, profile = %current, "keeping custom hotspot profile");
            desired.remove("profile");
        }

        self.apply(paths::HOTSPOT_USER, &existing, desired, &[]).await
    }

    async fn purge_user(&self, name: &str) -> Result<Change> {
        let sessions = self.remove_where(paths::HOTSPOT_ACTIVE, &[("user", name)]).await?;

        let marker = format!("user={name}|");
        let bindings = self.transport.print(paths::IP_BINDING, &[]).await?;
        let mut removed_binding = false;
        for rec in &bindings {
            let ours = rec.get("comment").is_some_and(|c| c.starts_with(&marker));
            if ours && let Some(id) = rec.get(".id") {
                removed_binding |= self.remove_tolerant(paths::IP_BINDING, id).await?;
            }
        }

        let user = self.remove_where(paths::HOTSPOT_USER, &[("name", name)]).await?;

        Ok(
            if user.is_mutation() || sessions.is_mutation() || removed_binding {
                Change::Removed
            } else {
                Change::Absent
            },
        )
    }

    async fn snapshot_bindings(&self) -> Result<Vec<IpBinding>> {
        let rows = self.transport.print(paths::IP_BINDING, &[]).await?;
        Ok(rows.iter().filter_map(IpBinding::from_record).collect())
    }

    async fn upsert_binding(&self, spec: &BindingSpec) -> Result<Change> {
        let mut desired = attrs(&[
            ("mac-address", spec.mac.as_str()),
            ("type", spec.binding_type.as_str()),
            ("comment", spec.comment.as_str()),
        ]);
        if let Some(address) = &spec.address {
            desired.insert("address".into(), address.clone());
        }
        if let Some(server) = &spec.server {
            desired.insert("server".into(), server.clone());
        }
        self.upsert(paths::IP_BINDING, &[("mac-address", spec.mac.as_str())], desired, &[])
            .await
    }

    async fn remove_binding_by_mac(&self, mac: &str) -> Result<Change> {
        self.remove_where(paths::IP_BINDING, &[("mac-address", mac)]).await
    }

    async fn snapshot_leases(&self) -> Result<Vec<DhcpLease>> {
        let rows = self.transport.print(paths::DHCP_LEASE, &[]).await?;
        Ok(rows.iter().filter_map(DhcpLease::from_record).collect())
    }

    async fn create_static_lease(&self, spec: &LeaseSpec) -> Result<Change> {
        let key = [("mac-address", spec.mac.as_str())];
        let existing = self.transport.print(paths::DHCP_LEASE, &key).await?;

        let mut replaced = false;
        let mut kept = Vec::with_capacity(existing.len());
        for rec in existing {
            let dynamic = rec.get("dynamic").is_some_and(|d| d == "true");
            match rec.get(".id").cloned() {
                Some(id) if dynamic => {
                    replaced |= self.remove_tolerant(paths::DHCP_LEASE, &id).await?;
                }
                _ => kept.push(rec),
            }
        }

        let mut desired = attrs(&[
            ("address", spec.address.as_str()),
            ("mac-address", spec.mac.as_str()),
            ("comment", spec.comment.as_str()),
        ]);
        if let Some(server) = &spec.server {
            desired.insert("server".into(), server.clone());
        }

        let change = self.apply(paths::DHCP_LEASE, &kept, desired, &[]).await?;
        Ok(if replaced && change == Change::Unchanged {
            Change::Updated
        } else {
            change
        })
    }

    async fn remove_lease_by_mac(&self, mac: &str) -> Result<Change> {
        self.remove_where(paths::DHCP_LEASE, &[("mac-address", mac)]).await
    }

    async fn snapshot_list(&self, list: Option<&str>) -> Result<Vec<AddressListEntry>> {
        let rows = match list {
            Some(list) => self.transport.print(paths::ADDRESS_LIST, &[("list", list)]).await?,
            None => self.transport.print(paths::ADDRESS_LIST, &[]).await?,
        };
        Ok(rows.iter().filter_map(AddressListEntry::from_record).collect())
    }

    async fn upsert_entry(&self, spec: &AddressEntrySpec) -> Result<Change> {
        let mut desired = attrs(&[
            ("list", spec.list.as_str()),
            ("address", spec.address.as_str()),
            ("comment", spec.comment.as_str()),
        ]);
        if let Some(timeout) = &spec.timeout {
            desired.insert("timeout".into(), timeout.clone());
        }
        self.upsert(
            paths::ADDRESS_LIST,
            &[("list", spec.list.as_str()), ("address", spec.address.as_str())],
            desired,
            &["timeout"],
        )
        .await
    }

    async fn remove_entry(&self, address: &str, list: &str) -> Result<Change> {
        self.remove_where(paths::ADDRESS_LIST, &[("list", list), ("address", address)])
            .await
    }

    async fn snapshot_hosts(&self) -> Result<Vec<HotspotHost>> {
        let rows = self.transport.print(paths::HOTSPOT_HOST, &[]).await?;
        Ok(rows.iter().filter_map(HotspotHost::from_record).collect())
    }

    async fn remove_host_by_mac(&self, mac: &str) -> Result<Change> {
        self.remove_where(paths::HOTSPOT_HOST, &[("mac-address", mac)]).await
    }

    async fn snapshot_active(&self) -> Result<Vec<ActiveSession>> {
        let rows = self.transport.print(paths::HOTSPOT_ACTIVE, &[]).await?;
        Ok(rows.iter().filter_map(ActiveSession::from_record).collect())
    }

    async fn lookup_by_ip(&self, ip: &str) -> Result<Option<ActiveSession>> {
        let rows = self
            .transport
            .print(paths::HOTSPOT_ACTIVE, &[("address", ip)])
            .await?;
        Ok(rows.iter().find_map(ActiveSession::from_record))
    }

    async fn remove_by_ip(&self, ip: &str) -> Result<Change> {
        self.remove_where(paths::HOTSPOT_ACTIVE, &[("address", ip)]).await
    }
}
