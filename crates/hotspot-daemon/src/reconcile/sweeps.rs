//! Fleet sweeps driven by the scheduler.
//!
//! Each sweep reads the router once, then walks subscribers holding their
//! advisory lock. Failures are counted and logged; a sweep only returns an
//! error when the initial router snapshot or the database read fails.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use hotspot_core::ApprovalStatus;
use hotspot_core::phone::local_form;
use hotspot_routeros::{AddressEntrySpec, BindingType, LeaseSpec};
use serde::Serialize;
use tracing::{info, warn};

use super::plan::{comment_uid, multi_listed};
use super::{ReconcileOptions, Reconciler, by_subscriber};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::settings::HotspotSettings;

/// Marker on entries the unauthorized sweep owns.
const UNAUTHORIZED_TAG: &str = "unauthorized|";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub changed: usize,
    pub failed: usize,
}

impl Reconciler {
    /// Feed hotspot host counters into the ledger and reconcile subscribers
    /// whose state may have moved.
    pub async fn usage_sync(&self, ledger: &Ledger) -> Result<SweepReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let snapshot = self.snapshot().await?;
        let now = Utc::now();
        let mut report = SweepReport::default();

        let hosts: BTreeMap<&str, u64> = snapshot
            .hosts
            .iter()
            .map(|h| (h.mac.as_str(), h.bytes_total()))
            .collect();

        for (subscriber_id, devices) in by_subscriber(self.db.list_fleet_devices().await?) {
            let _guard = self.locks.lock(&subscriber_id).await;
            report.processed += 1;

            let mut touched = false;
            for device in &devices {
                let Some(bytes) = hosts.get(device.mac.as_str()) else {
                    continue;
                };
                match ledger
                    .absorb_usage(&subscriber_id, &device.mac, *bytes, &settings, now)
                    .await
                {
                    Ok(out) => {
                        touched |= out.blocked || out.delta_mb > 0.0;
                    }
                    Err(e) => {
                        warn!(subscriber_id = %subscriber_id, mac = %device.mac, error = %e, "Usage absorb failed");
                        self.counters.incr("usage_sync.failed");
                        report.failed += 1;
                    }
                }
            }

            if touched {
                match self
                    .reconcile_locked(&subscriber_id, &settings, &snapshot, ReconcileOptions::default(), now)
                    .await
                {
                    Ok(r) if r.is_clean() => report.changed += usize::from(r.changed()),
                    Ok(_) => report.failed += 1,
                    Err(e) => {
                        warn!(subscriber_id = %subscriber_id, error = %e, "Reconcile after usage failed");
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Reconcile every approved subscriber.
    pub async fn binding_sync(&self) -> Result<SweepReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let snapshot = self.snapshot().await?;
        let now = Utc::now();
        let mut report = SweepReport::default();

        for sub in self.db.list_subscribers(ApprovalStatus::Approved).await? {
            let _guard = self.locks.lock(&sub.id).await;
            report.processed += 1;
            match self
                .reconcile_locked(&sub.id, &settings, &snapshot, ReconcileOptions::default(), now)
                .await
            {
                Ok(r) if r.is_clean() => report.changed += usize::from(r.changed()),
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(subscriber_id = %sub.id, error = %e, "Binding sync failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Remove managed entries owned by subscribers that are gone, and
    /// reconcile owners of IPs found in more than one managed list.
    pub async fn address_list_sweep(&self) -> Result<SweepReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let snapshot = self.snapshot().await?;
        let managed = settings.policy.managed_lists();
        let approved: BTreeSet<String> = self
            .db
            .list_subscribers(ApprovalStatus::Approved)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut report = SweepReport::default();

        let managed_entries = snapshot
            .entries
            .iter()
            .filter(|e| managed.contains(&e.list));
        for entry in managed_entries.clone() {
            report.processed += 1;
            let Some(uid) = entry.comment.as_deref().and_then(comment_uid) else {
                continue;
            };
            if approved.contains(uid) {
                continue;
            }
            match self.router.remove_entry(&entry.address, &entry.list).await {
                Ok(_) => {
                    self.counters.incr("address_list.orphan_removed");
                    report.changed += 1;
                }
                Err(e) => {
                    warn!(ip = %entry.address, list = %entry.list, error = %e, "Orphan removal failed");
                    self.counters.incr("policy.mismatch.address_list");
                    report.failed += 1;
                }
            }
        }

        let multi = multi_listed(managed_entries.clone(), &managed);
        if !multi.is_empty() {
            self.counters
                .add("policy.invariant.multi_list", multi.len() as u64);
        }
        let owners: BTreeSet<&str> = managed_entries
            .filter(|e| multi.contains(&e.address))
            .filter_map(|e| e.comment.as_deref().and_then(comment_uid))
            .filter(|uid| approved.contains(*uid))
            .collect();
        for owner in owners {
            warn!(subscriber_id = owner, "Healing multi-list membership");
            let _guard = self.locks.lock(owner).await;
            if let Err(e) = self
                .reconcile_locked(owner, &settings, &snapshot, ReconcileOptions::default(), Utc::now())
                .await
            {
                warn!(subscriber_id = owner, error = %e, "Multi-list heal failed");
                report.failed += 1;
            }
        }
        Ok(report)
    }

    /// Put long-lived unauthorized hosts in the unauthorized list and take
    /// them out once they are allowed. The entry timeout is enforced by the
    /// router, so it is only sent when the entry is created.
    pub async fn unauthorized_sweep(&self) -> Result<SweepReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let snapshot = self.snapshot().await?;
        let list = settings.policy.unauthorized_list.as_str();
        let mut report = SweepReport::default();

        let fleet = self.db.list_fleet_devices().await?;
        let fleet_macs: BTreeSet<&str> = fleet.iter().map(|d| d.mac.as_str()).collect();

        let mut allowed: BTreeSet<String> = fleet
            .iter()
            .filter_map(|d| snapshot.device_ip(d))
            .collect();
        let open_bindings: BTreeSet<&str> = snapshot
            .bindings
            .iter()
            .filter(|b| !b.disabled && b.binding_type != BindingType::Blocked)
            .map(|b| b.mac.as_str())
            .collect();
        for lease in &snapshot.leases {
            if lease.is_bound() && open_bindings.contains(lease.mac.as_str()) {
                allowed.insert(lease.address.clone());
            }
        }
        let is_allowed = |ip: &str| allowed.contains(ip) || settings.is_exempt_ip(ip);

        let mut offenders: BTreeMap<&str, &str> = BTreeMap::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for host in &snapshot.hosts {
            let Some(ip) = host.address.as_deref() else {
                continue;
            };
            seen.insert(ip);
            report.processed += 1;
            if !host.authorized
                && host.uptime_secs >= settings.unauthorized_min_uptime_secs
                && !fleet_macs.contains(host.mac.as_str())
                && !is_allowed(ip)
            {
                offenders.insert(ip, host.mac.as_str());
            }
        }

        let listed: Vec<_> = snapshot.entries.iter().filter(|e| e.list == list).collect();
        let listed_ips: BTreeSet<&str> = listed.iter().map(|e| e.address.as_str()).collect();

        for (ip, mac) in &offenders {
            if listed_ips.contains(ip) {
                continue;
            }
            let spec = AddressEntrySpec {
                list: list.to_string(),
                address: (*ip).to_string(),
                comment: format!("{UNAUTHORIZED_TAG}mac={mac}"),
                timeout: Some(settings.unauthorized_timeout.clone()),
            };
            match self.router.upsert_entry(&spec).await {
                Ok(_) => {
                    info!(ip, mac, "Listed unauthorized host");
                    self.counters.incr("unauthorized.add");
                    report.changed += 1;
                }
                Err(e) => {
                    warn!(ip, error = %e, "Unauthorized listing failed");
                    self.counters.incr("policy.mismatch.unauthorized");
                    report.failed += 1;
                }
            }
        }

        for entry in listed {
            let ours = entry
                .comment
                .as_deref()
                .is_some_and(|c| c.starts_with(UNAUTHORIZED_TAG));
            let ip = entry.address.as_str();
            let cleared = !offenders.contains_key(ip) && (is_allowed(ip) || seen.contains(ip));
            if !ours || !cleared {
                continue;
            }
            match self.router.remove_entry(ip, list).await {
                Ok(_) => {
                    self.counters.incr("unauthorized.remove");
                    report.changed += 1;
                }
                Err(e) => {
                    warn!(ip, error = %e, "Unauthorized removal failed");
                    self.counters.incr("policy.mismatch.unauthorized");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Keep a static DHCP lease for every authorized device with a known IP.
    pub async fn dhcp_refresh(&self) -> Result<SweepReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let mut report = SweepReport::default();
        if !settings.dhcp_static_leases {
            return Ok(report);
        }
        let snapshot = self.snapshot().await?;
        let subscribers: BTreeMap<String, String> = self
            .db
            .list_subscribers(ApprovalStatus::Approved)
            .await?
            .into_iter()
            .map(|s| (s.id, s.phone))
            .collect();
        let fleet = self.db.list_fleet_devices().await?;
        let fleet_macs: BTreeSet<&str> = fleet.iter().map(|d| d.mac.as_str()).collect();

        for device in &fleet {
            report.processed += 1;
            let (Some(ip), Some(phone)) = (snapshot.device_ip(device), subscribers.get(&device.subscriber_id))
            else {
                continue;
            };
            let comment = format!(
                "user={}|uid={}",
                local_form(phone, &settings.country_code),
                device.subscriber_id
            );
            let in_sync = snapshot.leases.iter().any(|l| {
                l.mac == device.mac && !l.dynamic && l.address == ip && l.comment.as_deref() == Some(comment.as_str())
            });
            if in_sync {
                continue;
            }
            let spec = LeaseSpec {
                address: ip,
                mac: device.mac.clone(),
                comment,
                server: settings.dhcp_server.clone(),
            };
            match self.router.create_static_lease(&spec).await {
                Ok(change) => report.changed += usize::from(change.is_mutation()),
                Err(e) => {
                    warn!(mac = %device.mac, error = %e, "Static lease failed");
                    self.counters.incr("policy.mismatch.dhcp");
                    report.failed += 1;
                }
            }
        }

        for lease in &snapshot.leases {
            let ours = lease.comment.as_deref().and_then(comment_uid).is_some();
            if lease.dynamic || !ours || fleet_macs.contains(lease.mac.as_str()) {
                continue;
            }
            match self.router.remove_lease_by_mac(&lease.mac).await {
                Ok(change) => report.changed += usize::from(change.is_mutation()),
                Err(e) => {
                    warn!(mac = %lease.mac, error = %e, "Stale lease removal failed");
                    self.counters.incr("policy.mismatch.dhcp");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
