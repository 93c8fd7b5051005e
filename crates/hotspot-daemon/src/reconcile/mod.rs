//! RouterOS Reconciler.
//!
//! Converges the router towards what the policy engine decides for each
//! subscriber: the hotspot user, one IP binding per authorized device, and
//! each device IP in exactly one managed address-list. Router failures are
//! counted under `policy.mismatch.*` and never abort the run; the next sweep
//! picks up what was missed.

pub mod plan;
pub mod sweeps;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hotspot_core::phone::local_form;
use hotspot_core::{AccessState, ApprovalStatus, Counters, Subscriber, decide};
use hotspot_routeros::{
    AddressListEntry, BindingType, DhcpLease, HotspotHost, IpBinding, RouterApi, UserSpec,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::settings::{HotspotSettings, SettingsStore};
use crate::storage::{Database, Device};

use self::plan::{DeviceTarget, PlanInput, subscriber_comment};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Overwrite the hotspot user's profile even if an admin changed it.
    pub force_profile: bool,
}

/// What one per-subscriber reconcile did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub subscriber_id: String,
    pub state: Option<AccessState>,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failures: Vec<String>,
}

impl ReconcileReport {
    /// Every router command succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether anything was written.
    pub const fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// Router state read once and shared by every subscriber of a sweep.
#[derive(Debug, Default)]
pub struct RouterSnapshot {
    pub entries: Vec<AddressListEntry>,
    pub bindings: Vec<IpBinding>,
    pub hosts: Vec<HotspotHost>,
    pub leases: Vec<DhcpLease>,
}

impl RouterSnapshot {
    pub async fn read(router: &dyn RouterApi) -> Result<Self> {
        Ok(Self {
            entries: router.snapshot_list(None).await?,
            bindings: router.snapshot_bindings().await?,
            hosts: router.snapshot_hosts().await?,
            leases: router.snapshot_leases().await?,
        })
    }

    /// Current IP of a device: hotspot host, then bound lease, then last known.
    pub fn device_ip(&self, device: &Device) -> Option<String> {
        self.hosts
            .iter()
            .find(|h| h.mac == device.mac)
            .and_then(|h| h.address.clone())
            .or_else(|| {
                self.leases
                    .iter()
                    .find(|l| l.mac == device.mac && l.is_bound())
                    .map(|l| l.address.clone())
            })
            .or_else(|| device.last_ip.clone())
    }
}

/// Binding type for a state.
pub fn binding_type_for(state: AccessState, granted: BindingType) -> BindingType {
    if state == AccessState::Blocked {
        BindingType::Blocked
    } else if state.grants_access() {
        granted
    } else {
        BindingType::Regular
    }
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    router: Arc<dyn RouterApi>,
    settings: SettingsStore,
    locks: KeyedLocks,
    counters: Counters,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        db: Database,
        router: Arc<dyn RouterApi>,
        settings: SettingsStore,
        locks: KeyedLocks,
        counters: Counters,
    ) -> Self {
        Self {
            db,
            router,
            settings,
            locks,
            counters,
        }
    }

    pub fn router(&self) -> &dyn RouterApi {
        self.router.as_ref()
    }

    pub const fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Converge one subscriber under its advisory lock.
    pub async fn reconcile_subscriber(
        &self,
        subscriber_id: &str,
        opts: ReconcileOptions,
    ) -> Result<ReconcileReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let _guard = self.locks.lock(subscriber_id).await;
        let snapshot = self.snapshot().await?;
        self.reconcile_locked(subscriber_id, &settings, &snapshot, opts, Utc::now())
            .await
    }

    async fn snapshot(&self) -> Result<RouterSnapshot> {
        RouterSnapshot::read(self.router.as_ref()).await.inspect_err(|e| {
            warn!(error = %e, "Router snapshot failed");
            self.counters.incr("policy.mismatch.snapshot");
        })
    }

    fn failed(&self, report: &mut ReconcileReport, kind: &str, what: String) {
        warn!(subscriber_id = %report.subscriber_id, kind, "{what}");
        self.counters.incr(&format!("policy.mismatch.{kind}"));
        report.failures.push(what);
    }

    /// Converge one subscriber. The caller holds its advisory lock.
    pub(crate) async fn reconcile_locked(
        &self,
        subscriber_id: &str,
        settings: &HotspotSettings,
        snapshot: &RouterSnapshot,
        opts: ReconcileOptions,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let sub = self.db.get_subscriber(subscriber_id).await?;
        let devices = if sub.approval == ApprovalStatus::Approved {
            self.db.list_authorized_devices(subscriber_id).await?
        } else {
            Vec::new()
        };
        let decision = decide(&sub, now, &settings.policy);
        let mut report = ReconcileReport {
            subscriber_id: subscriber_id.to_string(),
            state: Some(decision.state),
            ..ReconcileReport::default()
        };

        let username = local_form(&sub.phone, &settings.country_code);
        let comment = subscriber_comment(&username, &sub.id, sub.role.as_str(), decision.state);

        if sub.approval == ApprovalStatus::Approved {
            self.converge_user(&sub, &username, &comment, &decision, settings, opts, &mut report)
                .await;
        }

        let mut targets = Vec::with_capacity(devices.len());
        for device in &devices {
            let ip = snapshot.device_ip(device);
            if let Some(ip) = &ip
                && device.last_ip.as_deref() != Some(ip.as_str())
            {
                self.db.update_device_ip(&device.id, ip).await?;
            }
            targets.push(DeviceTarget {
                mac: device.mac.clone(),
                ip,
            });
        }

        let managed = settings.policy.managed_lists();
        let plan = plan::plan(&PlanInput {
            uid: &sub.id,
            comment: &comment,
            address_list: &decision.address_list,
            binding_type: binding_type_for(decision.state, settings.granted_binding_type),
            server: settings.hotspot_server.as_deref(),
            devices: &targets,
            managed_lists: &managed,
            unauthorized_list: &settings.policy.unauthorized_list,
            entries: &snapshot.entries,
            bindings: &snapshot.bindings,
        });
        if !plan.multi_list.is_empty() {
            warn!(subscriber_id, ips = ?plan.multi_list, "IP in more than one managed list");
            self.counters
                .add("policy.invariant.multi_list", plan.multi_list.len() as u64);
        }
        self.apply_plan(&plan, &mut report).await;

        if !decision.state.grants_access() {
            self.evict_sessions(&targets, &mut report).await;
        }

        if report.changed() {
            info!(
                subscriber_id,
                state = %decision.state,
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                "Reconciled"
            );
        } else {
            debug!(subscriber_id, state = %decision.state, "Already converged");
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn converge_user(
        &self,
        sub: &Subscriber,
        username: &str,
        comment: &str,
        decision: &hotspot_core::Decision,
        settings: &HotspotSettings,
        opts: ReconcileOptions,
        report: &mut ReconcileReport,
    ) {
        let Some(password) = sub.hotspot_password.clone() else {
            self.failed(report, "user", format!("{username}: no hotspot credential"));
            return;
        };
        let profile = match (&sub.router_profile, decision.state) {
            (Some(own), AccessState::Active | AccessState::Unlimited) => own.clone(),
            _ => decision.router_profile.clone(),
        };
        let quota_state = matches!(
            decision.state,
            AccessState::Active | AccessState::Fup | AccessState::Habis
        );
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit_bytes_total = (quota_state && sub.purchased_mb > 0.0)
            .then(|| (sub.purchased_mb * hotspot_core::model::BYTES_PER_MB) as u64);
        let mut replaceable: Vec<String> = settings.policy.managed_profiles().into_iter().collect();
        if let Some(own) = &sub.router_profile {
            replaceable.push(own.clone());
        }

        let spec = UserSpec {
            name: username.to_string(),
            password,
            profile,
            server: sub
                .router_server
                .clone()
                .or_else(|| settings.hotspot_server.clone()),
            comment: comment.to_string(),
            limit_bytes_total,
            session_timeout_secs: settings
                .session_timeout_secs
                .filter(|_| decision.state.grants_access()),
            force_profile: opts.force_profile || decision.state == AccessState::Blocked,
            replaceable_profiles: replaceable,
        };
        match self.router.upsert_user(&spec).await {
            Ok(change) if change.is_mutation() => {
                report.updated += 1;
                self.counters.incr("reconcile.update");
            }
            Ok(_) => {}
            Err(e) => self.failed(report, "user", format!("upsert user {username}: {e}")),
        }
    }

    /// Removes, then updates, then adds.
    async fn apply_plan(&self, plan: &plan::Plan, report: &mut ReconcileReport) {
        for (address, list) in &plan.remove_entries {
            match self.router.remove_entry(address, list).await {
                Ok(change) if change.is_mutation() => {
                    report.removed += 1;
                    self.counters.incr("reconcile.remove");
                }
                Ok(_) => {}
                Err(e) => self.failed(report, "address_list", format!("remove {address} from {list}: {e}")),
            }
        }
        for mac in &plan.remove_bindings {
            match self.router.remove_binding_by_mac(mac).await {
                Ok(change) if change.is_mutation() => {
                    report.removed += 1;
                    self.counters.incr("reconcile.remove");
                }
                Ok(_) => {}
                Err(e) => self.failed(report, "binding", format!("remove binding {mac}: {e}")),
            }
        }
        for spec in &plan.update_entries {
            match self.router.upsert_entry(spec).await {
                Ok(change) if change.is_mutation() => {
                    report.updated += 1;
                    self.counters.incr("reconcile.update");
                }
                Ok(_) => {}
                Err(e) => self.failed(report, "address_list", format!("update {}: {e}", spec.address)),
            }
        }
        for spec in &plan.upsert_bindings {
            match self.router.upsert_binding(spec).await {
                Ok(change) if change.is_mutation() => {
                    report.updated += 1;
                    self.counters.incr("reconcile.update");
                }
                Ok(_) => {}
                Err(e) => self.failed(report, "binding", format!("binding {}: {e}", spec.mac)),
            }
        }
        for spec in &plan.add_entries {
            match self.router.upsert_entry(spec).await {
                Ok(change) if change.is_mutation() => {
                    report.added += 1;
                    self.counters.incr("reconcile.add");
                }
                Ok(_) => {}
                Err(e) => self.failed(
                    report,
                    "address_list",
                    format!("add {} to {}: {e}", spec.address, spec.list),
                ),
            }
        }
    }

    /// Drop live sessions and hotspot hosts of devices without access.
    async fn evict_sessions(&self, targets: &[DeviceTarget], report: &mut ReconcileReport) {
        for target in targets {
            if let Some(ip) = &target.ip {
                match self.router.remove_by_ip(ip).await {
                    Ok(change) if change.is_mutation() => report.removed += 1,
                    Ok(_) => {}
                    Err(e) => self.failed(report, "session", format!("kick {ip}: {e}")),
                }
            }
            match self.router.remove_host_by_mac(&target.mac).await {
                Ok(change) if change.is_mutation() => report.removed += 1,
                Ok(_) => {}
                Err(e) => self.failed(report, "host", format!("remove host {}: {e}", target.mac)),
            }
        }
    }

    /// Remove the router user of a subscriber that no longer exists.
    pub async fn purge(&self, subscriber: &Subscriber, country_code: &str) -> Result<()> {
        let _guard = self.locks.lock(&subscriber.id).await;
        let username = local_form(&subscriber.phone, country_code);
        self.router.purge_user(&username).await?;
        Ok(())
    }
}

/// Devices grouped by owner.
pub(crate) fn by_subscriber(devices: Vec<Device>) -> BTreeMap<String, Vec<Device>> {
    let mut grouped: BTreeMap<String, Vec<Device>> = BTreeMap::new();
    for device in devices {
        grouped
            .entry(device.subscriber_id.clone())
            .or_default()
            .push(device);
    }
    grouped
}
