//! Device Binding Registry.
//!
//! Maps MAC addresses to subscribers. A MAC belongs to at most one live device
//! row; moving it to another subscriber while the incumbent still holds an
//! authorized binding needs explicit confirmation.

use chrono::{DateTime, Utc};
use hotspot_core::mac::canonical_mac;
use hotspot_core::phone::redact;
use hotspot_core::{ApprovalStatus, Counters};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{HotspotError, Result};
use crate::locks::KeyedLocks;
use crate::settings::HotspotSettings;
use crate::storage::{Database, Device};

pub const AUDIT_DEVICE_TAKEOVER: &str = "device_takeover";
pub const AUDIT_DEVICE_REVOKED: &str = "device_revoked";

/// What a login binding changed.
#[derive(Debug, Clone)]
pub struct BindingOutcome {
    pub device: Device,
    /// Subscribers whose router state must be reconciled, in order.
    pub reconcile: Vec<String>,
    /// Devices revoked to stay within the per-subscriber limit.
    pub evicted: Vec<Device>,
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    db: Database,
    counters: Counters,
    /// Serializes bindings per canonical MAC.
    mac_locks: KeyedLocks,
}

impl DeviceRegistry {
    pub fn new(db: Database, counters: Counters) -> Self {
        Self {
            db,
            counters,
            mac_locks: KeyedLocks::new(),
        }
    }

    /// Bind `mac` to the subscriber logging in from `ip`.
    pub async fn apply_binding_for_login(
        &self,
        subscriber_id: &str,
        mac: &str,
        ip: Option<&str>,
        confirm_takeover: bool,
        settings: &HotspotSettings,
        now: DateTime<Utc>,
    ) -> Result<BindingOutcome> {
        let mac = canonical_mac(mac)?;
        let _guard = self.mac_locks.lock(&mac).await;
        let subscriber = self.db.get_subscriber(subscriber_id).await?;
        if subscriber.approval != ApprovalStatus::Approved {
            return Err(HotspotError::Validation(
                "Subscriber is not approved".into(),
            ));
        }

        let Some(existing) = self.db.get_device_by_mac(&mac).await? else {
            let evicted = self.make_room(subscriber_id, None, settings, now).await?;
            let device = self.db.insert_device(subscriber_id, &mac, ip, now).await?;
            info!(subscriber_id, mac = %mac, "Device bound");
            return Ok(BindingOutcome {
                device,
                reconcile: vec![subscriber_id.to_string()],
                evicted,
            });
        };

        if existing.subscriber_id == subscriber_id {
            let evicted = if existing.authorized() {
                Vec::new()
            } else {
                self.make_room(subscriber_id, Some(&existing.id), settings, now)
                    .await?
            };
            let device = self
                .db
                .claim_device(&existing.id, subscriber_id, ip, now)
                .await?;
            return Ok(BindingOutcome {
                device,
                reconcile: vec![subscriber_id.to_string()],
                evicted,
            });
        }

        let incumbent = self.db.get_subscriber(&existing.subscriber_id).await?;
        if existing.authorized() && !confirm_takeover {
            self.counters.incr("device.takeover.required");
            return Err(HotspotError::DeviceTakeoverRequired {
                incumbent: redact(&incumbent.phone, &settings.country_code),
            });
        }

        let evicted = self.make_room(subscriber_id, None, settings, now).await?;
        let device = self
            .db
            .claim_device(&existing.id, subscriber_id, ip, now)
            .await?;
        if existing.authorized() {
            self.db
                .record_audit(
                    AUDIT_DEVICE_TAKEOVER,
                    Some(subscriber_id),
                    Some(&incumbent.id),
                    &json!({
                        "device_id": device.id,
                        "mac": mac,
                        "from_subscriber": incumbent.id,
                        "to_subscriber": subscriber_id,
                    }),
                )
                .await?;
            self.counters.incr("device.takeover");
            warn!(mac = %mac, from = %incumbent.id, to = subscriber_id, "Device taken over");
        }

        Ok(BindingOutcome {
            device,
            reconcile: vec![incumbent.id, subscriber_id.to_string()],
            evicted,
        })
    }

    /// Revoke authorization of one device.
    pub async fn revoke(
        &self,
        device_id: &str,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let device = self.db.revoke_device(device_id, now).await?;
        self.db
            .record_audit(
                AUDIT_DEVICE_REVOKED,
                actor,
                Some(&device.subscriber_id),
                &json!({ "device_id": device.id, "mac": device.mac }),
            )
            .await?;
        info!(device_id, mac = %device.mac, "Device revoked");
        Ok(device)
    }

    /// Revoke least recently seen devices until one more fits.
    async fn make_room(
        &self,
        subscriber_id: &str,
        keep: Option<&str>,
        settings: &HotspotSettings,
        now: DateTime<Utc>,
    ) -> Result<Vec<Device>> {
        let limit = settings.max_devices_per_user.max(1);
        let mut devices: Vec<Device> = self
            .db
            .list_authorized_devices(subscriber_id)
            .await?
            .into_iter()
            .filter(|d| Some(d.id.as_str()) != keep)
            .collect();
        devices.sort_by_key(|d| d.last_seen_at);

        let mut evicted = Vec::new();
        while devices.len() >= limit {
            let oldest = devices.remove(0);
            evicted.push(self.revoke(&oldest.id, Some("device_limit"), now).await?);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::Approval;
    use hotspot_core::{Role, Subscriber};

    async fn approved(db: &Database, phone: &str) -> Subscriber {
        let sub = db.create_subscriber(phone, "x", Role::User).await.unwrap();
        db.approve_subscriber(
            &sub.id,
            &Approval {
                hotspot_password: "123456",
                router_profile: None,
                router_server: None,
                approved_by: None,
            },
        )
        .await
        .unwrap()
    }

    async fn setup() -> (DeviceRegistry, Database) {
        let db = Database::open_in_memory().await.unwrap();
        (DeviceRegistry::new(db.clone(), Counters::new()), db)
    }

    #[tokio::test]
    async fn takeover_needs_confirmation() {
        let (reg, db) = setup().await;
        let settings = HotspotSettings::default();
        let d = approved(&db, "+6281100001234").await;
        let e = approved(&db, "+6281200005678").await;
        let now = Utc::now();

        reg.apply_binding_for_login(&d.id, "aa-bb-cc-dd-ee-ff", Some("10.0.0.2"), false, &settings, now)
            .await
            .unwrap();

        let err = reg
            .apply_binding_for_login(&e.id, "AA:BB:CC:DD:EE:FF", Some("10.0.0.3"), false, &settings, now)
            .await
            .unwrap_err();
        match err {
            HotspotError::DeviceTakeoverRequired { incumbent } => {
                assert!(incumbent.ends_with("1234"));
                assert!(incumbent.contains('*'));
            }
            other => panic!("unexpected {other:?}"),
        }

        let out = reg
            .apply_binding_for_login(&e.id, "AA:BB:CC:DD:EE:FF", Some("10.0.0.3"), true, &settings, now)
            .await
            .unwrap();
        assert_eq!(out.device.subscriber_id, e.id);
        assert_eq!(out.reconcile, vec![d.id.clone(), e.id.clone()]);
        assert!(db.list_authorized_devices(&d.id).await.unwrap().is_empty());
        assert_eq!(
            db.list_audit_events(AUDIT_DEVICE_TAKEOVER).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn revoked_device_moves_without_confirmation() {
        let (reg, db) = setup().await;
        let settings = HotspotSettings::default();
        let d = approved(&db, "+6281100001234").await;
        let e = approved(&db, "+6281200005678").await;
        let now = Utc::now();

        let first = reg
            .apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:FF", None, false, &settings, now)
            .await
            .unwrap();
        reg.revoke(&first.device.id, Some("admin"), now).await.unwrap();

        let out = reg
            .apply_binding_for_login(&e.id, "AA:BB:CC:DD:EE:FF", None, false, &settings, now)
            .await
            .unwrap();
        assert!(out.device.authorized());
        assert_eq!(out.device.subscriber_id, e.id);
        assert!(db.list_audit_events(AUDIT_DEVICE_TAKEOVER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_first_logins_converge_on_one_row() {
        let (reg, db) = setup().await;
        let settings = HotspotSettings::default();
        let d = approved(&db, "+6281100001234").await;
        let now = Utc::now();

        let (a, b) = tokio::join!(
            reg.apply_binding_for_login(&d.id, "aa-bb-cc-dd-ee-ff", Some("10.0.0.2"), false, &settings, now),
            reg.apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:FF", Some("10.0.0.2"), false, &settings, now),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.device.id, b.device.id);
        assert_eq!(db.list_authorized_devices(&d.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_logins_from_two_subscribers_need_takeover() {
        let (reg, db) = setup().await;
        let settings = HotspotSettings::default();
        let d = approved(&db, "+6281100001234").await;
        let e = approved(&db, "+6281200005678").await;
        let now = Utc::now();

        let (a, b) = tokio::join!(
            reg.apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:FF", None, false, &settings, now),
            reg.apply_binding_for_login(&e.id, "AA:BB:CC:DD:EE:FF", None, false, &settings, now),
        );
        let (won, lost) = if a.is_ok() { (a, b) } else { (b, a) };
        let winner = won.unwrap().device.subscriber_id;
        assert!(matches!(
            lost,
            Err(HotspotError::DeviceTakeoverRequired { .. })
        ));
        let loser = if winner == d.id { &e.id } else { &d.id };
        assert_eq!(db.list_authorized_devices(&winner).await.unwrap().len(), 1);
        assert!(db.list_authorized_devices(loser).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_owner_refreshes_ip() {
        let (reg, db) = setup().await;
        let settings = HotspotSettings::default();
        let d = approved(&db, "+6281100001234").await;
        let now = Utc::now();
        reg.apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:FF", Some("10.0.0.2"), false, &settings, now)
            .await
            .unwrap();
        let out = reg
            .apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:FF", Some("10.0.0.9"), false, &settings, now)
            .await
            .unwrap();
        assert_eq!(out.device.last_ip.as_deref(), Some("10.0.0.9"));
        assert!(out.evicted.is_empty());
    }

    #[tokio::test]
    async fn device_limit_evicts_least_recent() {
        let (reg, db) = setup().await;
        let settings = HotspotSettings::default();
        let d = approved(&db, "+6281100001234").await;
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(5);

        let old = reg
            .apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:01", None, false, &settings, t0)
            .await
            .unwrap();
        let out = reg
            .apply_binding_for_login(&d.id, "AA:BB:CC:DD:EE:02", None, false, &settings, t1)
            .await
            .unwrap();
        assert_eq!(out.evicted.len(), 1);
        assert_eq!(out.evicted[0].id, old.device.id);

        let live = db.list_authorized_devices(&d.id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].mac, "AA:BB:CC:DD:EE:02");
    }

    #[tokio::test]
    async fn pending_subscriber_cannot_bind() {
        let (reg, db) = setup().await;
        let sub = db
            .create_subscriber("+6281100001234", "x", Role::User)
            .await
            .unwrap();
        assert!(
            reg.apply_binding_for_login(
                &sub.id,
                "AA:BB:CC:DD:EE:FF",
                None,
                false,
                &HotspotSettings::default(),
                Utc::now()
            )
            .await
            .is_err()
        );
    }
}
