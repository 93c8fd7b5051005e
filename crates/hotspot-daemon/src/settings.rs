//! Runtime settings store.
//!
//! Key/value rows in the `settings` table. Secret keys are sealed with the
//! settings [`SecretBox`] before they reach the database. Reads go through a
//! short-lived `moka` cache; a write invalidates its key. A key with no row
//! falls back to the process environment variable of the same name.
//!
//! [`HotspotSettings::load`] turns the store into one typed snapshot for the
//! engines.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hotspot_core::order_id::{DEFAULT_DEBT_PREFIX, DEFAULT_PURCHASE_PREFIX};
use hotspot_core::phone::DEFAULT_COUNTRY_CODE;
use hotspot_core::{AccessState, PolicyConfig, Role};
use hotspot_crypto::SecretBox;
use hotspot_routeros::BindingType;
use moka::future::Cache;
use tracing::warn;

use crate::error::{HotspotError, Result};
use crate::storage::Database;

/// Keys whose values are encrypted at rest.
pub const SECRET_KEYS: &[&str] = &["MIKROTIK_PASSWORD", "PAYMENT_SERVER_KEY", "WHATSAPP_API_KEY"];

const CACHE_TTL: Duration = Duration::from_secs(30);

type EnvSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.contains(&key)
}

#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
    secret_box: Option<Arc<SecretBox>>,
    cache: Cache<String, Option<String>>,
    env: EnvSource,
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("encrypted", &self.secret_box.is_some())
            .finish_non_exhaustive()
    }
}

impl SettingsStore {
    pub fn new(db: Database, secret_box: Option<SecretBox>) -> Self {
        Self::with_env(db, secret_box, |key| std::env::var(key).ok())
    }

    /// Store with a custom environment fallback.
    pub fn with_env(
        db: Database,
        secret_box: Option<SecretBox>,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            db,
            secret_box: secret_box.map(Arc::new),
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(CACHE_TTL)
                .build(),
            env: Arc::new(env),
        }
    }

    /// Raw lookup: stored row, then environment.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.get(key).await {
            return Ok(cached);
        }

        let value = match self.db.get_setting(key).await? {
            Some(row) if row.is_secret != 0 || SecretBox::is_sealed(&row.value) => {
                let secret_box = self.secret_box.as_ref().ok_or_else(|| {
                    HotspotError::ConfigMissing(format!(
                        "SETTINGS_PASSPHRASE (needed to read {key})"
                    ))
                })?;
                Some(secret_box.open(&row.value)?)
            }
            Some(row) => Some(row.value),
            None => (self.env)(key),
        };
        let value = value.filter(|v| !v.trim().is_empty());

        self.cache.insert(key.to_string(), value.clone()).await;
        Ok(value)
    }

    pub async fn get_string_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_string(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    /// A setting that must be present.
    pub async fn require(&self, key: &str) -> Result<String> {
        self.get_string(key)
            .await?
            .ok_or_else(|| HotspotError::ConfigMissing(key.to_string()))
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.parsed(key).await?.unwrap_or(default))
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.parsed(key).await?.unwrap_or(default))
    }

    pub async fn get_opt_i64(&self, key: &str) -> Result<Option<i64>> {
        self.parsed(key).await
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.get_string(key).await? else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => {
                warn!(key, value = %raw, "Unparseable boolean setting, using default");
                Ok(default)
            }
        }
    }

    /// Comma-separated list; empty entries dropped.
    pub async fn get_list(&self, key: &str, default: &[&str]) -> Result<Vec<String>> {
        Ok(self.get_string(key).await?.map_or_else(
            || default.iter().map(ToString::to_string).collect(),
            |raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            },
        ))
    }

    async fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get_string(key).await? else {
            return Ok(None);
        };
        if let Ok(v) = raw.trim().parse::<T>() {
            Ok(Some(v))
        } else {
            warn!(key, value = %raw, "Unparseable numeric setting, using default");
            Ok(None)
        }
    }

    /// Store a value. Secret keys are sealed first.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let secret = is_secret_key(key);
        let stored = if secret {
            let secret_box = self
                .secret_box
                .as_ref()
                .ok_or_else(|| HotspotError::ConfigMissing("SETTINGS_PASSPHRASE".into()))?;
            secret_box.seal(value)?
        } else {
            value.to_string()
        };
        self.db.put_setting(key, &stored, secret).await?;
        self.cache.invalidate(key).await;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.db.delete_setting(key).await?;
        self.cache.invalidate(key).await;
        Ok(removed)
    }

    /// Every stored key with secrets masked.
    pub async fn list_masked(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .db
            .list_settings()
            .await?
            .into_iter()
            .map(|row| {
                let shown = if row.is_secret != 0 {
                    "********".to_string()
                } else {
                    row.value
                };
                (row.key, shown)
            })
            .collect())
    }
}

/// Retention for the append-only logs. Unset means keep forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retention {
    pub transaction_event_days: Option<i64>,
    pub mutation_event_days: Option<i64>,
}

/// Router connection settings.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub host: Option<String>,
    pub username: String,
    pub password: Option<String>,
    pub use_tls: bool,
    pub accept_invalid_certs: bool,
}

impl RouterSettings {
    pub fn base_url(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        if host.starts_with("http://") || host.starts_with("https://") {
            return Some(host.to_string());
        }
        let scheme = if self.use_tls { "https" } else { "http" };
        Some(format!("{scheme}://{host}"))
    }
}

/// Typed snapshot of everything the engines read.
#[derive(Debug, Clone)]
pub struct HotspotSettings {
    pub policy: PolicyConfig,
    pub country_code: String,
    /// Total debt at which a subscriber is blocked. Zero disables the cap.
    pub debt_limit_mb: f64,
    /// Debt above which the end-of-month sweep blocks.
    pub debt_eom_threshold_mb: f64,
    pub debt_block_exempt_roles: Vec<Role>,
    pub purchase_prefix: String,
    /// First entry is used for new debt orders.
    pub debt_prefixes: Vec<String>,
    pub granted_binding_type: BindingType,
    pub hotspot_server: Option<String>,
    pub session_timeout_secs: Option<u64>,
    pub unauthorized_timeout: String,
    pub unauthorized_min_uptime_secs: u64,
    pub unauthorized_exempt: Vec<String>,
    pub max_devices_per_user: usize,
    pub dhcp_static_leases: bool,
    pub dhcp_server: Option<String>,
    pub poll_throttle_secs: i64,
    pub payment_expiry_minutes: i64,
    pub retention: Retention,
    pub router: RouterSettings,
    pub payment_base_url: String,
    pub whatsapp_base_url: Option<String>,
}

impl Default for HotspotSettings {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            debt_limit_mb: 1024.0,
            debt_eom_threshold_mb: 0.0,
            debt_block_exempt_roles: vec![Role::Admin, Role::SuperAdmin],
            purchase_prefix: DEFAULT_PURCHASE_PREFIX.to_string(),
            debt_prefixes: vec![DEFAULT_DEBT_PREFIX.to_string()],
            granted_binding_type: BindingType::Bypassed,
            hotspot_server: None,
            session_timeout_secs: None,
            unauthorized_timeout: "1h".to_string(),
            unauthorized_min_uptime_secs: 300,
            unauthorized_exempt: Vec::new(),
            max_devices_per_user: 1,
            dhcp_static_leases: false,
            dhcp_server: None,
            poll_throttle_secs: 8,
            payment_expiry_minutes: 60,
            retention: Retention::default(),
            router: RouterSettings {
                host: None,
                username: "admin".to_string(),
                password: None,
                use_tls: true,
                accept_invalid_certs: true,
            },
            payment_base_url: "https://api.sandbox.midtrans.com".to_string(),
            whatsapp_base_url: None,
        }
    }
}

async fn state_names(
    store: &SettingsStore,
    prefix: &str,
    defaults: &hotspot_core::policy::StateNames,
) -> Result<hotspot_core::policy::StateNames> {
    let mut names = defaults.clone();
    for state in AccessState::ALL {
        let key = format!("{prefix}_{}", state.as_str());
        let value = store.get_string_or(&key, defaults.get(state)).await?;
        match state {
            AccessState::Active => names.active = value,
            AccessState::Unlimited => names.unlimited = value,
            AccessState::Fup => names.fup = value,
            AccessState::Habis => names.habis = value,
            AccessState::Expired => names.expired = value,
            AccessState::Inactive => names.inactive = value,
            AccessState::Blocked => names.blocked = value,
        }
    }
    Ok(names)
}

impl HotspotSettings {
    pub async fn load(store: &SettingsStore) -> Result<Self> {
        let d = Self::default();

        let mut policy = PolicyConfig {
            fup_threshold: store
                .get_f64("FUP_THRESHOLD", d.policy.fup_threshold)
                .await?,
            profiles: state_names(store, "PROFILE", &d.policy.profiles).await?,
            lists: state_names(store, "LIST", &d.policy.lists).await?,
            role_profiles: BTreeMap::new(),
            unauthorized_list: store
                .get_string_or("LIST_UNAUTHORIZED", &d.policy.unauthorized_list)
                .await?,
        };
        for role in [Role::User, Role::Komandan, Role::Admin, Role::SuperAdmin] {
            if let Some(profile) = store
                .get_string(&format!("PROFILE_ROLE_{}", role.as_str()))
                .await?
            {
                policy.role_profiles.insert(role, profile);
            }
        }

        let exempt_roles = store
            .get_list("DEBT_BLOCK_EXEMPT_ROLES", &["ADMIN", "SUPER_ADMIN"])
            .await?
            .iter()
            .filter_map(|r| r.parse::<Role>().ok())
            .collect();

        let granted_binding_type = store
            .get_string_or("IP_BINDING_TYPE_GRANTED", d.granted_binding_type.as_str())
            .await?
            .parse()
            .unwrap_or(BindingType::Bypassed);

        let mut debt_prefixes = store
            .get_list("DEBT_ORDER_PREFIXES", &[DEFAULT_DEBT_PREFIX])
            .await?;
        if debt_prefixes.is_empty() {
            debt_prefixes = d.debt_prefixes.clone();
        }

        Ok(Self {
            policy,
            country_code: store
                .get_string_or("PHONE_COUNTRY_CODE", &d.country_code)
                .await?,
            debt_limit_mb: store.get_f64("QUOTA_DEBT_LIMIT_MB", d.debt_limit_mb).await?,
            debt_eom_threshold_mb: store
                .get_f64("QUOTA_DEBT_EOM_THRESHOLD_MB", d.debt_eom_threshold_mb)
                .await?,
            debt_block_exempt_roles: exempt_roles,
            purchase_prefix: store
                .get_string_or("PURCHASE_ORDER_PREFIX", &d.purchase_prefix)
                .await?,
            debt_prefixes,
            granted_binding_type,
            hotspot_server: store.get_string("MIKROTIK_HOTSPOT_SERVER").await?,
            session_timeout_secs: store
                .get_opt_i64("SESSION_TIMEOUT_SECS")
                .await?
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0),
            unauthorized_timeout: store
                .get_string_or("UNAUTHORIZED_LIST_TIMEOUT", &d.unauthorized_timeout)
                .await?,
            unauthorized_min_uptime_secs: store
                .get_opt_i64("UNAUTHORIZED_MIN_UPTIME_SECS")
                .await?
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(d.unauthorized_min_uptime_secs),
            unauthorized_exempt: store.get_list("UNAUTHORIZED_EXEMPT_IPS", &[]).await?,
            max_devices_per_user: store
                .get_opt_i64("MAX_DEVICES_PER_USER")
                .await?
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(d.max_devices_per_user),
            dhcp_static_leases: store
                .get_bool("DHCP_STATIC_LEASE_ENABLED", d.dhcp_static_leases)
                .await?,
            dhcp_server: store.get_string("DHCP_SERVER_NAME").await?,
            poll_throttle_secs: store
                .get_i64("PAYMENT_POLL_THROTTLE_SECS", d.poll_throttle_secs)
                .await?
                .clamp(5, 60),
            payment_expiry_minutes: store
                .get_i64("PAYMENT_EXPIRY_MINUTES", d.payment_expiry_minutes)
                .await?
                .max(1),
            retention: Retention {
                transaction_event_days: store
                    .get_opt_i64("RETENTION_TRANSACTION_EVENTS_DAYS")
                    .await?
                    .filter(|d| *d > 0),
                mutation_event_days: store
                    .get_opt_i64("RETENTION_QUOTA_MUTATION_EVENTS_DAYS")
                    .await?
                    .filter(|d| *d > 0),
            },
            router: RouterSettings {
                host: store.get_string("MIKROTIK_HOST").await?,
                username: store
                    .get_string_or("MIKROTIK_USERNAME", &d.router.username)
                    .await?,
                password: store.get_string("MIKROTIK_PASSWORD").await?,
                use_tls: store.get_bool("MIKROTIK_USE_TLS", d.router.use_tls).await?,
                accept_invalid_certs: store
                    .get_bool("MIKROTIK_ACCEPT_INVALID_CERTS", d.router.accept_invalid_certs)
                    .await?,
            },
            payment_base_url: store
                .get_string_or("PAYMENT_BASE_URL", &d.payment_base_url)
                .await?,
            whatsapp_base_url: store.get_string("WHATSAPP_BASE_URL").await?,
        })
    }

    /// Prefix for newly issued debt orders.
    pub fn debt_prefix(&self) -> &str {
        self.debt_prefixes
            .first()
            .map_or(DEFAULT_DEBT_PREFIX, String::as_str)
    }

    pub fn is_debt_block_exempt(&self, role: Role) -> bool {
        self.debt_block_exempt_roles.contains(&role)
    }

    /// Whether `ip` falls in one of the exempt addresses or IPv4 ranges.
    pub fn is_exempt_ip(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return self.unauthorized_exempt.iter().any(|e| e == ip);
        };
        self.unauthorized_exempt
            .iter()
            .any(|entry| ipv4_in_range(addr, entry))
    }
}

/// `10.0.0.5`, `10.0.0.0/24` or `10.0.0.10-10.0.0.20`.
fn ipv4_in_range(addr: Ipv4Addr, entry: &str) -> bool {
    let entry = entry.trim();
    if let Some((net, bits)) = entry.split_once('/') {
        let (Ok(net), Ok(bits)) = (net.parse::<Ipv4Addr>(), bits.parse::<u32>()) else {
            return false;
        };
        if bits > 32 {
            return false;
        }
        let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
        return u32::from(addr) & mask == u32::from(net) & mask;
    }
    if let Some((lo, hi)) = entry.split_once('-') {
        let (Ok(lo), Ok(hi)) = (lo.trim().parse::<Ipv4Addr>(), hi.trim().parse::<Ipv4Addr>()) else {
            return false;
        };
        return (u32::from(lo)..=u32::from(hi)).contains(&u32::from(addr));
    }
    entry.parse::<Ipv4Addr>().is_ok_and(|single| single == addr)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store(env: &'static [(&'static str, &'static str)]) -> SettingsStore {
        let db = Database::open_in_memory().await.unwrap();
        let secret_box = SecretBox::from_passphrase("test-passphrase").unwrap();
        SettingsStore::with_env(db, Some(secret_box), move |key| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        })
    }

    #[tokio::test]
    async fn stored_value_beats_env_beats_default() {
        let s = store(&[("FUP_THRESHOLD", "0.2"), ("MAX_DEVICES_PER_USER", "3")]).await;
        assert!((s.get_f64("FUP_THRESHOLD", 0.05).await.unwrap() - 0.2).abs() < f64::EPSILON);

        s.set("FUP_THRESHOLD", "0.1").await.unwrap();
        assert!((s.get_f64("FUP_THRESHOLD", 0.05).await.unwrap() - 0.1).abs() < f64::EPSILON);

        assert_eq!(s.get_i64("MISSING", 7).await.unwrap(), 7);
        assert_eq!(s.get_i64("MAX_DEVICES_PER_USER", 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn secrets_are_sealed_at_rest() {
        let s = store(&[]).await;
        s.set("PAYMENT_SERVER_KEY", "SB-Mid-server-xyz").await.unwrap();

        let row = s.db.get_setting("PAYMENT_SERVER_KEY").await.unwrap().unwrap();
        assert!(SecretBox::is_sealed(&row.value));
        assert!(!row.value.contains("SB-Mid"));
        assert_eq!(
            s.require("PAYMENT_SERVER_KEY").await.unwrap(),
            "SB-Mid-server-xyz"
        );
        assert_eq!(
            s.list_masked().await.unwrap().get("PAYMENT_SERVER_KEY").unwrap(),
            "********"
        );
    }

    #[tokio::test]
    async fn missing_required_setting() {
        let s = store(&[]).await;
        let err = s.require("MIKROTIK_HOST").await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_MISSING");
    }

    #[tokio::test]
    async fn set_invalidates_cached_read() {
        let s = store(&[]).await;
        assert!(s.get_string("LIST_ACTIVE").await.unwrap().is_none());
        s.set("LIST_ACTIVE", "klien-aktif").await.unwrap();
        assert_eq!(
            s.get_string("LIST_ACTIVE").await.unwrap().as_deref(),
            Some("klien-aktif")
        );
        s.delete("LIST_ACTIVE").await.unwrap();
        assert!(s.get_string("LIST_ACTIVE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn typed_snapshot_reads_overrides() {
        let s = store(&[("DEBT_BLOCK_EXEMPT_ROLES", "SUPER_ADMIN, KOMANDAN")]).await;
        s.set("LIST_HABIS", "klien-habis").await.unwrap();
        s.set("PROFILE_ROLE_KOMANDAN", "komandan").await.unwrap();
        s.set("PAYMENT_POLL_THROTTLE_SECS", "1").await.unwrap();

        let hs = HotspotSettings::load(&s).await.unwrap();
        assert_eq!(hs.policy.lists.habis, "klien-habis");
        assert_eq!(hs.policy.lists.unlimited, "active");
        assert_eq!(
            hs.policy.role_profiles.get(&Role::Komandan).map(String::as_str),
            Some("komandan")
        );
        assert!(hs.is_debt_block_exempt(Role::Komandan));
        assert!(!hs.is_debt_block_exempt(Role::Admin));
        assert_eq!(hs.poll_throttle_secs, 5);
        assert_eq!(hs.retention, Retention::default());
        assert_eq!(hs.debt_prefix(), "DEBT");
    }

    #[test]
    fn exempt_ranges() {
        let hs = HotspotSettings {
            unauthorized_exempt: vec![
                "10.5.50.1".into(),
                "192.168.88.0/24".into(),
                "172.16.0.10-172.16.0.20".into(),
            ],
            ..HotspotSettings::default()
        };
        assert!(hs.is_exempt_ip("10.5.50.1"));
        assert!(!hs.is_exempt_ip("10.5.50.2"));
        assert!(hs.is_exempt_ip("192.168.88.77"));
        assert!(hs.is_exempt_ip("172.16.0.15"));
        assert!(!hs.is_exempt_ip("172.16.0.21"));
        assert!(!hs.is_exempt_ip("not-an-ip"));
    }

    #[test]
    fn router_base_url() {
        let mut router = HotspotSettings::default().router;
        assert!(router.base_url().is_none());
        router.host = Some("10.0.0.1".into());
        assert_eq!(router.base_url().as_deref(), Some("https://10.0.0.1"));
        router.use_tls = false;
        assert_eq!(router.base_url().as_deref(), Some("http://10.0.0.1"));
    }
}
