//! Shared harness: the full daemon over in-memory router, cache, provider and notifier.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;

use hotspot_core::{Counters, Package, Subscriber};
use hotspot_daemon::app::{App, AppParts};
use hotspot_daemon::cache::MemoryCache;
use hotspot_daemon::notify::RecordingNotifier;
use hotspot_daemon::payment::{MemoryProvider, Notification};
use hotspot_daemon::settings::SettingsStore;
use hotspot_daemon::storage::{Database, NewPackage};
use hotspot_routeros::{MemoryRouter, Record, RouterApi, paths};

pub const SERVER_KEY: &str = "SB-Mid-server-test";
pub const MB: u64 = 1024 * 1024;

pub struct Harness {
    pub app: App,
    pub db: Database,
    pub router: Arc<MemoryRouter>,
    pub cache: Arc<MemoryCache>,
    pub provider: Arc<MemoryProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub counters: Counters,
}

pub async fn harness() -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let router = Arc::new(MemoryRouter::memory());
    let cache = Arc::new(MemoryCache::default());
    let provider = Arc::new(MemoryProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let counters = Counters::new();
    let settings = SettingsStore::with_env(db.clone(), None, |key| {
        (key == "PAYMENT_SERVER_KEY").then(|| SERVER_KEY.to_string())
    });
    let app = App::new(AppParts {
        db: db.clone(),
        settings,
        cache: cache.clone(),
        router: router.clone(),
        provider: provider.clone(),
        notifier: notifier.clone(),
        counters: counters.clone(),
        production: true,
        admin_token: Some("token".into()),
    });
    Harness {
        app,
        db,
        router,
        cache,
        provider,
        notifier,
        counters,
    }
}

impl Harness {
    /// Register and approve a subscriber.
    pub async fn approved(&self, phone: &str, name: &str) -> Subscriber {
        let sub = self.app.register(phone, name).await.unwrap();
        self.app.approve(&sub.id, None, None, Some("admin")).await.unwrap();
        self.db.get_subscriber(&sub.id).await.unwrap()
    }

    pub async fn package(&self, quota_gb: f64, duration_days: i64, price: i64) -> Package {
        self.db
            .create_package(&NewPackage {
                name: "Paket",
                price,
                quota_gb,
                duration_days,
                router_profile: None,
            })
            .await
            .unwrap()
    }

    /// Provider-side settlement, signed the way the provider signs it.
    pub fn settlement(&self, order_id: &str) -> Notification {
        let mut n = self.provider.settle(order_id).unwrap();
        n.signature_key = Some(hotspot_crypto::provider_signature(
            &n.order_id,
            &n.status_code,
            &n.gross_amount,
            SERVER_KEY,
        ));
        n
    }

    /// Buy `package` and deliver one settlement webhook.
    pub async fn buy(&self, sub: &Subscriber, package: &Package) -> String {
        let init = self
            .app
            .payments
            .initiate_purchase(&sub.id, &package.id, "qris")
            .await
            .unwrap();
        let order_id = init.transaction.order_id;
        self.app
            .payments
            .handle_webhook(&self.settlement(&order_id))
            .await
            .unwrap();
        order_id
    }

    /// A hotspot host the router currently sees, with its byte counter.
    pub async fn seed_host(&self, mac: &str, ip: &str, bytes: u64) {
        self.router
            .transport()
            .seed(
                paths::HOTSPOT_HOST,
                Record::from([
                    ("mac-address".to_string(), mac.to_string()),
                    ("address".to_string(), ip.to_string()),
                    ("authorized".to_string(), "true".to_string()),
                    ("bytes-in".to_string(), bytes.to_string()),
                    ("bytes-out".to_string(), "0".to_string()),
                ]),
            )
            .await;
    }

    /// Managed lists `ip` currently sits in.
    pub async fn lists_of(&self, ip: &str) -> Vec<String> {
        let mut lists: Vec<String> = self
            .router
            .snapshot_list(None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.address == ip)
            .map(|e| e.list)
            .collect();
        lists.sort();
        lists
    }

    pub async fn event_count(&self, order_id: &str, kind: &str) -> usize {
        let tx = self.db.get_transaction_by_order(order_id).await.unwrap();
        self.db
            .list_transaction_events(&tx.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}
