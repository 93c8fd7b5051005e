//! Fixed-interval background tasks.
//!
//! Each tick takes `scheduler:lock:<task>` in the fast cache. A held lock skips
//! the tick; an unreachable cache runs the task anyway. Both count
//! `<task>.lock.degraded`. Tasks never return errors to the loop, they log and
//! wait for the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hotspot_core::Counters;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{KvCache, bounded};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::notify::{Notifier, send_best_effort};
use crate::payment::PaymentFlow;
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::settings::{HotspotSettings, SettingsStore};
use crate::storage::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    UsageSync,
    BindingSync,
    UnauthorizedSweep,
    PaymentPoll,
    AddressListSweep,
    DhcpRefresh,
    DebtEomSweep,
    RetentionCleanup,
}

impl Task {
    pub const ALL: [Self; 8] = [
        Self::UsageSync,
        Self::BindingSync,
        Self::UnauthorizedSweep,
        Self::PaymentPoll,
        Self::AddressListSweep,
        Self::DhcpRefresh,
        Self::DebtEomSweep,
        Self::RetentionCleanup,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::UsageSync => "usage_sync",
            Self::BindingSync => "binding_sync",
            Self::UnauthorizedSweep => "unauthorized_sweep",
            Self::PaymentPoll => "payment_poll",
            Self::AddressListSweep => "address_list_sweep",
            Self::DhcpRefresh => "dhcp_refresh",
            Self::DebtEomSweep => "debt_eom_sweep",
            Self::RetentionCleanup => "retention_cleanup",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub const fn interval(self) -> Duration {
        Duration::from_secs(match self {
            Self::UsageSync | Self::PaymentPoll => 60,
            Self::UnauthorizedSweep => 120,
            Self::BindingSync | Self::AddressListSweep => 300,
            Self::DhcpRefresh => 600,
            Self::DebtEomSweep => 3600,
            Self::RetentionCleanup => 86_400,
        })
    }

    /// Covers a run that overlaps the next tick.
    pub const fn lock_ttl(self) -> Duration {
        Duration::from_secs(self.interval().as_secs() + 30)
    }

    fn lock_key(self) -> String {
        format!("scheduler:lock:{}", self.name())
    }
}

/// Everything the tasks drive.
#[derive(Clone)]
pub struct Scheduler {
    pub db: Database,
    pub settings: SettingsStore,
    pub reconciler: Reconciler,
    pub ledger: Ledger,
    pub payments: PaymentFlow,
    pub cache: Arc<dyn KvCache>,
    pub notifier: Arc<dyn Notifier>,
    pub counters: Counters,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Run one tick of `task` under its lock.
    ///
    /// `Ok(None)` when another instance holds the lock.
    pub async fn run_task(&self, task: Task) -> Result<Option<Value>> {
        let key = task.lock_key();
        let held = match bounded(self.cache.set_nx(&key, "1", task.lock_ttl())).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(task = task.name(), "Lock held elsewhere; skipping tick");
                self.counters.incr(&format!("{}.lock.degraded", task.name()));
                return Ok(None);
            }
            Err(e) => {
                warn!(task = task.name(), error = %e, "Scheduler lock unavailable; running anyway");
                self.counters.incr(&format!("{}.lock.degraded", task.name()));
                false
            }
        };

        let result = self.execute(task).await;

        if held && let Err(e) = bounded(self.cache.delete(&key)).await {
            warn!(task = task.name(), error = %e, "Failed to release scheduler lock");
        }
        result.map(Some)
    }

    async fn execute(&self, task: Task) -> Result<Value> {
        let report = match task {
            Task::UsageSync => json!(self.reconciler.usage_sync(&self.ledger).await?),
            Task::BindingSync => json!(self.reconciler.binding_sync().await?),
            Task::UnauthorizedSweep => json!(self.reconciler.unauthorized_sweep().await?),
            Task::PaymentPoll => json!(self.payments.poll_pending().await?),
            Task::AddressListSweep => json!(self.reconciler.address_list_sweep().await?),
            Task::DhcpRefresh => json!(self.reconciler.dhcp_refresh().await?),
            Task::DebtEomSweep => self.debt_eom_sweep().await?,
            Task::RetentionCleanup => self.retention_cleanup().await?,
        };
        Ok(report)
    }

    async fn debt_eom_sweep(&self) -> Result<Value> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let blocked = self
            .ledger
            .end_of_month_sweep(&settings, Utc::now())
            .await?;
        for id in &blocked {
            if let Err(e) = self
                .reconciler
                .reconcile_subscriber(id, ReconcileOptions::default())
                .await
            {
                warn!(subscriber_id = %id, error = %e, "Reconcile after end-of-month block failed");
            }
            if let Ok(sub) = self.db.get_subscriber(id).await {
                let message = format!(
                    "Your access is blocked: outstanding debt of {:.0} MB at month end. Pay the debt to restore access.",
                    sub.total_debt_mb()
                );
                send_best_effort(self.notifier.as_ref(), &self.counters, &sub.phone, &message)
                    .await;
            }
        }
        Ok(json!({ "blocked": blocked.len() }))
    }

    /// Drop old events. A log with no retention configured is kept.
    async fn retention_cleanup(&self) -> Result<Value> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let now = Utc::now().timestamp();
        let mut transaction_events = 0;
        let mut mutation_events = 0;
        if let Some(days) = settings.retention.transaction_event_days {
            transaction_events = self
                .db
                .delete_transaction_events_before(now - days * 86_400)
                .await?;
        }
        if let Some(days) = settings.retention.mutation_event_days {
            mutation_events = self.db.delete_mutations_before(now - days * 86_400).await?;
        }
        self.reconciler.locks().prune();
        self.payments.order_locks().prune();
        if transaction_events + mutation_events > 0 {
            info!(transaction_events, mutation_events, "Retention cleanup");
        }
        Ok(json!({
            "transaction_events": transaction_events,
            "mutation_events": mutation_events,
        }))
    }

    /// One loop per task until `shutdown` flips.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        Task::ALL
            .into_iter()
            .map(|task| {
                let scheduler = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut timer = tokio::time::interval(task.interval());
                    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    timer.tick().await; // Skip first immediate tick

                    loop {
                        tokio::select! {
                            _ = timer.tick() => {
                                match scheduler.run_task(task).await {
                                    Ok(Some(report)) => debug!(task = task.name(), %report, "Task finished"),
                                    Ok(None) => {}
                                    Err(e) => {
                                        warn!(task = task.name(), error = %e, "Task failed");
                                        scheduler.counters.incr(&format!("{}.failed", task.name()));
                                    }
                                }
                            }
                            _ = shutdown.changed() => {
                                debug!(task = task.name(), "Scheduler task shutting down");
                                return;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
