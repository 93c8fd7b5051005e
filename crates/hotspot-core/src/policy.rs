//! Hotspot policy engine.
//!
//! [`decide`] maps a subscriber snapshot and the current time to exactly one
//! access state plus the router profile and address-list that realise it.
//! Rules are evaluated top-down and the first match wins:
//!
//! 1. not approved, inactive or blocked: `BLOCKED` (blocked wins) or `INACTIVE`
//! 2. unlimited and not expired: `UNLIMITED`
//! 3. expired: `EXPIRED`
//! 4. nothing left: `HABIS`
//! 5. remaining share at or under the FUP threshold: `FUP`
//! 6. `ACTIVE`

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AccessState, ApprovalStatus, Role, Subscriber};

/// Default share of purchased quota below which a subscriber is throttled.
pub const DEFAULT_FUP_THRESHOLD: f64 = 0.05;

/// One name per access state. UNLIMITED has its own profile but shares the
/// `active` address-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNames {
    pub active: String,
    pub unlimited: String,
    pub fup: String,
    pub habis: String,
    pub expired: String,
    pub inactive: String,
    pub blocked: String,
}

impl StateNames {
    pub fn get(&self, state: AccessState) -> &str {
        match state {
            AccessState::Active => &self.active,
            AccessState::Unlimited => &self.unlimited,
            AccessState::Fup => &self.fup,
            AccessState::Habis => &self.habis,
            AccessState::Expired => &self.expired,
            AccessState::Inactive => &self.inactive,
            AccessState::Blocked => &self.blocked,
        }
    }

    fn uniform(f: impl Fn(AccessState) -> String) -> Self {
        Self {
            active: f(AccessState::Active),
            unlimited: f(AccessState::Unlimited),
            fup: f(AccessState::Fup),
            habis: f(AccessState::Habis),
            expired: f(AccessState::Expired),
            inactive: f(AccessState::Inactive),
            blocked: f(AccessState::Blocked),
        }
    }
}

/// Everything the engine reads besides the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub fup_threshold: f64,
    pub profiles: StateNames,
    pub lists: StateNames,
    /// Profile overrides for ACTIVE and UNLIMITED keyed by role.
    pub role_profiles: BTreeMap<Role, String>,
    /// List the unauthorized-host sweep writes to. Never produced by [`decide`].
    pub unauthorized_list: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let lower = |s: AccessState| s.as_str().to_ascii_lowercase();
        let mut lists = StateNames::uniform(lower);
        lists.unlimited = lists.active.clone();

        Self {
            fup_threshold: DEFAULT_FUP_THRESHOLD,
            profiles: StateNames::uniform(lower),
            lists,
            role_profiles: BTreeMap::new(),
            unauthorized_list: "unauthorized".to_string(),
        }
    }
}

impl PolicyConfig {
    /// Address-lists the reconciler owns for subscriber IPs.
    pub fn managed_lists(&self) -> BTreeSet<String> {
        AccessState::ALL
            .into_iter()
            .map(|s| self.lists.get(s).to_string())
            .collect()
    }

    /// Profiles the reconciler may overwrite without `force_profile`.
    pub fn managed_profiles(&self) -> BTreeSet<String> {
        AccessState::ALL
            .into_iter()
            .map(|s| self.profiles.get(s).to_string())
            .chain(self.role_profiles.values().cloned())
            .collect()
    }

    fn profile_for(&self, state: AccessState, role: Role) -> String {
        if matches!(state, AccessState::Active | AccessState::Unlimited)
            && let Some(profile) = self.role_profiles.get(&role)
        {
            return profile.clone();
        }
        self.profiles.get(state).to_string()
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub state: AccessState,
    pub router_profile: String,
    pub address_list: String,
    pub reason: String,
}

/// Evaluate the policy. Pure: no I/O, no clock reads.
pub fn decide(sub: &Subscriber, now: DateTime<Utc>, cfg: &PolicyConfig) -> Decision {
    let (state, reason) = classify(sub, now, cfg.fup_threshold);
    Decision {
        state,
        router_profile: cfg.profile_for(state, sub.role),
        address_list: cfg.lists.get(state).to_string(),
        reason,
    }
}

fn classify(sub: &Subscriber, now: DateTime<Utc>, fup_threshold: f64) -> (AccessState, String) {
    if sub.is_blocked {
        let reason = sub.blocked_reason.as_deref().unwrap_or("blocked");
        return (AccessState::Blocked, reason.to_string());
    }
    if sub.approval != ApprovalStatus::Approved {
        return (
            AccessState::Inactive,
            format!("approval {}", sub.approval.as_str().to_ascii_lowercase()),
        );
    }
    if !sub.is_active {
        return (AccessState::Inactive, "account inactive".to_string());
    }

    let expired = sub.expiry_at.is_some_and(|at| at <= now);

    if sub.is_unlimited && !expired {
        return (AccessState::Unlimited, "unlimited package".to_string());
    }
    if expired {
        return (AccessState::Expired, "package expired".to_string());
    }

    let remaining = sub.remaining_mb();
    if remaining <= 0.0 {
        return (AccessState::Habis, "quota exhausted".to_string());
    }
    if sub.purchased_mb > 0.0 && remaining / sub.purchased_mb <= fup_threshold {
        return (
            AccessState::Fup,
            format!("{remaining:.0} MB left, under fair-use threshold"),
        );
    }
    (AccessState::Active, "quota available".to_string())
}
