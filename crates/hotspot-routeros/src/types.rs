//! Typed views over RouterOS resources.
//!
//! The router speaks in flat string records (`.id`, `mac-address`, ...).
//! Snapshots convert into these structs and skip entries they cannot read.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::RouterError;

/// A raw router record: attribute name to value.
pub type Record = BTreeMap<String, String>;

/// Resource paths, relative to the REST root.
pub mod paths {
    pub const HOTSPOT_USER: &str = "ip/hotspot/user";
    pub const IP_BINDING: &str = "ip/hotspot/ip-binding";
    pub const DHCP_LEASE: &str = "ip/dhcp-server/lease";
    pub const ADDRESS_LIST: &str = "ip/firewall/address-list";
    pub const HOTSPOT_HOST: &str = "ip/hotspot/host";
    pub const HOTSPOT_ACTIVE: &str = "ip/hotspot/active";
    pub const SYSTEM_RESOURCE: &str = "system/resource";
}

/// What an idempotent command ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Updated,
    Unchanged,
    Removed,
    /// Delete of something that was already gone.
    Absent,
}

impl Change {
    /// Whether the router was actually written to.
    pub const fn is_mutation(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Removed)
    }
}

/// IP binding type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BindingType {
    #[default]
    Regular,
    Bypassed,
    Blocked,
}

impl BindingType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Bypassed => "bypassed",
            Self::Blocked => "blocked",
        }
    }
}

impl FromStr for BindingType {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "regular" => Ok(Self::Regular),
            "bypassed" => Ok(Self::Bypassed),
            "blocked" => Ok(Self::Blocked),
            other => Err(RouterError::Decode(format!("unknown binding type: {other}"))),
        }
    }
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn field<'a>(rec: &'a Record, key: &str) -> Option<&'a str> {
    rec.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn owned(rec: &Record, key: &str) -> Option<String> {
    field(rec, key).map(ToString::to_string)
}

fn flag(rec: &Record, key: &str) -> bool {
    matches!(field(rec, key), Some("true" | "yes"))
}

fn number(rec: &Record, key: &str) -> u64 {
    field(rec, key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn mac(rec: &Record) -> Option<String> {
    field(rec, "mac-address").and_then(hotspot_core::mac::try_canonical_mac)
}

/// Hotspot user as stored on the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotspotUser {
    pub id: String,
    pub name: String,
    pub profile: Option<String>,
    pub server: Option<String>,
    pub comment: Option<String>,
    pub limit_bytes_total: u64,
    pub disabled: bool,
}

impl HotspotUser {
    pub fn from_record(rec: &Record) -> Option<Self> {
        Some(Self {
            id: owned(rec, ".id")?,
            name: owned(rec, "name")?,
            profile: owned(rec, "profile"),
            server: owned(rec, "server"),
            comment: owned(rec, "comment"),
            limit_bytes_total: number(rec, "limit-bytes-total"),
            disabled: flag(rec, "disabled"),
        })
    }
}

/// Desired hotspot user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub name: String,
    pub password: String,
    pub profile: String,
    pub server: Option<String>,
    pub comment: String,
    /// `None` clears the limit.
    pub limit_bytes_total: Option<u64>,
    /// `None` clears the uptime limit.
    pub session_timeout_secs: Option<u64>,
    /// Overwrite the profile even when the current one is not replaceable.
    pub force_profile: bool,
    /// Profiles the client may overwrite without `force_profile`. An empty
    /// current profile is always replaceable.
    pub replaceable_profiles: Vec<String>,
}

/// IP binding as stored on the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBinding {
    pub id: String,
    pub mac: String,
    pub address: Option<String>,
    pub binding_type: BindingType,
    pub server: Option<String>,
    pub comment: Option<String>,
    pub disabled: bool,
}

impl IpBinding {
    pub fn from_record(rec: &Record) -> Option<Self> {
        Some(Self {
            id: owned(rec, ".id")?,
            mac: mac(rec)?,
            address: owned(rec, "address"),
            binding_type: field(rec, "type").unwrap_or("regular").parse().ok()?,
            server: owned(rec, "server"),
            comment: owned(rec, "comment"),
            disabled: flag(rec, "disabled"),
        })
    }
}

/// Desired IP binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub mac: String,
    pub address: Option<String>,
    pub binding_type: BindingType,
    pub server: Option<String>,
    pub comment: String,
}

/// DHCP lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub id: String,
    pub address: String,
    pub mac: String,
    pub comment: Option<String>,
    pub server: Option<String>,
    pub dynamic: bool,
    pub status: Option<String>,
}

impl DhcpLease {
    pub fn from_record(rec: &Record) -> Option<Self> {
        Some(Self {
            id: owned(rec, ".id")?,
            address: owned(rec, "address")?,
            mac: mac(rec)?,
            comment: owned(rec, "comment"),
            server: owned(rec, "server"),
            dynamic: flag(rec, "dynamic"),
            status: owned(rec, "status"),
        })
    }

    /// A lease the router currently honours.
    pub fn is_bound(&self) -> bool {
        self.status.as_deref().is_none_or(|s| s == "bound")
    }
}

/// Desired static lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSpec {
    pub address: String,
    pub mac: String,
    pub comment: String,
    pub server: Option<String>,
}

/// Firewall address-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressListEntry {
    pub id: String,
    pub list: String,
    pub address: String,
    pub comment: Option<String>,
    /// Remaining router-side timeout, when one was set.
    pub timeout: Option<String>,
    pub dynamic: bool,
}

impl AddressListEntry {
    pub fn from_record(rec: &Record) -> Option<Self> {
        Some(Self {
            id: owned(rec, ".id")?,
            list: owned(rec, "list")?,
            address: owned(rec, "address")?,
            comment: owned(rec, "comment"),
            timeout: owned(rec, "timeout"),
            dynamic: flag(rec, "dynamic"),
        })
    }
}

/// Desired address-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntrySpec {
    pub list: String,
    pub address: String,
    pub comment: String,
    /// RouterOS duration string. Only sent on create; the router evicts the
    /// entry itself when it runs out.
    pub timeout: Option<String>,
}

/// Hotspot host: a device currently seen by the hotspot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotspotHost {
    pub id: String,
    pub mac: String,
    pub address: Option<String>,
    pub authorized: bool,
    pub bypassed: bool,
    pub uptime_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl HotspotHost {
    pub fn from_record(rec: &Record) -> Option<Self> {
        Some(Self {
            id: owned(rec, ".id")?,
            mac: mac(rec)?,
            address: owned(rec, "address"),
            authorized: flag(rec, "authorized"),
            bypassed: flag(rec, "bypassed"),
            uptime_secs: field(rec, "uptime").and_then(parse_duration).unwrap_or(0),
            bytes_in: number(rec, "bytes-in"),
            bytes_out: number(rec, "bytes-out"),
        })
    }

    pub const fn bytes_total(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// Logged-in hotspot session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: String,
    pub user: Option<String>,
    pub address: String,
    pub mac: Option<String>,
}

impl ActiveSession {
    pub fn from_record(rec: &Record) -> Option<Self> {
        Some(Self {
            id: owned(rec, ".id")?,
            user: owned(rec, "user"),
            address: owned(rec, "address")?,
            mac: mac(rec),
        })
    }
}
