//! Pure diff between desired and observed router state for one subscriber.

use std::collections::{BTreeMap, BTreeSet};

use hotspot_core::AccessState;
use hotspot_routeros::{AddressEntrySpec, AddressListEntry, BindingSpec, BindingType, IpBinding};

/// `user=<local-phone>|uid=<id>|role=<role>|state=<STATE>`
pub fn subscriber_comment(username: &str, uid: &str, role: &str, state: AccessState) -> String {
    format!("user={username}|uid={uid}|role={role}|state={state}")
}

/// The `uid=` field of a comment written by [`subscriber_comment`].
pub fn comment_uid(comment: &str) -> Option<&str> {
    comment
        .split('|')
        .find_map(|part| part.strip_prefix("uid="))
        .filter(|uid| !uid.is_empty())
}

fn tagged(comment: Option<&str>, uid: &str) -> bool {
    comment.and_then(comment_uid) == Some(uid)
}

/// A device the subscriber is authorized to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub mac: String,
    /// Current IP, when the router or the database knows one.
    pub ip: Option<String>,
}

/// Everything the diff needs, already read.
#[derive(Debug)]
pub struct PlanInput<'a> {
    pub uid: &'a str,
    pub comment: &'a str,
    pub address_list: &'a str,
    pub binding_type: BindingType,
    pub server: Option<&'a str>,
    pub devices: &'a [DeviceTarget],
    pub managed_lists: &'a BTreeSet<String>,
    pub unauthorized_list: &'a str,
    /// Entries of every list.
    pub entries: &'a [AddressListEntry],
    pub bindings: &'a [IpBinding],
}

/// Router commands that take the subscriber to its desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// `(address, list)` pairs, applied first.
    pub remove_entries: Vec<(String, String)>,
    pub update_entries: Vec<AddressEntrySpec>,
    pub add_entries: Vec<AddressEntrySpec>,
    pub upsert_bindings: Vec<BindingSpec>,
    pub remove_bindings: Vec<String>,
    /// Subscriber IPs found in more than one managed list.
    pub multi_list: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.remove_entries.is_empty()
            && self.update_entries.is_empty()
            && self.add_entries.is_empty()
            && self.upsert_bindings.is_empty()
            && self.remove_bindings.is_empty()
    }
}

/// IPs that appear in more than one managed list.
pub fn multi_listed<'e>(
    entries: impl IntoIterator<Item = &'e AddressListEntry>,
    managed_lists: &BTreeSet<String>,
) -> Vec<String> {
    let mut lists_by_ip: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for entry in entries {
        if managed_lists.contains(&entry.list) {
            lists_by_ip
                .entry(entry.address.as_str())
                .or_default()
                .insert(entry.list.as_str());
        }
    }
    lists_by_ip
        .into_iter()
        .filter(|(_, lists)| lists.len() > 1)
        .map(|(ip, _)| ip.to_string())
        .collect()
}

pub fn plan(input: &PlanInput<'_>) -> Plan {
    let mut out = Plan::default();
    let ips: BTreeSet<&str> = input
        .devices
        .iter()
        .filter_map(|d| d.ip.as_deref())
        .collect();

    let ours = input.entries.iter().filter(|e| {
        ips.contains(e.address.as_str())
            && (input.managed_lists.contains(&e.list) || e.list == input.unauthorized_list)
    });
    out.multi_list = multi_listed(ours, input.managed_lists);

    let mut present: BTreeSet<&str> = BTreeSet::new();
    for entry in input.entries {
        let managed = input.managed_lists.contains(&entry.list);
        let is_ours = ips.contains(entry.address.as_str());
        if is_ours && (managed || entry.list == input.unauthorized_list) {
            if entry.list != input.address_list {
                out.remove_entries
                    .push((entry.address.clone(), entry.list.clone()));
            } else if entry.comment.as_deref() != Some(input.comment) {
                present.insert(entry.address.as_str());
                out.update_entries.push(AddressEntrySpec {
                    list: entry.list.clone(),
                    address: entry.address.clone(),
                    comment: input.comment.to_string(),
                    timeout: None,
                });
            } else {
                present.insert(entry.address.as_str());
            }
        } else if managed && tagged(entry.comment.as_deref(), input.uid) {
            // An address this subscriber no longer holds.
            out.remove_entries
                .push((entry.address.clone(), entry.list.clone()));
        }
    }

    for ip in &ips {
        if !present.contains(ip) {
            out.add_entries.push(AddressEntrySpec {
                list: input.address_list.to_string(),
                address: (*ip).to_string(),
                comment: input.comment.to_string(),
                timeout: None,
            });
        }
    }

    let by_mac: BTreeMap<&str, &IpBinding> =
        input.bindings.iter().map(|b| (b.mac.as_str(), b)).collect();
    let macs: BTreeSet<&str> = input.devices.iter().map(|d| d.mac.as_str()).collect();
    for device in input.devices {
        let current = by_mac.get(device.mac.as_str());
        let in_sync = current.is_some_and(|b| {
            b.binding_type == input.binding_type
                && b.comment.as_deref() == Some(input.comment)
                && (input.server.is_none() || b.server.as_deref() == input.server)
        });
        if !in_sync {
            out.upsert_bindings.push(BindingSpec {
                mac: device.mac.clone(),
                address: None,
                binding_type: input.binding_type,
                server: input.server.map(String::from),
                comment: input.comment.to_string(),
            });
        }
    }
    for binding in input.bindings {
        if tagged(binding.comment.as_deref(), input.uid) && !macs.contains(binding.mac.as_str()) {
            out.remove_bindings.push(binding.mac.clone());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists() -> BTreeSet<String> {
        ["active", "fup", "habis", "expired", "inactive", "blocked"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn entry(list: &str, address: &str, comment: Option<&str>) -> AddressListEntry {
        AddressListEntry {
            id: format!("*{list}{address}"),
            list: list.into(),
            address: address.into(),
            comment: comment.map(String::from),
            timeout: None,
            dynamic: false,
        }
    }

    fn binding(mac: &str, kind: BindingType, comment: &str) -> IpBinding {
        IpBinding {
            id: format!("*{mac}"),
            mac: mac.into(),
            address: None,
            binding_type: kind,
            server: None,
            comment: Some(comment.into()),
            disabled: false,
        }
    }

    const COMMENT: &str = "user=0812|uid=u1|role=USER|state=HABIS";

    fn input<'a>(
        devices: &'a [DeviceTarget],
        managed: &'a BTreeSet<String>,
        entries: &'a [AddressListEntry],
        bindings: &'a [IpBinding],
    ) -> PlanInput<'a> {
        PlanInput {
            uid: "u1",
            comment: COMMENT,
            address_list: "habis",
            binding_type: BindingType::Regular,
            server: None,
            devices,
            managed_lists: managed,
            unauthorized_list: "unauthorized",
            entries,
            bindings,
        }
    }

    fn device(ip: &str) -> DeviceTarget {
        DeviceTarget {
            mac: "AA:BB:CC:DD:EE:01".into(),
            ip: Some(ip.into()),
        }
    }

    #[test]
    fn comment_round_trip() {
        let c = subscriber_comment("0812", "u1", "USER", AccessState::Habis);
        assert_eq!(c, COMMENT);
        assert_eq!(comment_uid(&c), Some("u1"));
        assert_eq!(comment_uid("manual entry"), None);
    }

    #[test]
    fn moves_between_lists_remove_first() {
        let managed = lists();
        let devices = [device("10.0.0.5")];
        let entries = [entry("active", "10.0.0.5", Some(COMMENT))];
        let p = plan(&input(&devices, &managed, &entries, &[]));
        assert_eq!(
            p.remove_entries,
            vec![("10.0.0.5".to_string(), "active".to_string())]
        );
        assert_eq!(p.add_entries.len(), 1);
        assert_eq!(p.add_entries[0].list, "habis");
        assert_eq!(p.upsert_bindings.len(), 1);
    }

    #[test]
    fn converged_state_plans_nothing() {
        let managed = lists();
        let devices = [device("10.0.0.5")];
        let entries = [
            entry("habis", "10.0.0.5", Some(COMMENT)),
            entry("active", "10.0.0.99", Some("someone else")),
        ];
        let bindings = [binding("AA:BB:CC:DD:EE:01", BindingType::Regular, COMMENT)];
        let p = plan(&input(&devices, &managed, &entries, &bindings));
        assert!(p.is_empty());
        assert!(p.multi_list.is_empty());
    }

    #[test]
    fn stale_tagged_entries_and_bindings_go() {
        let managed = lists();
        let devices = [device("10.0.0.5")];
        let entries = [
            entry("habis", "10.0.0.5", Some("old comment")),
            entry("active", "10.0.0.7", Some("user=0812|uid=u1|role=USER|state=ACTIVE")),
            entry("unauthorized", "10.0.0.5", Some("unauthorized|mac=AA:BB:CC:DD:EE:01")),
        ];
        let bindings = [
            binding("AA:BB:CC:DD:EE:01", BindingType::Regular, COMMENT),
            binding("AA:BB:CC:DD:EE:09", BindingType::Bypassed, COMMENT),
        ];
        let p = plan(&input(&devices, &managed, &entries, &bindings));
        assert_eq!(p.update_entries.len(), 1);
        assert!(p.add_entries.is_empty());
        assert_eq!(p.remove_entries.len(), 2);
        assert_eq!(p.remove_bindings, vec!["AA:BB:CC:DD:EE:09".to_string()]);
    }

    #[test]
    fn detects_multi_list() {
        let managed = lists();
        let devices = [device("10.0.0.5")];
        let entries = [
            entry("habis", "10.0.0.5", Some(COMMENT)),
            entry("blocked", "10.0.0.5", Some(COMMENT)),
        ];
        let p = plan(&input(&devices, &managed, &entries, &[]));
        assert_eq!(p.multi_list, vec!["10.0.0.5".to_string()]);
        assert_eq!(
            p.remove_entries,
            vec![("10.0.0.5".to_string(), "blocked".to_string())]
        );
    }

    #[test]
    fn device_without_ip_gets_binding_only() {
        let managed = lists();
        let devices = [DeviceTarget {
            mac: "AA:BB:CC:DD:EE:01".into(),
            ip: None,
        }];
        let p = plan(&input(&devices, &managed, &[], &[]));
        assert!(p.add_entries.is_empty());
        assert_eq!(p.upsert_bindings.len(), 1);
    }
}
