//! Change detection between successive ownership maps.
//!
//! Every emitted list keeps deletes ahead of add/updates so that a resource
//! picking up a host or listener released in the same reconciliation is only
//! applied after the previous owner's config is gone. The proxy config never
//! passes through a state with two claimants.

use std::collections::{BTreeMap, HashMap};

use super::resources::{Operation, Resource, ResourceChange, TransportServerConfiguration};
use crate::objects::ListenerHostKey;

pub(super) fn detect_changes_in_hosts(
    old_hosts: &BTreeMap<String, Resource>,
    new_hosts: &BTreeMap<String, Resource>,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut removed = Vec::new();
    let mut updated = Vec::new();
    let mut added = Vec::new();

    for host in old_hosts.keys() {
        if !new_hosts.contains_key(host) {
            removed.push(host.clone());
        }
    }

    for (host, new_resource) in new_hosts {
        let Some(old_resource) = old_hosts.get(host) else {
            added.push(host.clone());
            continue;
        };

        if !old_resource.is_equal(new_resource)
            || virtual_server_listeners_changed(old_resource, new_resource)
        {
            updated.push(host.clone());
        }
    }

    (removed, updated, added)
}

/// Listener ports and addresses live outside the structural comparison, but
/// a drift still has to reach the proxy config.
fn virtual_server_listeners_changed(old_resource: &Resource, new_resource: &Resource) -> bool {
    let (Resource::VirtualServer(old_vsc), Resource::VirtualServer(new_vsc)) =
        (old_resource, new_resource)
    else {
        return false;
    };

    old_vsc.http_port() != new_vsc.http_port()
        || old_vsc.https_port() != new_vsc.https_port()
        || old_vsc.http_ipv4() != new_vsc.http_ipv4()
        || old_vsc.http_ipv6() != new_vsc.http_ipv6()
}

pub(super) fn create_resource_changes_for_hosts(
    removed_hosts: Vec<String>,
    updated_hosts: Vec<String>,
    added_hosts: Vec<String>,
    old_hosts: &BTreeMap<String, Resource>,
    new_hosts: &BTreeMap<String, Resource>,
) -> Vec<ResourceChange> {
    let mut delete_changes = Vec::new();
    let mut changes = Vec::new();

    for host in removed_hosts {
        if let Some(old_resource) = old_hosts.get(&host) {
            delete_changes.push(ResourceChange::delete(old_resource.clone()));
        }
    }

    for host in updated_hosts {
        let (Some(old_resource), Some(new_resource)) = (old_hosts.get(&host), new_hosts.get(&host))
        else {
            continue;
        };

        if old_resource.key() != new_resource.key() {
            delete_changes.push(ResourceChange::delete(old_resource.clone()));
        }
        changes.push(ResourceChange::add_or_update(new_resource.clone()));
    }

    for host in added_hosts {
        if let Some(new_resource) = new_hosts.get(&host) {
            changes.push(ResourceChange::add_or_update(new_resource.clone()));
        }
    }

    delete_changes.extend(changes);
    delete_changes
}

pub(super) fn detect_changes_in_listener_hosts(
    old_listener_hosts: &BTreeMap<ListenerHostKey, TransportServerConfiguration>,
    new_listener_hosts: &BTreeMap<ListenerHostKey, TransportServerConfiguration>,
) -> (
    Vec<ListenerHostKey>,
    Vec<ListenerHostKey>,
    Vec<ListenerHostKey>,
) {
    let mut removed = Vec::new();
    let mut updated = Vec::new();
    let mut added = Vec::new();

    for key in old_listener_hosts.keys() {
        if !new_listener_hosts.contains_key(key) {
            removed.push(key.clone());
        }
    }

    for (key, new_config) in new_listener_hosts {
        match old_listener_hosts.get(key) {
            None => added.push(key.clone()),
            Some(old_config) => {
                if !old_config.is_equal(new_config) {
                    updated.push(key.clone());
                }
            }
        }
    }

    (removed, updated, added)
}

pub(super) fn create_resource_changes_for_listeners(
    removed_listener_hosts: Vec<ListenerHostKey>,
    updated_listener_hosts: Vec<ListenerHostKey>,
    added_listener_hosts: Vec<ListenerHostKey>,
    old_listener_hosts: &BTreeMap<ListenerHostKey, TransportServerConfiguration>,
    new_listener_hosts: &BTreeMap<ListenerHostKey, TransportServerConfiguration>,
) -> Vec<ResourceChange> {
    let mut delete_changes = Vec::new();
    let mut changes = Vec::new();

    for key in removed_listener_hosts {
        if let Some(old_config) = old_listener_hosts.get(&key) {
            delete_changes.push(ResourceChange::delete(Resource::TransportServer(
                old_config.clone(),
            )));
        }
    }

    for key in updated_listener_hosts {
        let (Some(old_config), Some(new_config)) =
            (old_listener_hosts.get(&key), new_listener_hosts.get(&key))
        else {
            continue;
        };

        if old_config.key() != new_config.key() {
            delete_changes.push(ResourceChange::delete(Resource::TransportServer(
                old_config.clone(),
            )));
        }
        changes.push(ResourceChange::add_or_update(Resource::TransportServer(
            new_config.clone(),
        )));
    }

    for key in added_listener_hosts {
        if let Some(new_config) = new_listener_hosts.get(&key) {
            changes.push(ResourceChange::add_or_update(Resource::TransportServer(
                new_config.clone(),
            )));
        }
    }

    delete_changes.extend(changes);
    delete_changes
}

/// Collapses the change list so each resource appears at most once.
///
/// Multiple changes for one resource keep only the last one (a delete
/// followed by an add/update is just an add/update). The result again puts
/// all deletes ahead of all add/updates.
pub(super) fn squash_resource_changes(changes: Vec<ResourceChange>) -> Vec<ResourceChange> {
    let mut last_change_per_resource = HashMap::new();
    for (index, change) in changes.iter().enumerate() {
        last_change_per_resource.insert(change.resource().key(), index);
    }

    let mut deletes = Vec::new();
    let mut upserts = Vec::new();

    for (index, change) in changes.into_iter().enumerate() {
        if last_change_per_resource.get(&change.resource().key()) != Some(&index) {
            continue;
        }

        match change.op() {
            Operation::Delete => deletes.push(change),
            Operation::AddOrUpdate => upserts.push(change),
        }
    }

    deletes.extend(upserts);
    deletes
}
