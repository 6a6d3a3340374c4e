//! Arbitration of `(listener, host)` claims made by TCP/UDP TransportServers.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use gatehouse_api::v1::ListenerProtocol;

use super::changes::{
    create_resource_changes_for_listeners, detect_changes_in_listener_hosts,
    squash_resource_changes,
};
use super::problems::{detect_changes_in_problems, ConfigurationProblem, ProblemReason};
use super::resources::{Resource, ResourceChange, TransportServerConfiguration};
use super::{Configuration, State};
use crate::objects::{KubeObject, ListenerHostKey, ResourceKey};

impl Configuration {
    pub(super) fn rebuild_listener_hosts(
        &self,
        state: &mut State,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let (new_listener_hosts, new_ts_configs) = build_listener_hosts_and_ts_configurations(state);

        let (removed, updated, added) =
            detect_changes_in_listener_hosts(&state.listener_hosts, &new_listener_hosts);
        let changes = create_resource_changes_for_listeners(
            removed,
            updated,
            added,
            &state.listener_hosts,
            &new_listener_hosts,
        );

        state.listener_hosts = new_listener_hosts;

        let mut changes = squash_resource_changes(changes);

        // A change for a displaced TransportServer would otherwise carry the
        // configuration built in a previous reconciliation, losing the
        // warnings recorded in this one.
        for change in &mut changes {
            if let Some(ts_config) = new_ts_configs.get(&change.resource().key()) {
                change.set_resource(Resource::TransportServer(ts_config.clone()));
            }
        }

        let mut new_problems = BTreeMap::new();
        add_problems_for_ts_configs_without_active_listener(state, &new_ts_configs, &mut new_problems);

        let emitted = detect_changes_in_problems(&new_problems, &state.listener_problems);
        state.listener_problems = new_problems;

        (changes, emitted)
    }
}

fn build_listener_hosts_and_ts_configurations(
    state: &State,
) -> (
    BTreeMap<ListenerHostKey, TransportServerConfiguration>,
    BTreeMap<ResourceKey, TransportServerConfiguration>,
) {
    let mut claims: BTreeMap<ListenerHostKey, ResourceKey> = BTreeMap::new();
    let mut new_ts_configs: BTreeMap<ResourceKey, TransportServerConfiguration> = BTreeMap::new();

    for ts in state.transport_servers.values() {
        if ts.spec.listener.protocol == ListenerProtocol::TlsPassthrough {
            continue;
        }

        let ts_config = TransportServerConfiguration::new(ts.clone());
        let ts_key = ts_config.key();
        new_ts_configs.insert(ts_key.clone(), ts_config);

        let Some(global_configuration) = &state.global_configuration else {
            continue;
        };

        // The listener must exist under the same protocol; a protocol
        // mismatch leaves the TransportServer unbound.
        let Some(listener) = global_configuration
            .spec
            .listeners
            .iter()
            .find(|listener| {
                listener.name == ts.spec.listener.name
                    && listener.protocol == ts.spec.listener.protocol
            })
        else {
            continue;
        };

        if let Some(ts_config) = new_ts_configs.get_mut(&ts_key) {
            ts_config.set_listener(listener.port, listener.ipv4, listener.ipv6);
        }

        let listener_key = ListenerHostKey::new(listener.name.clone(), ts.spec.host.clone());

        match claims.entry(listener_key) {
            Entry::Vacant(entry) => {
                entry.insert(ts_key);
            }
            Entry::Occupied(mut entry) => {
                let holder_key = entry.get().clone();
                let warning = format!(
                    "listener {} and host {} are taken by another resource",
                    listener.name, ts.spec.host
                );

                let holder_wins = match (new_ts_configs.get(&holder_key), new_ts_configs.get(&ts_key))
                {
                    (Some(holder), Some(claimant)) => holder.wins(claimant),
                    _ => continue,
                };

                if holder_wins {
                    if let Some(claimant) = new_ts_configs.get_mut(&ts_key) {
                        claimant.add_warning(warning);
                    }
                } else {
                    if let Some(holder) = new_ts_configs.get_mut(&holder_key) {
                        holder.add_warning(warning);
                    }
                    entry.insert(ts_key);
                }
            }
        }
    }

    let new_listener_hosts = claims
        .into_iter()
        .filter_map(|(listener_key, ts_key)| {
            new_ts_configs
                .get(&ts_key)
                .map(|ts_config| (listener_key, ts_config.clone()))
        })
        .collect();

    (new_listener_hosts, new_ts_configs)
}

fn add_problems_for_ts_configs_without_active_listener(
    state: &State,
    new_ts_configs: &BTreeMap<ResourceKey, TransportServerConfiguration>,
    problems: &mut BTreeMap<ResourceKey, ConfigurationProblem>,
) {
    for (ts_key, ts_config) in new_ts_configs {
        let spec = &ts_config.transport_server().spec;
        let listener_name = &spec.listener.name;
        let host_description = if spec.host.is_empty() {
            "empty host"
        } else {
            &spec.host
        };

        let listener_key = ListenerHostKey::new(listener_name.clone(), spec.host.clone());
        let problem = match state.listener_hosts.get(&listener_key) {
            None => ConfigurationProblem::new(
                KubeObject::TransportServer(ts_config.transport_server().clone()),
                false,
                ProblemReason::Rejected,
                format!("Listener {listener_name} doesn't exist"),
            ),
            Some(holder) if !ts_config.is_equal(holder) => ConfigurationProblem::new(
                KubeObject::TransportServer(ts_config.transport_server().clone()),
                false,
                ProblemReason::Rejected,
                format!(
                    "Listener {listener_name} with host {host_description} is taken by another resource"
                ),
            ),
            Some(_) => continue,
        };

        problems.insert(ts_key.clone(), problem);
    }
}
