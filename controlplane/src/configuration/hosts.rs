//! Host ownership arbitration.
//!
//! Rebuilds the `host -> resource` map from the stored Ingress,
//! VirtualServer, and (with TLS passthrough enabled) TransportServer
//! resources. Claims are processed in key order; collisions are settled by
//! the winner predicate, and every loser records a warning.

use std::collections::BTreeMap;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use gatehouse_api::constants::TLS_PASSTHROUGH_LISTENER_NAME;
use gatehouse_api::v1::{
    Action, ListenerProtocol, Route, Upstream, VirtualServer, VirtualServerRoute,
    VirtualServerRouteSpec,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::changes::{
    create_resource_changes_for_hosts, detect_changes_in_hosts, squash_resource_changes,
};
use super::ingress::{
    first_rule_host, ingress_rules, is_challenge_ingress, is_master, is_minion, rule_host,
    rule_paths,
};
use super::problems::{detect_changes_in_problems, ConfigurationProblem, ProblemReason};
use super::resources::{
    choose_object_meta_winner, IngressConfiguration, MinionConfiguration, Resource,
    ResourceChange, TransportServerConfiguration, VirtualServerConfiguration,
};
use super::{Configuration, State};
use crate::objects::{KubeObject, ObjectKey, ResourceKey, ResourceKind};

impl Configuration {
    /// Rebuilds the host map and returns the changes to it along with the
    /// new problems.
    pub(super) fn rebuild_hosts(
        &self,
        state: &mut State,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let (new_host_claims, mut new_resources) = self.build_hosts_and_resources(state);

        update_active_hosts_for_ingresses(&new_host_claims, &mut new_resources);
        self.add_warnings_for_misconfigured_listeners(state, &new_host_claims, &mut new_resources);

        let new_hosts: BTreeMap<String, Resource> = new_host_claims
            .iter()
            .filter_map(|(host, key)| {
                new_resources
                    .get(key)
                    .map(|resource| (host.clone(), resource.clone()))
            })
            .collect();

        let (removed, updated, added) = detect_changes_in_hosts(&state.hosts, &new_hosts);
        let changes =
            create_resource_changes_for_hosts(removed, updated, added, &state.hosts, &new_hosts);

        state.hosts = new_hosts;

        let mut changes = squash_resource_changes(changes);

        // A change created for a displaced resource would otherwise carry
        // the configuration built in a previous reconciliation, losing the
        // warnings recorded in this one.
        for change in &mut changes {
            if let Some(resource) = new_resources.get(&change.resource().key()) {
                change.set_resource(resource.clone());
            }
        }

        let mut new_problems = BTreeMap::new();
        add_problems_for_resources_without_active_host(state, &new_resources, &mut new_problems);
        add_problems_for_orphan_minions(state, &mut new_problems);
        add_problems_for_orphan_or_ignored_vsrs(state, &mut new_problems);

        let emitted = detect_changes_in_problems(&new_problems, &state.host_problems);
        state.host_problems = new_problems;

        (changes, emitted)
    }

    fn build_hosts_and_resources(
        &self,
        state: &State,
    ) -> (
        BTreeMap<String, ResourceKey>,
        BTreeMap<ResourceKey, Resource>,
    ) {
        let mut new_host_claims: BTreeMap<String, ResourceKey> = BTreeMap::new();
        let mut new_resources: BTreeMap<ResourceKey, Resource> = BTreeMap::new();
        let mut challenge_vsrs: Vec<Arc<VirtualServerRoute>> = Vec::new();

        // Step 1 - hosts claimed by Ingress resources.

        for ingress in state.ingresses.values() {
            if is_minion(ingress) {
                continue;
            }

            if is_challenge_ingress(ingress, self.settings.cert_manager_enabled()) {
                if let Some(vsr) = convert_ingress_to_vsr(ingress, &state.virtual_servers) {
                    challenge_vsrs.push(Arc::new(vsr));
                    continue;
                }
            }

            let resource = if is_master(ingress) {
                let master_host = first_rule_host(ingress).unwrap_or_default();
                let (minions, child_warnings) =
                    build_minion_configs(&state.ingresses, master_host);
                Resource::Ingress(IngressConfiguration::new_master(
                    ingress.clone(),
                    minions,
                    child_warnings,
                ))
            } else {
                Resource::Ingress(IngressConfiguration::new_regular(ingress.clone()))
            };

            let resource_key = resource.key();
            new_resources.insert(resource_key.clone(), resource);

            for rule in ingress_rules(ingress) {
                claim_host(
                    rule_host(rule),
                    &resource_key,
                    &mut new_host_claims,
                    &mut new_resources,
                );
            }
        }

        // Step 2 - hosts claimed by VirtualServer resources.

        for vs in state.virtual_servers.values() {
            let (mut vsrs, warnings) = self.build_virtual_server_routes(state, vs);
            for challenge_vsr in &challenge_vsrs {
                if vs.spec.host == challenge_vsr.spec.host {
                    vsrs.push(challenge_vsr.clone());
                }
            }

            let mut vs_config = VirtualServerConfiguration::new(vs.clone(), vsrs, warnings);
            build_listeners_for_vs_configuration(state, &mut vs_config);

            let resource = Resource::VirtualServer(vs_config);
            let resource_key = resource.key();
            new_resources.insert(resource_key.clone(), resource);

            claim_host(
                &vs.spec.host,
                &resource_key,
                &mut new_host_claims,
                &mut new_resources,
            );
        }

        // Step 3 - hosts claimed by TLS passthrough TransportServers.

        if self.settings.tls_passthrough_enabled() {
            for ts in state.transport_servers.values() {
                if ts.spec.listener.name != TLS_PASSTHROUGH_LISTENER_NAME
                    || ts.spec.listener.protocol != ListenerProtocol::TlsPassthrough
                {
                    continue;
                }

                let resource =
                    Resource::TransportServer(TransportServerConfiguration::new(ts.clone()));
                let resource_key = resource.key();
                new_resources.insert(resource_key.clone(), resource);

                claim_host(
                    &ts.spec.host,
                    &resource_key,
                    &mut new_host_claims,
                    &mut new_resources,
                );
            }
        }

        (new_host_claims, new_resources)
    }

    fn build_virtual_server_routes(
        &self,
        state: &State,
        vs: &Arc<VirtualServer>,
    ) -> (Vec<Arc<VirtualServerRoute>>, Vec<String>) {
        let mut vsrs = Vec::new();
        let mut warnings = Vec::new();

        let default_namespace = vs.metadata.namespace.as_deref().unwrap_or_default();

        for route in &vs.spec.routes {
            let Some(reference) = route.route.as_deref().filter(|r| !r.is_empty()) else {
                continue;
            };

            let vsr_key = ObjectKey::from_reference(reference, default_namespace);

            let Some(vsr) = state.virtual_server_routes.get(&vsr_key) else {
                warnings.push(format!("VirtualServerRoute {vsr_key} doesn't exist or invalid"));
                continue;
            };

            if let Err(err) = self
                .virtual_server_validator
                .validate_virtual_server_route_for_virtual_server(vsr, &vs.spec.host, &route.path)
            {
                warnings.push(format!("VirtualServerRoute {vsr_key} is invalid: {err}"));
                continue;
            }

            vsrs.push(vsr.clone());
        }

        (vsrs, warnings)
    }

    /// Attaches warnings about dangling or misused `listener` references to
    /// the resource owning the VirtualServer's host.
    fn add_warnings_for_misconfigured_listeners(
        &self,
        state: &State,
        host_claims: &BTreeMap<String, ResourceKey>,
        resources: &mut BTreeMap<ResourceKey, Resource>,
    ) {
        let mut warnings: Vec<(String, String)> = Vec::new();

        for resource in resources.values() {
            let Resource::VirtualServer(vs_config) = resource else {
                continue;
            };
            let vs = vs_config.virtual_server();
            let Some(listener) = vs.spec.listener.as_ref() else {
                continue;
            };
            let host = vs.spec.host.clone();

            if state.global_configuration.is_none() {
                warnings.push((
                    host,
                    "Listeners defined, but no GlobalConfiguration is deployed".to_string(),
                ));
                continue;
            }

            if !is_listener_in_correct_block(state, listener.http.as_deref(), false) {
                warnings.push((
                    host,
                    format!(
                        "Listener {} can't be use in `listener.http` context as SSL is enabled for that listener.",
                        listener.http.as_deref().unwrap_or_default()
                    ),
                ));
                continue;
            }

            if !is_listener_in_correct_block(state, listener.https.as_deref(), true) {
                warnings.push((
                    host,
                    format!(
                        "Listener {} can't be use in `listener.https` context as SSL is not enabled for that listener.",
                        listener.https.as_deref().unwrap_or_default()
                    ),
                ));
                continue;
            }

            if let Some(name) = listener.http.as_deref() {
                if !state.listener_map.contains_key(name) {
                    warnings.push((
                        host,
                        format!("Listener {name} is not defined in GlobalConfiguration"),
                    ));
                    continue;
                }
            }

            if let Some(name) = listener.https.as_deref() {
                if !state.listener_map.contains_key(name) {
                    warnings.push((
                        host,
                        format!("Listener {name} is not defined in GlobalConfiguration"),
                    ));
                }
            }
        }

        for (host, warning) in warnings {
            if let Some(owner_key) = host_claims.get(&host) {
                if let Some(owner) = resources.get_mut(owner_key) {
                    owner.add_warning(warning);
                }
            }
        }
    }
}

/// Claims a host for a resource. An existing claim is settled with the
/// winner predicate; the loser records a warning.
fn claim_host(
    host: &str,
    claimant_key: &ResourceKey,
    host_claims: &mut BTreeMap<String, ResourceKey>,
    resources: &mut BTreeMap<ResourceKey, Resource>,
) {
    let Some(holder_key) = host_claims.get(host).cloned() else {
        host_claims.insert(host.to_string(), claimant_key.clone());
        return;
    };

    let warning = format!("host {host} is taken by another resource");

    let holder_wins = match (resources.get(&holder_key), resources.get(claimant_key)) {
        (Some(holder), Some(claimant)) => holder.wins(claimant),
        _ => return,
    };

    if holder_wins {
        if let Some(claimant) = resources.get_mut(claimant_key) {
            claimant.add_warning(warning);
        }
    } else {
        if let Some(holder) = resources.get_mut(&holder_key) {
            holder.add_warning(warning);
        }
        host_claims.insert(host.to_string(), claimant_key.clone());
    }
}

/// Gathers the minions of a master's host, arbitrating path ownership among
/// them with the same winner predicate that settles hosts.
fn build_minion_configs(
    ingresses: &BTreeMap<ObjectKey, Arc<Ingress>>,
    master_host: &str,
) -> (Vec<MinionConfiguration>, BTreeMap<ObjectKey, Vec<String>>) {
    let mut minion_configs: Vec<MinionConfiguration> = Vec::new();
    let mut child_warnings: BTreeMap<ObjectKey, Vec<String>> = BTreeMap::new();
    let mut path_holders: HashMap<String, usize> = HashMap::new();

    for ingress in ingresses.values() {
        if !is_minion(ingress) {
            continue;
        }
        if first_rule_host(ingress) != Some(master_host) {
            continue;
        }

        minion_configs.push(MinionConfiguration::new(ingress.clone()));
        let current = minion_configs.len() - 1;

        let Some(rule) = ingress_rules(ingress).first() else {
            continue;
        };

        for ingress_path in rule_paths(rule) {
            let path = ingress_path.path.clone().unwrap_or_default();

            match path_holders.entry(path.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(current);
                    minion_configs[current].set_valid_path(&path, true);
                }
                Entry::Occupied(mut entry) => {
                    let holder = *entry.get();
                    let warning = format!("path {path} is taken by another resource");

                    let holder_wins = choose_object_meta_winner(
                        &minion_configs[holder].ingress().metadata,
                        &ingress.metadata,
                    );

                    if holder_wins {
                        child_warnings
                            .entry(ObjectKey::from_meta(&ingress.metadata))
                            .or_default()
                            .push(warning);
                    } else {
                        let holder_key =
                            ObjectKey::from_meta(&minion_configs[holder].ingress().metadata);
                        entry.insert(current);
                        minion_configs[current].set_valid_path(&path, true);
                        minion_configs[holder].set_valid_path(&path, false);
                        child_warnings.entry(holder_key).or_default().push(warning);
                    }
                }
            }
        }
    }

    (minion_configs, child_warnings)
}

/// Lifts an ACME challenge Ingress into a VirtualServerRoute passing the
/// challenge path to the solver service. Returns `None` when no
/// VirtualServer owns the challenge's host or the Ingress lacks the solver
/// shape; the Ingress is then processed like any other.
fn convert_ingress_to_vsr(
    ingress: &Arc<Ingress>,
    virtual_servers: &BTreeMap<ObjectKey, Arc<VirtualServer>>,
) -> Option<VirtualServerRoute> {
    let rule = ingress_rules(ingress).first()?;
    let host = rule_host(rule);

    if !virtual_servers.values().any(|vs| vs.spec.host == host) {
        return None;
    }

    let ingress_path = rule_paths(rule).first()?;
    let service = ingress_path.backend.service.as_ref()?;
    let port = u16::try_from(service.port.as_ref()?.number?).ok()?;

    Some(VirtualServerRoute {
        metadata: ObjectMeta {
            namespace: ingress.metadata.namespace.clone(),
            name: ingress.metadata.name.clone(),
            ..ObjectMeta::default()
        },
        spec: VirtualServerRouteSpec {
            host: host.to_string(),
            upstreams: vec![Upstream {
                name: "challenge".to_string(),
                service: service.name.clone(),
                port,
                use_cluster_ip: false,
            }],
            subroutes: vec![Route {
                path: ingress_path.path.clone().unwrap_or_default(),
                action: Some(Action {
                    pass: Some("challenge".to_string()),
                }),
                ..Route::default()
            }],
            ..VirtualServerRouteSpec::default()
        },
    })
}

/// Resolves the VirtualServer's `listener` references against the
/// GlobalConfiguration. Only HTTP-protocol listeners with the matching SSL
/// setting are picked up.
fn build_listeners_for_vs_configuration(state: &State, vs_config: &mut VirtualServerConfiguration) {
    let vs = vs_config.virtual_server().clone();
    let Some(listener) = vs.spec.listener.as_ref() else {
        return;
    };
    if state.global_configuration.is_none() {
        return;
    }

    if let Some(name) = listener.http.as_deref() {
        if let Some(gc_listener) = state.listener_map.get(name) {
            if gc_listener.protocol == ListenerProtocol::Http && !gc_listener.ssl {
                vs_config.set_http_listener(gc_listener.port, gc_listener.ipv4, gc_listener.ipv6);
            }
        }
    }

    if let Some(name) = listener.https.as_deref() {
        if let Some(gc_listener) = state.listener_map.get(name) {
            if gc_listener.protocol == ListenerProtocol::Http && gc_listener.ssl {
                vs_config.set_https_listener(gc_listener.port, gc_listener.ipv4, gc_listener.ipv6);
            }
        }
    }
}

fn is_listener_in_correct_block(
    state: &State,
    listener_name: Option<&str>,
    expected_ssl: bool,
) -> bool {
    match listener_name {
        None => true,
        Some(name) => state
            .listener_map
            .get(name)
            .is_none_or(|listener| listener.ssl == expected_ssl),
    }
}

fn update_active_hosts_for_ingresses(
    host_claims: &BTreeMap<String, ResourceKey>,
    resources: &mut BTreeMap<ResourceKey, Resource>,
) {
    for (key, resource) in resources.iter_mut() {
        let Resource::Ingress(ingress_config) = resource else {
            continue;
        };

        let ingress = ingress_config.ingress().clone();
        for rule in ingress_rules(&ingress) {
            let host = rule_host(rule);
            let valid = host_claims.get(host) == Some(key);
            ingress_config.set_valid_host(host, valid);
        }
    }
}

fn add_problems_for_resources_without_active_host(
    state: &State,
    new_resources: &BTreeMap<ResourceKey, Resource>,
    problems: &mut BTreeMap<ResourceKey, ConfigurationProblem>,
) {
    for (key, resource) in new_resources {
        match resource {
            Resource::Ingress(ingress_config) => {
                if !ingress_config.has_valid_host() {
                    problems.insert(
                        key.clone(),
                        ConfigurationProblem::new(
                            KubeObject::Ingress(ingress_config.ingress().clone()),
                            false,
                            ProblemReason::Rejected,
                            "All hosts are taken by other resources",
                        ),
                    );
                }
            }
            Resource::VirtualServer(vs_config) => {
                let host = &vs_config.virtual_server().spec.host;
                if !host_is_owned_by(state, host, key) {
                    problems.insert(
                        key.clone(),
                        ConfigurationProblem::new(
                            KubeObject::VirtualServer(vs_config.virtual_server().clone()),
                            false,
                            ProblemReason::Rejected,
                            "Host is taken by another resource",
                        ),
                    );
                }
            }
            Resource::TransportServer(ts_config) => {
                let host = &ts_config.transport_server().spec.host;
                if !host_is_owned_by(state, host, key) {
                    problems.insert(
                        key.clone(),
                        ConfigurationProblem::new(
                            KubeObject::TransportServer(ts_config.transport_server().clone()),
                            false,
                            ProblemReason::Rejected,
                            "Host is taken by another resource",
                        ),
                    );
                }
            }
        }
    }
}

fn host_is_owned_by(state: &State, host: &str, key: &ResourceKey) -> bool {
    state
        .hosts
        .get(host)
        .is_some_and(|owner| owner.key() == *key)
}

fn add_problems_for_orphan_minions(
    state: &State,
    problems: &mut BTreeMap<ResourceKey, ConfigurationProblem>,
) {
    for ingress in state.ingresses.values() {
        if !is_minion(ingress) {
            continue;
        }

        let host = first_rule_host(ingress).unwrap_or_default();
        let has_active_master = state
            .hosts
            .get(host)
            .is_some_and(|owner| matches!(owner, Resource::Ingress(config) if *config.is_master()));

        if !has_active_master {
            problems.insert(
                ResourceKey::from_meta(ResourceKind::Ingress, &ingress.metadata),
                ConfigurationProblem::new(
                    KubeObject::Ingress(ingress.clone()),
                    false,
                    ProblemReason::NoIngressMasterFound,
                    "Ingress master is invalid or doesn't exist",
                ),
            );
        }
    }
}

fn add_problems_for_orphan_or_ignored_vsrs(
    state: &State,
    problems: &mut BTreeMap<ResourceKey, ConfigurationProblem>,
) {
    for vsr in state.virtual_server_routes.values() {
        let key = ResourceKey::from_meta(ResourceKind::VirtualServerRoute, &vsr.metadata);

        let Some(Resource::VirtualServer(vs_config)) = state.hosts.get(&vsr.spec.host) else {
            problems.insert(
                key,
                ConfigurationProblem::new(
                    KubeObject::VirtualServerRoute(vsr.clone()),
                    false,
                    ProblemReason::NoVirtualServerFound,
                    "VirtualServer is invalid or doesn't exist",
                ),
            );
            continue;
        };

        let listed = vs_config.virtual_server_routes().iter().any(|listed| {
            listed.metadata.namespace == vsr.metadata.namespace
                && listed.metadata.name == vsr.metadata.name
        });

        if !listed {
            let vs_key = ObjectKey::from_meta(&vs_config.virtual_server().metadata);
            problems.insert(
                key,
                ConfigurationProblem::new(
                    KubeObject::VirtualServerRoute(vsr.clone()),
                    false,
                    ProblemReason::Ignored,
                    format!("VirtualServer {vs_key} ignores VirtualServerRoute"),
                ),
            );
        }
    }
}
