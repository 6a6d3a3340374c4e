//! The configuration store: the latest valid state of the cluster's routing
//! resources, ready to be transformed into proxy configuration.
//!
//! Callers feed resource events through the `add_or_update_*`/`delete_*`
//! mutators. Each call rebuilds the derived ownership maps and returns the
//! ordered changes (deletes ahead of add/updates) together with the newly
//! surfaced problems. The proxy config on disk is expected to track this
//! store exactly.

mod changes;
mod hosts;
mod ingress;
mod listeners;
mod problems;
mod references;
mod resources;

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use derive_builder::Builder;
use gatehouse_api::constants::{
    APP_PROTECT_DOS_PROTECTED_ANNOTATION, APP_PROTECT_LOG_CONF_ANNOTATION,
    APP_PROTECT_POLICY_ANNOTATION,
};
use gatehouse_api::v1::{
    GlobalConfiguration, Listener, ListenerProtocol, TransportServer, VirtualServer,
    VirtualServerRoute,
};
use gatehouse_api::validation::{
    GlobalConfigurationValidationError, GlobalConfigurationValidator, TransportServerValidator,
    VirtualServerValidator,
};
use getset::CopyGetters;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::{debug, warn};

use crate::objects::{KubeObject, ListenerHostKey, ObjectKey, ResourceKey};

pub use ingress::IngressValidationError;
pub use problems::{ConfigurationProblem, ProblemReason};
pub use resources::{
    IngressConfiguration, MinionConfiguration, Operation, Resource, ResourceChange,
    TransportServerConfiguration, VirtualServerConfiguration,
};

use references::{
    AppProtectResourceReferenceChecker, DosResourceReferenceChecker, PolicyReferenceChecker,
    RatelimitScalingAnnotationChecker, ReferenceChecker, SecretReferenceChecker,
    ServiceReferenceChecker,
};

/// Tells whether an object belongs to this controller's ingress class.
/// Objects failing the predicate are evicted from the store as if deleted.
pub type IngressClassPredicate = Box<dyn Fn(&KubeObject) -> bool + Send + Sync>;

/// Construction-time feature switches of the store.
#[derive(Builder, CopyGetters, Clone, Copy, Debug, Default)]
#[builder(default, setter(into))]
pub struct Settings {
    #[getset(get_copy = "pub")]
    is_plus: bool,

    #[getset(get_copy = "pub")]
    app_protect_enabled: bool,

    #[getset(get_copy = "pub")]
    app_protect_dos_enabled: bool,

    #[getset(get_copy = "pub")]
    internal_routes_enabled: bool,

    #[getset(get_copy = "pub")]
    tls_passthrough_enabled: bool,

    #[getset(get_copy = "pub")]
    snippets_enabled: bool,

    #[getset(get_copy = "pub")]
    cert_manager_enabled: bool,

    /// Carried through for the config renderer; the store itself keeps no
    /// IPv6-specific logic.
    #[getset(get_copy = "pub")]
    ipv6_disabled: bool,
}

impl Settings {
    pub fn new_builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }
}

/// Selects resource kinds for [`Configuration::get_resources_with_filter`].
#[derive(Builder, Clone, Copy, Debug, Default)]
#[builder(default)]
pub struct ResourceFilter {
    ingresses: bool,
    virtual_servers: bool,
    transport_servers: bool,
}

impl ResourceFilter {
    pub fn new_builder() -> ResourceFilterBuilder {
        ResourceFilterBuilder::default()
    }

    fn all() -> Self {
        Self {
            ingresses: true,
            virtual_servers: true,
            transport_servers: true,
        }
    }
}

/// Counts of active TransportServers by category.
#[derive(CopyGetters, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportServerMetrics {
    #[getset(get_copy = "pub")]
    total_tls_passthrough: usize,

    #[getset(get_copy = "pub")]
    total_tcp: usize,

    #[getset(get_copy = "pub")]
    total_udp: usize,
}

/// The mutable part of the store, guarded by the readers/writer lock. Only
/// valid resources with the matching ingress class are kept.
struct State {
    hosts: BTreeMap<String, Resource>,
    listener_hosts: BTreeMap<ListenerHostKey, TransportServerConfiguration>,
    listener_map: HashMap<String, Listener>,

    ingresses: BTreeMap<ObjectKey, Arc<Ingress>>,
    virtual_servers: BTreeMap<ObjectKey, Arc<VirtualServer>>,
    virtual_server_routes: BTreeMap<ObjectKey, Arc<VirtualServerRoute>>,
    transport_servers: BTreeMap<ObjectKey, Arc<TransportServer>>,

    global_configuration: Option<Arc<GlobalConfiguration>>,

    host_problems: BTreeMap<ResourceKey, ConfigurationProblem>,
    listener_problems: BTreeMap<ResourceKey, ConfigurationProblem>,
}

impl State {
    fn new() -> Self {
        Self {
            hosts: BTreeMap::new(),
            listener_hosts: BTreeMap::new(),
            listener_map: HashMap::new(),
            ingresses: BTreeMap::new(),
            virtual_servers: BTreeMap::new(),
            virtual_server_routes: BTreeMap::new(),
            transport_servers: BTreeMap::new(),
            global_configuration: None,
            host_problems: BTreeMap::new(),
            listener_problems: BTreeMap::new(),
        }
    }

    fn rebuild_listener_map(&mut self) {
        self.listener_map = self
            .global_configuration
            .iter()
            .flat_map(|gc| gc.spec.listeners.iter())
            .map(|listener| (listener.name.clone(), listener.clone()))
            .collect();
    }
}

/// The collection of configuration objects ready to be transformed into
/// proxy config, together with the machinery deciding which objects win
/// contested hosts and listeners.
pub struct Configuration {
    has_correct_ingress_class: IngressClassPredicate,

    virtual_server_validator: VirtualServerValidator,
    global_configuration_validator: GlobalConfigurationValidator,
    transport_server_validator: TransportServerValidator,

    service_reference_checker: ServiceReferenceChecker,
    endpoint_reference_checker: ServiceReferenceChecker,
    secret_reference_checker: SecretReferenceChecker,
    policy_reference_checker: PolicyReferenceChecker,
    app_policy_reference_checker: AppProtectResourceReferenceChecker,
    app_log_conf_reference_checker: AppProtectResourceReferenceChecker,
    app_dos_protected_checker: DosResourceReferenceChecker,

    settings: Settings,

    state: RwLock<State>,
}

impl Configuration {
    pub fn new(
        has_correct_ingress_class: IngressClassPredicate,
        virtual_server_validator: VirtualServerValidator,
        global_configuration_validator: GlobalConfigurationValidator,
        transport_server_validator: TransportServerValidator,
        settings: Settings,
    ) -> Self {
        Self {
            has_correct_ingress_class,
            virtual_server_validator,
            global_configuration_validator,
            transport_server_validator,
            service_reference_checker: ServiceReferenceChecker::new(false),
            endpoint_reference_checker: ServiceReferenceChecker::new(true),
            secret_reference_checker: SecretReferenceChecker::new(settings.is_plus()),
            policy_reference_checker: PolicyReferenceChecker,
            app_policy_reference_checker: AppProtectResourceReferenceChecker::new(
                APP_PROTECT_POLICY_ANNOTATION,
            ),
            app_log_conf_reference_checker: AppProtectResourceReferenceChecker::new(
                APP_PROTECT_LOG_CONF_ANNOTATION,
            ),
            app_dos_protected_checker: DosResourceReferenceChecker::new(
                APP_PROTECT_DOS_PROTECTED_ANNOTATION,
            ),
            settings,
            state: RwLock::new(State::new()),
        }
    }

    /// Adds or updates the Ingress resource.
    pub fn add_or_update_ingress(
        &self,
        ingress: Arc<Ingress>,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        let key = ObjectKey::from_meta(&ingress.metadata);
        let object = KubeObject::Ingress(ingress.clone());
        let mut validation_error = None;

        if !(self.has_correct_ingress_class)(&object) {
            state.ingresses.remove(&key);
        } else {
            match ingress::validate_ingress(&ingress, &self.settings) {
                Err(err) => {
                    warn!("Rejecting Ingress {key}: {err}");
                    validation_error = Some(err.to_string());
                    state.ingresses.remove(&key);
                }
                Ok(()) => {
                    debug!("Storing Ingress {key}");
                    state.ingresses.insert(key, ingress.clone());
                }
            }
        }

        let (mut changes, mut problems) = self.rebuild_hosts(&mut state);

        if let Some(message) = validation_error {
            attach_validation_error(&mut changes, &mut problems, object, &message, message.clone());
        }

        (changes, problems)
    }

    /// Deletes an Ingress resource by its `namespace/name` key.
    pub fn delete_ingress(&self, key: &ObjectKey) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        if state.ingresses.remove(key).is_none() {
            return (Vec::new(), Vec::new());
        }

        debug!("Deleted Ingress {key}");
        self.rebuild_hosts(&mut state)
    }

    /// Adds or updates the VirtualServer resource.
    pub fn add_or_update_virtual_server(
        &self,
        vs: Arc<VirtualServer>,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        let key = ObjectKey::from_meta(&vs.metadata);
        let object = KubeObject::VirtualServer(vs.clone());
        let mut validation_error = None;

        if !(self.has_correct_ingress_class)(&object) {
            state.virtual_servers.remove(&key);
        } else {
            match self.virtual_server_validator.validate_virtual_server(&vs) {
                Err(err) => {
                    warn!("Rejecting VirtualServer {key}: {err}");
                    validation_error = Some(err.to_string());
                    state.virtual_servers.remove(&key);
                }
                Ok(()) => {
                    debug!("Storing VirtualServer {key}");
                    state.virtual_servers.insert(key.clone(), vs.clone());
                }
            }
        }

        let (mut changes, mut problems) = self.rebuild_hosts(&mut state);

        if let Some(message) = validation_error {
            let report = format!("VirtualServer {key} was rejected with error: {message}");
            attach_validation_error(&mut changes, &mut problems, object, &message, report);
        }

        (changes, problems)
    }

    /// Deletes a VirtualServer resource by its `namespace/name` key.
    pub fn delete_virtual_server(
        &self,
        key: &ObjectKey,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        if state.virtual_servers.remove(key).is_none() {
            return (Vec::new(), Vec::new());
        }

        debug!("Deleted VirtualServer {key}");
        self.rebuild_hosts(&mut state)
    }

    /// Adds or updates the VirtualServerRoute resource.
    pub fn add_or_update_virtual_server_route(
        &self,
        vsr: Arc<VirtualServerRoute>,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        let key = ObjectKey::from_meta(&vsr.metadata);
        let object = KubeObject::VirtualServerRoute(vsr.clone());
        let mut validation_error = None;

        if !(self.has_correct_ingress_class)(&object) {
            state.virtual_server_routes.remove(&key);
        } else {
            match self
                .virtual_server_validator
                .validate_virtual_server_route(&vsr)
            {
                Err(err) => {
                    warn!("Rejecting VirtualServerRoute {key}: {err}");
                    validation_error = Some(err.to_string());
                    state.virtual_server_routes.remove(&key);
                }
                Ok(()) => {
                    debug!("Storing VirtualServerRoute {key}");
                    state.virtual_server_routes.insert(key.clone(), vsr.clone());
                }
            }
        }

        let (changes, mut problems) = self.rebuild_hosts(&mut state);

        if let Some(message) = validation_error {
            problems.push(ConfigurationProblem::rejected(
                object,
                format!("VirtualServerRoute {key} was rejected with error: {message}"),
            ));
        }

        (changes, problems)
    }

    /// Deletes a VirtualServerRoute resource by its `namespace/name` key.
    pub fn delete_virtual_server_route(
        &self,
        key: &ObjectKey,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        if state.virtual_server_routes.remove(key).is_none() {
            return (Vec::new(), Vec::new());
        }

        debug!("Deleted VirtualServerRoute {key}");
        self.rebuild_hosts(&mut state)
    }

    /// Adds or updates the TransportServer resource.
    pub fn add_or_update_transport_server(
        &self,
        ts: Arc<TransportServer>,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        let key = ObjectKey::from_meta(&ts.metadata);
        let object = KubeObject::TransportServer(ts.clone());
        let mut validation_error = None;

        if !(self.has_correct_ingress_class)(&object) {
            state.transport_servers.remove(&key);
        } else {
            match self.transport_server_validator.validate_transport_server(&ts) {
                Err(err) => {
                    warn!("Rejecting TransportServer {key}: {err}");
                    validation_error = Some(err.to_string());
                    state.transport_servers.remove(&key);
                }
                Ok(()) => {
                    debug!("Storing TransportServer {key}");
                    state.transport_servers.insert(key.clone(), ts.clone());
                }
            }
        }

        let (mut changes, mut problems) = self.rebuild_listener_hosts(&mut state);

        if self.settings.tls_passthrough_enabled() {
            let (host_changes, host_problems) = self.rebuild_hosts(&mut state);
            changes.extend(host_changes);
            problems.extend(host_problems);
        }

        if let Some(message) = validation_error {
            let report = format!("TransportServer {key} was rejected with error: {message}");
            attach_validation_error(&mut changes, &mut problems, object, &message, report);
        }

        (changes, problems)
    }

    /// Deletes a TransportServer resource by its `namespace/name` key.
    pub fn delete_transport_server(
        &self,
        key: &ObjectKey,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        if state.transport_servers.remove(key).is_none() {
            return (Vec::new(), Vec::new());
        }

        debug!("Deleted TransportServer {key}");
        let (mut changes, mut problems) = self.rebuild_listener_hosts(&mut state);

        if self.settings.tls_passthrough_enabled() {
            let (host_changes, host_problems) = self.rebuild_hosts(&mut state);
            changes.extend(host_changes);
            problems.extend(host_problems);
        }

        (changes, problems)
    }

    /// Adds or updates the GlobalConfiguration. The resources are rebuilt
    /// even when validation fails; the error is reported to the caller.
    pub fn add_or_update_global_configuration(
        &self,
        gc: Arc<GlobalConfiguration>,
    ) -> (
        Vec<ResourceChange>,
        Vec<ConfigurationProblem>,
        Option<GlobalConfigurationValidationError>,
    ) {
        let mut state = self.write_state();

        let validation_error = self
            .global_configuration_validator
            .validate_global_configuration(&gc)
            .err();
        if let Some(err) = &validation_error {
            warn!("GlobalConfiguration is invalid: {err}");
        }

        state.global_configuration = Some(gc);
        state.rebuild_listener_map();

        let (mut changes, mut problems) = self.rebuild_listener_hosts(&mut state);

        let (host_changes, host_problems) = self.rebuild_hosts(&mut state);
        changes.extend(host_changes);
        problems.extend(host_problems);

        (changes, problems, validation_error)
    }

    /// Deletes the GlobalConfiguration.
    pub fn delete_global_configuration(
        &self,
    ) -> (Vec<ResourceChange>, Vec<ConfigurationProblem>) {
        let mut state = self.write_state();

        state.global_configuration = None;
        state.rebuild_listener_map();

        let (mut changes, mut problems) = self.rebuild_listener_hosts(&mut state);

        let (host_changes, host_problems) = self.rebuild_hosts(&mut state);
        changes.extend(host_changes);
        problems.extend(host_problems);

        (changes, problems)
    }

    /// Returns the current GlobalConfiguration.
    pub fn get_global_configuration(&self) -> Option<Arc<GlobalConfiguration>> {
        self.read_state().global_configuration.clone()
    }

    /// Returns all configuration resources.
    pub fn get_resources(&self) -> Vec<Resource> {
        self.get_resources_with_filter(ResourceFilter::all())
    }

    /// Returns the configuration resources selected by the filter, sorted
    /// by identity key and deduplicated.
    pub fn get_resources_with_filter(&self, filter: ResourceFilter) -> Vec<Resource> {
        let state = self.read_state();

        let mut resources: BTreeMap<ResourceKey, Resource> = BTreeMap::new();

        for resource in state.hosts.values() {
            let selected = match resource {
                Resource::Ingress(_) => filter.ingresses,
                Resource::VirtualServer(_) => filter.virtual_servers,
                Resource::TransportServer(_) => filter.transport_servers,
            };
            if selected {
                resources.insert(resource.key(), resource.clone());
            }
        }

        if filter.transport_servers {
            for ts_config in state.listener_hosts.values() {
                resources.insert(
                    ts_config.key(),
                    Resource::TransportServer(ts_config.clone()),
                );
            }
        }

        resources.into_values().collect()
    }

    /// Finds resources that reference the specified service.
    pub fn find_resources_for_service(&self, namespace: &str, name: &str) -> Vec<Resource> {
        self.find_resources_for_resource_reference(namespace, name, &self.service_reference_checker)
    }

    /// Finds resources that reference the specified endpoints. Resources
    /// reference not endpoints but the corresponding service, which has the
    /// same namespace and name.
    pub fn find_resources_for_endpoints(&self, namespace: &str, name: &str) -> Vec<Resource> {
        self.find_resources_for_resource_reference(
            namespace,
            name,
            &self.endpoint_reference_checker,
        )
    }

    /// Finds resources that reference the specified secret.
    pub fn find_resources_for_secret(&self, namespace: &str, name: &str) -> Vec<Resource> {
        self.find_resources_for_resource_reference(namespace, name, &self.secret_reference_checker)
    }

    /// Finds resources that reference the specified policy.
    pub fn find_resources_for_policy(&self, namespace: &str, name: &str) -> Vec<Resource> {
        self.find_resources_for_resource_reference(namespace, name, &self.policy_reference_checker)
    }

    /// Finds resources that reference the specified App Protect policy via
    /// the policy annotation.
    pub fn find_resources_for_app_protect_policy_annotation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Vec<Resource> {
        self.find_resources_for_resource_reference(
            namespace,
            name,
            &self.app_policy_reference_checker,
        )
    }

    /// Finds resources that reference the specified App Protect security
    /// log configuration via the log-conf annotation.
    pub fn find_resources_for_app_protect_log_conf_annotation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Vec<Resource> {
        self.find_resources_for_resource_reference(
            namespace,
            name,
            &self.app_log_conf_reference_checker,
        )
    }

    /// Finds resources protected by the specified App Protect DOS resource.
    pub fn find_resources_for_app_protect_dos_protected(
        &self,
        namespace: &str,
        name: &str,
    ) -> Vec<Resource> {
        self.find_resources_for_resource_reference(namespace, name, &self.app_dos_protected_checker)
    }

    /// Finds ingresses that use rate-limit scaling in the namespace.
    pub fn find_ingresses_with_ratelimit_scaling(&self, namespace: &str) -> Vec<Resource> {
        self.find_resources_for_resource_reference(
            namespace,
            "",
            &RatelimitScalingAnnotationChecker,
        )
    }

    fn find_resources_for_resource_reference(
        &self,
        namespace: &str,
        name: &str,
        checker: &dyn ReferenceChecker,
    ) -> Vec<Resource> {
        let state = self.read_state();

        let mut result = Vec::new();

        for resource in state.hosts.values() {
            match resource {
                Resource::Ingress(config) => {
                    if checker.is_referenced_by_ingress(namespace, name, config.ingress()) {
                        result.push(resource.clone());
                        continue;
                    }
                    if config.minions().iter().any(|minion| {
                        checker.is_referenced_by_minion(namespace, name, minion.ingress())
                    }) {
                        result.push(resource.clone());
                    }
                }
                Resource::VirtualServer(config) => {
                    if checker.is_referenced_by_virtual_server(
                        namespace,
                        name,
                        config.virtual_server(),
                    ) {
                        result.push(resource.clone());
                        continue;
                    }
                    if config.virtual_server_routes().iter().any(|vsr| {
                        checker.is_referenced_by_virtual_server_route(namespace, name, vsr)
                    }) {
                        result.push(resource.clone());
                    }
                }
                Resource::TransportServer(config) => {
                    if checker.is_referenced_by_transport_server(
                        namespace,
                        name,
                        config.transport_server(),
                    ) {
                        result.push(resource.clone());
                    }
                }
            }
        }

        for ts_config in state.listener_hosts.values() {
            if checker.is_referenced_by_transport_server(
                namespace,
                name,
                ts_config.transport_server(),
            ) {
                result.push(Resource::TransportServer(ts_config.clone()));
            }
        }

        result
    }

    /// Returns counts of the active TransportServers by category.
    pub fn get_transport_server_metrics(&self) -> TransportServerMetrics {
        let state = self.read_state();

        let total_tls_passthrough = if self.settings.tls_passthrough_enabled() {
            state
                .hosts
                .values()
                .filter(|resource| matches!(resource, Resource::TransportServer(_)))
                .count()
        } else {
            0
        };

        let mut total_tcp = 0;
        let mut total_udp = 0;
        for ts_config in state.listener_hosts.values() {
            if ts_config.transport_server().spec.listener.protocol == ListenerProtocol::Tcp {
                total_tcp += 1;
            } else {
                total_udp += 1;
            }
        }

        TransportServerMetrics {
            total_tls_passthrough,
            total_tcp,
            total_udp,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes a validator's report into the change evicting the resource, when
/// one exists; otherwise surfaces it as an error-grade problem so the
/// rejection is never silent.
fn attach_validation_error(
    changes: &mut [ResourceChange],
    problems: &mut Vec<ConfigurationProblem>,
    object: KubeObject,
    change_error: &str,
    problem_message: String,
) {
    let key = object.resource_key();

    if let Some(change) = changes
        .iter_mut()
        .find(|change| change.resource().key() == key)
    {
        change.set_error(change_error.to_string());
        return;
    }

    problems.push(ConfigurationProblem::rejected(object, problem_message));
}
