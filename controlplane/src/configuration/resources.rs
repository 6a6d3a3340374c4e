//! Derived configuration resources: the objects the reconciliation emits to
//! the proxy-configuration renderer.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use gatehouse_api::v1::{TransportServer, VirtualServer, VirtualServerRoute};
use getset::Getters;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::objects::{ObjectKey, ResourceKey, ResourceKind};

/// Operation to perform on a resource's piece of the proxy configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Remove the config of the resource.
    Delete,
    /// Add or update the config of the resource.
    AddOrUpdate,
}

/// A change to a resource that needs to be reflected in the proxy config.
#[derive(Clone, Debug, Getters)]
pub struct ResourceChange {
    #[getset(get = "pub")]
    op: Operation,

    #[getset(get = "pub")]
    resource: Resource,

    /// Validation failure report carried along with the change.
    #[getset(get = "pub")]
    error: Option<String>,
}

impl ResourceChange {
    pub(crate) fn delete(resource: Resource) -> Self {
        Self {
            op: Operation::Delete,
            resource,
            error: None,
        }
    }

    pub(crate) fn add_or_update(resource: Resource) -> Self {
        Self {
            op: Operation::AddOrUpdate,
            resource,
            error: None,
        }
    }

    pub(crate) fn set_error(&mut self, error: String) {
        self.error = Some(error);
    }

    pub(crate) fn set_resource(&mut self, resource: Resource) {
        self.resource = resource;
    }
}

/// A top-level configuration resource: a regular or master Ingress, a
/// VirtualServer, or a TransportServer.
#[derive(Clone, Debug)]
pub enum Resource {
    Ingress(IngressConfiguration),
    VirtualServer(VirtualServerConfiguration),
    TransportServer(TransportServerConfiguration),
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        match self {
            Resource::Ingress(ic) => {
                ResourceKey::from_meta(ResourceKind::Ingress, &ic.ingress.metadata)
            }
            Resource::VirtualServer(vsc) => {
                ResourceKey::from_meta(ResourceKind::VirtualServer, &vsc.virtual_server.metadata)
            }
            Resource::TransportServer(tsc) => ResourceKey::from_meta(
                ResourceKind::TransportServer,
                &tsc.transport_server.metadata,
            ),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Resource::Ingress(ic) => &ic.ingress.metadata,
            Resource::VirtualServer(vsc) => &vsc.virtual_server.metadata,
            Resource::TransportServer(tsc) => &tsc.transport_server.metadata,
        }
    }

    /// Tells if this resource wins over the specified resource when both
    /// claim the same host or listener.
    pub fn wins(&self, other: &Resource) -> bool {
        choose_object_meta_winner(self.meta(), other.meta())
    }

    pub fn add_warning<S: Into<String>>(&mut self, warning: S) {
        match self {
            Resource::Ingress(ic) => ic.warnings.push(warning.into()),
            Resource::VirtualServer(vsc) => vsc.warnings.push(warning.into()),
            Resource::TransportServer(tsc) => tsc.warnings.push(warning.into()),
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Resource::Ingress(ic) => &ic.warnings,
            Resource::VirtualServer(vsc) => &vsc.warnings,
            Resource::TransportServer(tsc) => &tsc.warnings,
        }
    }

    /// Structural equality used by change detection. Warnings are excluded:
    /// they are advisory and do not require a config write on their own.
    pub fn is_equal(&self, other: &Resource) -> bool {
        match (self, other) {
            (Resource::Ingress(a), Resource::Ingress(b)) => a.is_equal(b),
            (Resource::VirtualServer(a), Resource::VirtualServer(b)) => a.is_equal(b),
            (Resource::TransportServer(a), Resource::TransportServer(b)) => a.is_equal(b),
            _ => false,
        }
    }
}

/// The older object wins; on a creation-timestamp tie the greater UID wins.
/// Total and antisymmetric for distinct objects, which makes collision
/// resolution independent of claim order.
pub(crate) fn choose_object_meta_winner(meta1: &ObjectMeta, meta2: &ObjectMeta) -> bool {
    let created1 = meta1.creation_timestamp.as_ref().map(|t| t.0);
    let created2 = meta2.creation_timestamp.as_ref().map(|t| t.0);

    if created1 == created2 {
        return meta1.uid > meta2.uid;
    }

    created1 < created2
}

pub(crate) fn compare_object_metas(meta1: &ObjectMeta, meta2: &ObjectMeta) -> bool {
    meta1.namespace == meta2.namespace
        && meta1.name == meta2.name
        && meta1.generation == meta2.generation
}

pub(crate) fn compare_object_metas_with_annotations(
    meta1: &ObjectMeta,
    meta2: &ObjectMeta,
) -> bool {
    compare_object_metas(meta1, meta2) && meta1.annotations == meta2.annotations
}

/// An Ingress resource with its minions.
#[derive(Clone, Debug, Getters)]
pub struct IngressConfiguration {
    /// A regular or master Ingress.
    #[getset(get = "pub")]
    ingress: Arc<Ingress>,

    #[getset(get = "pub")]
    is_master: bool,

    /// Minions, when the Ingress is a master.
    #[getset(get = "pub")]
    minions: Vec<MinionConfiguration>,

    /// Marks each host of the Ingress as owned (true) or taken by another
    /// resource (false).
    #[getset(get = "pub")]
    valid_hosts: BTreeMap<String, bool>,

    #[getset(get = "pub")]
    warnings: Vec<String>,

    /// Warnings of the minions, keyed by their `namespace/name`.
    #[getset(get = "pub")]
    child_warnings: BTreeMap<ObjectKey, Vec<String>>,
}

impl IngressConfiguration {
    pub(crate) fn new_regular(ingress: Arc<Ingress>) -> Self {
        Self {
            ingress,
            is_master: false,
            minions: Vec::new(),
            valid_hosts: BTreeMap::new(),
            warnings: Vec::new(),
            child_warnings: BTreeMap::new(),
        }
    }

    pub(crate) fn new_master(
        ingress: Arc<Ingress>,
        minions: Vec<MinionConfiguration>,
        child_warnings: BTreeMap<ObjectKey, Vec<String>>,
    ) -> Self {
        Self {
            ingress,
            is_master: true,
            minions,
            valid_hosts: BTreeMap::new(),
            warnings: Vec::new(),
            child_warnings,
        }
    }

    pub(crate) fn set_valid_host(&mut self, host: &str, valid: bool) {
        self.valid_hosts.insert(host.to_string(), valid);
    }

    pub fn has_valid_host(&self) -> bool {
        self.valid_hosts.values().any(|valid| *valid)
    }

    fn is_equal(&self, other: &IngressConfiguration) -> bool {
        compare_object_metas_with_annotations(&self.ingress.metadata, &other.ingress.metadata)
            && self.valid_hosts == other.valid_hosts
            && self.is_master == other.is_master
            && self.minions.len() == other.minions.len()
            && self
                .minions
                .iter()
                .zip(&other.minions)
                .all(|(a, b)| {
                    compare_object_metas_with_annotations(
                        &a.ingress.metadata,
                        &b.ingress.metadata,
                    )
                })
    }
}

/// A minion Ingress contributing paths to its master's host.
#[derive(Clone, Debug, Getters)]
pub struct MinionConfiguration {
    #[getset(get = "pub")]
    ingress: Arc<Ingress>,

    /// Marks each path of the minion as owned (true) or taken by another
    /// minion (false).
    #[getset(get = "pub")]
    valid_paths: BTreeMap<String, bool>,
}

impl MinionConfiguration {
    pub(crate) fn new(ingress: Arc<Ingress>) -> Self {
        Self {
            ingress,
            valid_paths: BTreeMap::new(),
        }
    }

    pub(crate) fn set_valid_path(&mut self, path: &str, valid: bool) {
        self.valid_paths.insert(path.to_string(), valid);
    }
}

/// A VirtualServer along with its active VirtualServerRoutes and the
/// listener ports resolved from the GlobalConfiguration.
#[derive(Clone, Debug, Getters)]
pub struct VirtualServerConfiguration {
    #[getset(get = "pub")]
    virtual_server: Arc<VirtualServer>,

    #[getset(get = "pub")]
    virtual_server_routes: Vec<Arc<VirtualServerRoute>>,

    #[getset(get = "pub")]
    warnings: Vec<String>,

    #[getset(get = "pub")]
    http_port: Option<u16>,

    #[getset(get = "pub")]
    https_port: Option<u16>,

    #[getset(get = "pub")]
    http_ipv4: Option<IpAddr>,

    #[getset(get = "pub")]
    http_ipv6: Option<IpAddr>,

    #[getset(get = "pub")]
    https_ipv4: Option<IpAddr>,

    #[getset(get = "pub")]
    https_ipv6: Option<IpAddr>,
}

impl VirtualServerConfiguration {
    pub(crate) fn new(
        virtual_server: Arc<VirtualServer>,
        virtual_server_routes: Vec<Arc<VirtualServerRoute>>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            virtual_server,
            virtual_server_routes,
            warnings,
            http_port: None,
            https_port: None,
            http_ipv4: None,
            http_ipv6: None,
            https_ipv4: None,
            https_ipv6: None,
        }
    }

    pub(crate) fn set_http_listener(
        &mut self,
        port: u16,
        ipv4: Option<IpAddr>,
        ipv6: Option<IpAddr>,
    ) {
        self.http_port = Some(port);
        self.http_ipv4 = ipv4;
        self.http_ipv6 = ipv6;
    }

    pub(crate) fn set_https_listener(
        &mut self,
        port: u16,
        ipv4: Option<IpAddr>,
        ipv6: Option<IpAddr>,
    ) {
        self.https_port = Some(port);
        self.https_ipv4 = ipv4;
        self.https_ipv6 = ipv6;
    }

    fn is_equal(&self, other: &VirtualServerConfiguration) -> bool {
        compare_object_metas(
            &self.virtual_server.metadata,
            &other.virtual_server.metadata,
        ) && self.virtual_server_routes.len() == other.virtual_server_routes.len()
            && self
                .virtual_server_routes
                .iter()
                .zip(&other.virtual_server_routes)
                .all(|(a, b)| compare_object_metas(&a.metadata, &b.metadata))
    }
}

/// A TransportServer with the listener port and addresses resolved from the
/// GlobalConfiguration.
#[derive(Clone, Debug, Getters)]
pub struct TransportServerConfiguration {
    #[getset(get = "pub")]
    transport_server: Arc<TransportServer>,

    #[getset(get = "pub")]
    listener_port: Option<u16>,

    #[getset(get = "pub")]
    ipv4: Option<IpAddr>,

    #[getset(get = "pub")]
    ipv6: Option<IpAddr>,

    #[getset(get = "pub")]
    warnings: Vec<String>,
}

impl TransportServerConfiguration {
    pub(crate) fn new(transport_server: Arc<TransportServer>) -> Self {
        Self {
            transport_server,
            listener_port: None,
            ipv4: None,
            ipv6: None,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn set_listener(&mut self, port: u16, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>) {
        self.listener_port = Some(port);
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
    }

    pub(crate) fn add_warning<S: Into<String>>(&mut self, warning: S) {
        self.warnings.push(warning.into());
    }

    pub(crate) fn wins(&self, other: &TransportServerConfiguration) -> bool {
        choose_object_meta_winner(
            &self.transport_server.metadata,
            &other.transport_server.metadata,
        )
    }

    pub(crate) fn is_equal(&self, other: &TransportServerConfiguration) -> bool {
        compare_object_metas(
            &self.transport_server.metadata,
            &other.transport_server.metadata,
        ) && self.listener_port == other.listener_port
    }

    pub(crate) fn key(&self) -> ResourceKey {
        ResourceKey::from_meta(
            ResourceKind::TransportServer,
            &self.transport_server.metadata,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn meta(name: &str, timestamp: Option<Time>, uid: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            creation_timestamp: timestamp,
            uid: Some(uid.to_string()),
            ..ObjectMeta::default()
        }
    }

    fn time(secs: i64) -> Time {
        Time(chrono::DateTime::from_timestamp(secs, 0).unwrap())
    }

    #[test]
    fn test_older_object_wins() {
        let older = meta("a", Some(time(100)), "uid-1");
        let newer = meta("b", Some(time(200)), "uid-2");

        assert!(choose_object_meta_winner(&older, &newer));
        assert!(!choose_object_meta_winner(&newer, &older));
    }

    #[test]
    fn test_greater_uid_wins_on_timestamp_tie() {
        let low = meta("a", Some(time(100)), "uid-1");
        let high = meta("b", Some(time(100)), "uid-2");

        assert!(choose_object_meta_winner(&high, &low));
        assert!(!choose_object_meta_winner(&low, &high));
    }

    #[test]
    fn test_winner_choice_is_antisymmetric() {
        let metas = [
            meta("a", Some(time(100)), "uid-1"),
            meta("b", Some(time(100)), "uid-2"),
            meta("c", Some(time(200)), "uid-0"),
            meta("d", None, "uid-9"),
        ];

        for (i, m1) in metas.iter().enumerate() {
            for (j, m2) in metas.iter().enumerate() {
                if i == j {
                    continue;
                }
                assert_ne!(
                    choose_object_meta_winner(m1, m2),
                    choose_object_meta_winner(m2, m1),
                    "metas {i} and {j}"
                );
            }
        }
    }

    #[test]
    fn test_unset_timestamp_beats_any_set_timestamp() {
        let unset = meta("a", None, "uid-1");
        let set = meta("b", Some(time(100)), "uid-2");

        assert!(choose_object_meta_winner(&unset, &set));
    }

    #[test]
    fn test_object_meta_comparison_ignores_annotations() {
        let mut meta1 = meta("a", Some(time(100)), "uid-1");
        let mut meta2 = meta1.clone();
        meta2.annotations = Some([("k".to_string(), "v".to_string())].into());

        assert!(compare_object_metas(&meta1, &meta2));
        assert!(!compare_object_metas_with_annotations(&meta1, &meta2));

        meta1.generation = Some(2);
        assert!(!compare_object_metas(&meta1, &meta2));
    }
}
