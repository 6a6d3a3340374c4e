//! Identity types for the configuration objects the control plane tracks.

use std::fmt::{Display, Formatter, Write};
use std::str::FromStr;
use std::sync::Arc;

use gatehouse_api::v1::{TransportServer, VirtualServer, VirtualServerRoute};
use getset::Getters;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use strum::IntoStaticStr;
use thiserror::Error;

/// Kinds of configuration objects that can own hosts or listeners.
///
/// Variant order matches the lexicographic order of the kind names so the
/// derived `Ord` sorts keys the same way their rendered form would.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, IntoStaticStr)]
pub enum ResourceKind {
    Ingress,
    TransportServer,
    VirtualServer,
    VirtualServerRoute,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s: &'static str = self.into();
        f.write_str(s)
    }
}

/// `namespace/name` identity of an object within its kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Getters)]
pub struct ObjectKey {
    #[getset(get = "pub")]
    namespace: String,

    #[getset(get = "pub")]
    name: String,
}

impl ObjectKey {
    pub fn new<S: Into<String>, T: Into<String>>(namespace: S, name: T) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Resolves a `name` or `namespace/name` reference, defaulting the
    /// namespace to that of the referring object.
    pub fn from_reference(reference: &str, default_namespace: &str) -> Self {
        match reference.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(default_namespace, reference),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.namespace)?;
        f.write_char('/')?;
        f.write_str(&self.name)
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ParseKeyError {
    #[error("key {0} is not in the namespace/name form")]
    InvalidForm(String),
}

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ParseKeyError::InvalidForm(s.to_string())),
        }
    }
}

/// `Kind/namespace/name` identity, unique across all tracked kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Getters)]
pub struct ResourceKey {
    #[getset(get = "pub")]
    kind: ResourceKind,

    #[getset(get = "pub")]
    namespace: String,

    #[getset(get = "pub")]
    name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, object_key: ObjectKey) -> Self {
        Self {
            kind,
            namespace: object_key.namespace,
            name: object_key.name,
        }
    }

    pub fn from_meta(kind: ResourceKind, meta: &ObjectMeta) -> Self {
        Self::new(kind, ObjectKey::from_meta(meta))
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Key of a TCP/UDP listener claim: the listener name paired with the host
/// (empty for host-agnostic listeners).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Getters)]
pub struct ListenerHostKey {
    #[getset(get = "pub")]
    listener_name: String,

    #[getset(get = "pub")]
    host: String,
}

impl ListenerHostKey {
    pub fn new<S: Into<String>, T: Into<String>>(listener_name: S, host: T) -> Self {
        Self {
            listener_name: listener_name.into(),
            host: host.into(),
        }
    }
}

impl Display for ListenerHostKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.listener_name, self.host)
    }
}

/// A configuration object as delivered by the watch layer.
#[derive(Clone, Debug)]
pub enum KubeObject {
    Ingress(Arc<Ingress>),
    VirtualServer(Arc<VirtualServer>),
    VirtualServerRoute(Arc<VirtualServerRoute>),
    TransportServer(Arc<TransportServer>),
}

impl KubeObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            KubeObject::Ingress(_) => ResourceKind::Ingress,
            KubeObject::VirtualServer(_) => ResourceKind::VirtualServer,
            KubeObject::VirtualServerRoute(_) => ResourceKind::VirtualServerRoute,
            KubeObject::TransportServer(_) => ResourceKind::TransportServer,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            KubeObject::Ingress(ingress) => &ingress.metadata,
            KubeObject::VirtualServer(vs) => &vs.metadata,
            KubeObject::VirtualServerRoute(vsr) => &vsr.metadata,
            KubeObject::TransportServer(ts) => &ts.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_meta(self.meta())
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::from_meta(self.kind(), self.meta())
    }

    /// The `ingressClassName` carried in the object's spec, if any.
    pub fn ingress_class_name(&self) -> Option<&str> {
        match self {
            KubeObject::Ingress(ingress) => ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.ingress_class_name.as_deref()),
            KubeObject::VirtualServer(vs) => vs.spec.ingress_class_name.as_deref(),
            KubeObject::VirtualServerRoute(vsr) => vsr.spec.ingress_class_name.as_deref(),
            KubeObject::TransportServer(ts) => ts.spec.ingress_class_name.as_deref(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display_and_parse() {
        let key = ObjectKey::new("default", "cafe");
        assert_eq!(key.to_string(), "default/cafe");
        assert_eq!("default/cafe".parse::<ObjectKey>().unwrap(), key);

        assert!(matches!(
            "cafe".parse::<ObjectKey>(),
            Err(ParseKeyError::InvalidForm(_))
        ));
        assert!(matches!(
            "/cafe".parse::<ObjectKey>(),
            Err(ParseKeyError::InvalidForm(_))
        ));
    }

    #[test]
    fn test_object_key_from_reference() {
        assert_eq!(
            ObjectKey::from_reference("coffee", "default"),
            ObjectKey::new("default", "coffee")
        );
        assert_eq!(
            ObjectKey::from_reference("other/coffee", "default"),
            ObjectKey::new("other", "coffee")
        );
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new(
            ResourceKind::VirtualServer,
            ObjectKey::new("default", "cafe"),
        );
        assert_eq!(key.to_string(), "VirtualServer/default/cafe");
    }

    #[test]
    fn test_resource_key_ordering_matches_rendered_form() {
        let mut keys = vec![
            ResourceKey::new(ResourceKind::VirtualServerRoute, ObjectKey::new("a", "a")),
            ResourceKey::new(ResourceKind::VirtualServer, ObjectKey::new("z", "z")),
            ResourceKey::new(ResourceKind::TransportServer, ObjectKey::new("m", "m")),
            ResourceKey::new(ResourceKind::Ingress, ObjectKey::new("z", "a")),
        ];
        keys.sort();

        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let mut sorted_rendered = rendered.clone();
        sorted_rendered.sort();
        assert_eq!(rendered, sorted_rendered);
    }

    #[test]
    fn test_listener_host_key_display() {
        assert_eq!(
            ListenerHostKey::new("dns-udp", "").to_string(),
            "dns-udp|"
        );
        assert_eq!(
            ListenerHostKey::new("tcp-5353", "db.example.com").to_string(),
            "tcp-5353|db.example.com"
        );
    }
}
