use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use strum::IntoStaticStr;

/// VirtualServer defines HTTP routing for a single host. Sub-paths can be
/// delegated to VirtualServerRoute resources in other namespaces.
#[derive(Default, CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    kind = "VirtualServer",
    group = "gatehouse.dev",
    version = "v1",
    namespaced,
    shortname = "vs"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct VirtualServerSpec {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<VirtualServerListener>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dos: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_snippets: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal_route: bool,
}

/// VirtualServerRoute carries a slice of a VirtualServer's paths. It only
/// becomes active when the owning VirtualServer lists it under `routes`.
#[derive(Default, CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    kind = "VirtualServerRoute",
    group = "gatehouse.dev",
    version = "v1",
    namespaced,
    shortname = "vsr"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct VirtualServerRouteSpec {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subroutes: Vec<Route>,
}

/// TransportServer routes TCP, UDP, or TLS passthrough traffic. The listener
/// reference binds it either to a GlobalConfiguration listener or, for the
/// reserved `tls-passthrough` name, to SNI-based passthrough routing.
#[derive(Default, CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    kind = "TransportServer",
    group = "gatehouse.dev",
    version = "v1",
    namespaced,
    shortname = "ts"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct TransportServerSpec {
    pub listener: TransportServerListener,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<TransportServerUpstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<TransportServerAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_snippets: Option<String>,
}

/// GlobalConfiguration enumerates the named listeners TransportServers and
/// VirtualServer `listener` sections may bind to. A cluster runs at most one.
#[derive(Default, CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    kind = "GlobalConfiguration",
    group = "gatehouse.dev",
    version = "v1",
    namespaced,
    shortname = "gc"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct GlobalConfigurationSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<Listener>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ssl: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<IpAddr>,
}

#[derive(
    Default, Deserialize, Serialize, Copy, Clone, Debug, JsonSchema, PartialEq, Eq, Hash,
    IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerProtocol {
    Http,
    #[default]
    Tcp,
    Udp,
    TlsPassthrough,
}

impl Display for ListenerProtocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s: &'static str = self.into();
        f.write_str(s)
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerListener {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub name: String,
    pub service: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_cluster_ip: bool,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub path: String,

    /// Reference to a VirtualServerRoute as `name` or `namespace/name`.
    /// Mutually exclusive with `action`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dos: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerListener {
    pub name: String,
    pub protocol: ListenerProtocol,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerUpstream {
    pub name: String,
    pub service: String,
    pub port: u16,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}
