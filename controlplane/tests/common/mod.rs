#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use gatehouse_api::constants::{
    HTTP01_SOLVER_LABEL, HTTP01_SOLVER_LABEL_VALUE, MERGEABLE_INGRESS_TYPE_ANNOTATION,
    MERGEABLE_INGRESS_TYPE_MASTER, MERGEABLE_INGRESS_TYPE_MINION, TLS_PASSTHROUGH_LISTENER_NAME,
};
use gatehouse_api::v1::{
    GlobalConfiguration, GlobalConfigurationSpec, Listener, ListenerProtocol, Route,
    TransportServer, TransportServerListener, TransportServerSpec, TransportServerUpstream,
    VirtualServer, VirtualServerListener, VirtualServerRoute, VirtualServerRouteSpec,
    VirtualServerSpec,
};
use gatehouse_api::validation::{
    GlobalConfigurationValidator, TransportServerValidator, VirtualServerValidator,
};
use gatehouse_controlplane::configuration::{
    Configuration, Operation, Resource, ResourceChange, Settings,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

pub fn new_configuration() -> Configuration {
    new_configuration_with_settings(Settings::default())
}

pub fn new_configuration_with_settings(settings: Settings) -> Configuration {
    Configuration::new(
        Box::new(|_| true),
        VirtualServerValidator::new(settings.snippets_enabled(), settings.internal_routes_enabled()),
        GlobalConfigurationValidator::default(),
        TransportServerValidator::new(settings.tls_passthrough_enabled(), settings.snippets_enabled()),
        settings,
    )
}

pub fn timestamp(secs: i64) -> Time {
    Time(chrono::DateTime::from_timestamp(secs, 0).unwrap())
}

pub fn object_meta(namespace: &str, name: &str, created_secs: i64, uid: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        creation_timestamp: Some(timestamp(created_secs)),
        uid: Some(uid.to_string()),
        generation: Some(1),
        ..ObjectMeta::default()
    }
}

fn http_path(path: &str, service: &str, port: i32) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(path.to_string()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        },
    }
}

fn ingress_rule(host: &str, paths: &[&str]) -> IngressRule {
    IngressRule {
        host: Some(host.to_string()),
        http: if paths.is_empty() {
            None
        } else {
            Some(HTTPIngressRuleValue {
                paths: paths
                    .iter()
                    .map(|path| http_path(path, "backend-svc", 80))
                    .collect(),
            })
        },
    }
}

pub fn ingress(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    hosts_with_paths: &[(&str, &[&str])],
) -> Arc<Ingress> {
    Arc::new(Ingress {
        metadata: object_meta(namespace, name, created_secs, uid),
        spec: Some(IngressSpec {
            rules: Some(
                hosts_with_paths
                    .iter()
                    .map(|(host, paths)| ingress_rule(host, paths))
                    .collect(),
            ),
            ..IngressSpec::default()
        }),
        status: None,
    })
}

pub fn master_ingress(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
) -> Arc<Ingress> {
    let mut ingress = ingress(namespace, name, created_secs, uid, &[(host, &[])]);
    Arc::get_mut(&mut ingress).unwrap().metadata.annotations = Some(
        [(
            MERGEABLE_INGRESS_TYPE_ANNOTATION.to_string(),
            MERGEABLE_INGRESS_TYPE_MASTER.to_string(),
        )]
        .into(),
    );
    ingress
}

pub fn minion_ingress(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
    paths: &[&str],
) -> Arc<Ingress> {
    let mut ingress = ingress(namespace, name, created_secs, uid, &[(host, paths)]);
    Arc::get_mut(&mut ingress).unwrap().metadata.annotations = Some(
        [(
            MERGEABLE_INGRESS_TYPE_ANNOTATION.to_string(),
            MERGEABLE_INGRESS_TYPE_MINION.to_string(),
        )]
        .into(),
    );
    ingress
}

pub fn challenge_ingress(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
    path: &str,
    service: &str,
    port: i32,
) -> Arc<Ingress> {
    Arc::new(Ingress {
        metadata: ObjectMeta {
            labels: Some(
                [(
                    HTTP01_SOLVER_LABEL.to_string(),
                    HTTP01_SOLVER_LABEL_VALUE.to_string(),
                )]
                .into(),
            ),
            ..object_meta(namespace, name, created_secs, uid)
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![http_path(path, service, port)],
                }),
            }]),
            ..IngressSpec::default()
        }),
        status: None,
    })
}

pub fn virtual_server(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
) -> Arc<VirtualServer> {
    Arc::new(VirtualServer {
        metadata: object_meta(namespace, name, created_secs, uid),
        spec: VirtualServerSpec {
            host: host.to_string(),
            ..VirtualServerSpec::default()
        },
        ..VirtualServer::default()
    })
}

pub fn virtual_server_with_routes(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
    routes: &[(&str, &str)],
) -> Arc<VirtualServer> {
    Arc::new(VirtualServer {
        metadata: object_meta(namespace, name, created_secs, uid),
        spec: VirtualServerSpec {
            host: host.to_string(),
            routes: routes
                .iter()
                .map(|(path, route)| Route {
                    path: (*path).to_string(),
                    route: Some((*route).to_string()),
                    ..Route::default()
                })
                .collect(),
            ..VirtualServerSpec::default()
        },
        ..VirtualServer::default()
    })
}

pub fn virtual_server_with_listener(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
    http: Option<&str>,
    https: Option<&str>,
) -> Arc<VirtualServer> {
    Arc::new(VirtualServer {
        metadata: object_meta(namespace, name, created_secs, uid),
        spec: VirtualServerSpec {
            host: host.to_string(),
            listener: Some(VirtualServerListener {
                http: http.map(ToString::to_string),
                https: https.map(ToString::to_string),
            }),
            ..VirtualServerSpec::default()
        },
        ..VirtualServer::default()
    })
}

pub fn virtual_server_route(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
    paths: &[&str],
) -> Arc<VirtualServerRoute> {
    Arc::new(VirtualServerRoute {
        metadata: object_meta(namespace, name, created_secs, uid),
        spec: VirtualServerRouteSpec {
            host: host.to_string(),
            upstreams: vec![],
            subroutes: paths
                .iter()
                .map(|path| Route {
                    path: (*path).to_string(),
                    action: Some(gatehouse_api::v1::Action {
                        pass: None,
                    }),
                    ..Route::default()
                })
                .collect(),
            ..VirtualServerRouteSpec::default()
        },
    })
}

pub fn transport_server(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    listener_name: &str,
    protocol: ListenerProtocol,
    host: &str,
) -> Arc<TransportServer> {
    Arc::new(TransportServer {
        metadata: object_meta(namespace, name, created_secs, uid),
        spec: TransportServerSpec {
            listener: TransportServerListener {
                name: listener_name.to_string(),
                protocol,
            },
            host: host.to_string(),
            upstreams: vec![TransportServerUpstream {
                name: "backend".to_string(),
                service: "backend-svc".to_string(),
                port: 5353,
            }],
            ..TransportServerSpec::default()
        },
        ..TransportServer::default()
    })
}

pub fn tls_passthrough_server(
    namespace: &str,
    name: &str,
    created_secs: i64,
    uid: &str,
    host: &str,
) -> Arc<TransportServer> {
    transport_server(
        namespace,
        name,
        created_secs,
        uid,
        TLS_PASSTHROUGH_LISTENER_NAME,
        ListenerProtocol::TlsPassthrough,
        host,
    )
}

pub fn global_configuration(
    listeners: &[(&str, u16, ListenerProtocol, bool)],
) -> Arc<GlobalConfiguration> {
    Arc::new(GlobalConfiguration {
        metadata: ObjectMeta {
            namespace: Some("gatehouse".to_string()),
            name: Some("gatehouse".to_string()),
            ..ObjectMeta::default()
        },
        spec: GlobalConfigurationSpec {
            listeners: listeners
                .iter()
                .map(|(name, port, protocol, ssl)| Listener {
                    name: (*name).to_string(),
                    port: *port,
                    protocol: *protocol,
                    ssl: *ssl,
                    ipv4: None,
                    ipv6: None,
                })
                .collect(),
        },
        ..GlobalConfiguration::default()
    })
}

/// Renders changes as `(op, "Kind/namespace/name")` pairs for compact
/// assertions.
pub fn change_summary(changes: &[ResourceChange]) -> Vec<(Operation, String)> {
    changes
        .iter()
        .map(|change| (*change.op(), change.resource().key().to_string()))
        .collect()
}

pub fn single_add_or_update(changes: &[ResourceChange]) -> &Resource {
    assert_eq!(changes.len(), 1, "expected exactly one change");
    assert_eq!(*changes[0].op(), Operation::AddOrUpdate);
    changes[0].resource()
}
