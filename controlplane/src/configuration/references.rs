//! Reverse-dependency predicates: does a resource reference object
//! `(namespace, name)`? One checker per dependency kind; the store dispatches
//! reverse-lookup queries through them.

use gatehouse_api::constants::{JWT_KEY_ANNOTATION, RATE_LIMIT_SCALING_ANNOTATION};
use gatehouse_api::v1::{PolicyReference, Route, TransportServer, VirtualServer, VirtualServerRoute};
use k8s_openapi::api::networking::v1::Ingress;

use super::ingress::{ingress_rules, rule_paths};
use crate::objects::ObjectKey;

pub(super) trait ReferenceChecker {
    fn is_referenced_by_ingress(&self, _namespace: &str, _name: &str, _ingress: &Ingress) -> bool {
        false
    }

    fn is_referenced_by_minion(&self, _namespace: &str, _name: &str, _ingress: &Ingress) -> bool {
        false
    }

    fn is_referenced_by_virtual_server(
        &self,
        _namespace: &str,
        _name: &str,
        _vs: &VirtualServer,
    ) -> bool {
        false
    }

    fn is_referenced_by_virtual_server_route(
        &self,
        _namespace: &str,
        _name: &str,
        _vsr: &VirtualServerRoute,
    ) -> bool {
        false
    }

    fn is_referenced_by_transport_server(
        &self,
        _namespace: &str,
        _name: &str,
        _ts: &TransportServer,
    ) -> bool {
        false
    }
}

fn object_namespace(meta_namespace: Option<&str>) -> &str {
    meta_namespace.unwrap_or_default()
}

/// Matches resources that route traffic to a Service. With `for_endpoints`
/// the check answers for the Service's Endpoints instead, which upstreams
/// bound to the cluster IP never consume.
pub(super) struct ServiceReferenceChecker {
    for_endpoints: bool,
}

impl ServiceReferenceChecker {
    pub(super) fn new(for_endpoints: bool) -> Self {
        Self { for_endpoints }
    }
}

impl ReferenceChecker for ServiceReferenceChecker {
    fn is_referenced_by_ingress(&self, namespace: &str, name: &str, ingress: &Ingress) -> bool {
        if object_namespace(ingress.metadata.namespace.as_deref()) != namespace {
            return false;
        }

        let default_backend_matches = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.default_backend.as_ref())
            .and_then(|backend| backend.service.as_ref())
            .is_some_and(|service| service.name == name);
        if default_backend_matches {
            return true;
        }

        ingress_rules(ingress).iter().any(|rule| {
            rule_paths(rule).iter().any(|path| {
                path.backend
                    .service
                    .as_ref()
                    .is_some_and(|service| service.name == name)
            })
        })
    }

    fn is_referenced_by_minion(&self, namespace: &str, name: &str, ingress: &Ingress) -> bool {
        self.is_referenced_by_ingress(namespace, name, ingress)
    }

    fn is_referenced_by_virtual_server(
        &self,
        namespace: &str,
        name: &str,
        vs: &VirtualServer,
    ) -> bool {
        object_namespace(vs.metadata.namespace.as_deref()) == namespace
            && vs.spec.upstreams.iter().any(|upstream| {
                upstream.service == name && !(self.for_endpoints && upstream.use_cluster_ip)
            })
    }

    fn is_referenced_by_virtual_server_route(
        &self,
        namespace: &str,
        name: &str,
        vsr: &VirtualServerRoute,
    ) -> bool {
        object_namespace(vsr.metadata.namespace.as_deref()) == namespace
            && vsr.spec.upstreams.iter().any(|upstream| {
                upstream.service == name && !(self.for_endpoints && upstream.use_cluster_ip)
            })
    }

    fn is_referenced_by_transport_server(
        &self,
        namespace: &str,
        name: &str,
        ts: &TransportServer,
    ) -> bool {
        object_namespace(ts.metadata.namespace.as_deref()) == namespace
            && ts
                .spec
                .upstreams
                .iter()
                .any(|upstream| upstream.service == name)
    }
}

/// Matches resources whose TLS termination or JWT verification consumes a
/// Secret.
pub(super) struct SecretReferenceChecker {
    is_plus: bool,
}

impl SecretReferenceChecker {
    pub(super) fn new(is_plus: bool) -> Self {
        Self { is_plus }
    }
}

impl ReferenceChecker for SecretReferenceChecker {
    fn is_referenced_by_ingress(&self, namespace: &str, name: &str, ingress: &Ingress) -> bool {
        if object_namespace(ingress.metadata.namespace.as_deref()) != namespace {
            return false;
        }

        let tls_matches = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.tls.as_ref())
            .is_some_and(|tls| {
                tls.iter()
                    .any(|entry| entry.secret_name.as_deref() == Some(name))
            });
        if tls_matches {
            return true;
        }

        self.is_plus
            && ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(JWT_KEY_ANNOTATION))
                .is_some_and(|secret| secret == name)
    }

    fn is_referenced_by_virtual_server(
        &self,
        namespace: &str,
        name: &str,
        vs: &VirtualServer,
    ) -> bool {
        object_namespace(vs.metadata.namespace.as_deref()) == namespace
            && vs
                .spec
                .tls
                .as_ref()
                .and_then(|tls| tls.secret.as_deref())
                .is_some_and(|secret| secret == name)
    }
}

fn policy_matches(
    policies: &[PolicyReference],
    namespace: &str,
    name: &str,
    default_namespace: &str,
) -> bool {
    policies.iter().any(|policy| {
        policy.name == name
            && policy.namespace.as_deref().unwrap_or(default_namespace) == namespace
    })
}

fn route_policies_match(routes: &[Route], namespace: &str, name: &str, default_namespace: &str) -> bool {
    routes
        .iter()
        .any(|route| policy_matches(&route.policies, namespace, name, default_namespace))
}

/// Matches resources governed by a Policy.
pub(super) struct PolicyReferenceChecker;

impl ReferenceChecker for PolicyReferenceChecker {
    fn is_referenced_by_virtual_server(
        &self,
        namespace: &str,
        name: &str,
        vs: &VirtualServer,
    ) -> bool {
        let default_namespace = object_namespace(vs.metadata.namespace.as_deref());
        policy_matches(&vs.spec.policies, namespace, name, default_namespace)
            || route_policies_match(&vs.spec.routes, namespace, name, default_namespace)
    }

    fn is_referenced_by_virtual_server_route(
        &self,
        namespace: &str,
        name: &str,
        vsr: &VirtualServerRoute,
    ) -> bool {
        let default_namespace = object_namespace(vsr.metadata.namespace.as_deref());
        route_policies_match(&vsr.spec.subroutes, namespace, name, default_namespace)
    }
}

fn annotation_reference_matches(
    annotation_value: &str,
    namespace: &str,
    name: &str,
    default_namespace: &str,
) -> bool {
    ObjectKey::from_reference(annotation_value, default_namespace)
        == ObjectKey::new(namespace, name)
}

/// Matches Ingress resources that pull in an App Protect resource through
/// the configured annotation.
pub(super) struct AppProtectResourceReferenceChecker {
    annotation: &'static str,
}

impl AppProtectResourceReferenceChecker {
    pub(super) fn new(annotation: &'static str) -> Self {
        Self { annotation }
    }
}

impl ReferenceChecker for AppProtectResourceReferenceChecker {
    fn is_referenced_by_ingress(&self, namespace: &str, name: &str, ingress: &Ingress) -> bool {
        let default_namespace = object_namespace(ingress.metadata.namespace.as_deref());
        ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(self.annotation))
            .is_some_and(|value| {
                annotation_reference_matches(value, namespace, name, default_namespace)
            })
    }
}

/// Matches resources protected by an App Protect DOS resource, referenced
/// either through the Ingress annotation or the `dos` spec fields.
pub(super) struct DosResourceReferenceChecker {
    annotation: &'static str,
}

impl DosResourceReferenceChecker {
    pub(super) fn new(annotation: &'static str) -> Self {
        Self { annotation }
    }
}

impl ReferenceChecker for DosResourceReferenceChecker {
    fn is_referenced_by_ingress(&self, namespace: &str, name: &str, ingress: &Ingress) -> bool {
        let default_namespace = object_namespace(ingress.metadata.namespace.as_deref());
        ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(self.annotation))
            .is_some_and(|value| {
                annotation_reference_matches(value, namespace, name, default_namespace)
            })
    }

    fn is_referenced_by_virtual_server(
        &self,
        namespace: &str,
        name: &str,
        vs: &VirtualServer,
    ) -> bool {
        let default_namespace = object_namespace(vs.metadata.namespace.as_deref());

        let spec_matches = vs.spec.dos.as_deref().is_some_and(|value| {
            annotation_reference_matches(value, namespace, name, default_namespace)
        });

        spec_matches
            || vs.spec.routes.iter().any(|route| {
                route.dos.as_deref().is_some_and(|value| {
                    annotation_reference_matches(value, namespace, name, default_namespace)
                })
            })
    }

    fn is_referenced_by_virtual_server_route(
        &self,
        namespace: &str,
        name: &str,
        vsr: &VirtualServerRoute,
    ) -> bool {
        let default_namespace = object_namespace(vsr.metadata.namespace.as_deref());
        vsr.spec.subroutes.iter().any(|route| {
            route.dos.as_deref().is_some_and(|value| {
                annotation_reference_matches(value, namespace, name, default_namespace)
            })
        })
    }
}

/// Matches Ingress resources in a namespace that opted into rate-limit
/// scaling. The queried name is irrelevant: scaling follows the replica
/// count of the whole namespace's workloads.
pub(super) struct RatelimitScalingAnnotationChecker;

impl ReferenceChecker for RatelimitScalingAnnotationChecker {
    fn is_referenced_by_ingress(&self, namespace: &str, _name: &str, ingress: &Ingress) -> bool {
        object_namespace(ingress.metadata.namespace.as_deref()) == namespace
            && ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(RATE_LIMIT_SCALING_ANNOTATION))
                .is_some_and(|value| value == "true")
    }

    fn is_referenced_by_minion(&self, namespace: &str, name: &str, ingress: &Ingress) -> bool {
        self.is_referenced_by_ingress(namespace, name, ingress)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use gatehouse_api::constants::APP_PROTECT_POLICY_ANNOTATION;
    use gatehouse_api::v1::{Tls, Upstream, VirtualServerSpec};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress_with_backend(service: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("ing".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some("cafe.example.com".to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/tea".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: service.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(80),
                                        name: None,
                                    }),
                                }),
                                resource: None,
                            },
                        }],
                    }),
                }]),
                ..IngressSpec::default()
            }),
            status: None,
        }
    }

    fn virtual_server(namespace: &str, upstream_service: &str) -> VirtualServer {
        VirtualServer {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some("vs".to_string()),
                ..ObjectMeta::default()
            },
            spec: VirtualServerSpec {
                host: "cafe.example.com".to_string(),
                upstreams: vec![Upstream {
                    name: "upstream".to_string(),
                    service: upstream_service.to_string(),
                    port: 80,
                    use_cluster_ip: false,
                }],
                ..VirtualServerSpec::default()
            },
            ..VirtualServer::default()
        }
    }

    #[test]
    fn test_service_checker_matches_ingress_backends() {
        let checker = ServiceReferenceChecker::new(false);
        let ingress = ingress_with_backend("tea-svc");

        assert!(checker.is_referenced_by_ingress("default", "tea-svc", &ingress));
        assert!(!checker.is_referenced_by_ingress("default", "coffee-svc", &ingress));
        assert!(!checker.is_referenced_by_ingress("other", "tea-svc", &ingress));
    }

    #[test]
    fn test_service_checker_matches_virtual_server_upstreams() {
        let checker = ServiceReferenceChecker::new(false);
        let vs = virtual_server("default", "tea-svc");

        assert!(checker.is_referenced_by_virtual_server("default", "tea-svc", &vs));
        assert!(!checker.is_referenced_by_virtual_server("other", "tea-svc", &vs));
    }

    #[test]
    fn test_endpoints_checker_skips_cluster_ip_upstreams() {
        let checker = ServiceReferenceChecker::new(true);
        let mut vs = virtual_server("default", "tea-svc");
        vs.spec.upstreams[0].use_cluster_ip = true;

        assert!(!checker.is_referenced_by_virtual_server("default", "tea-svc", &vs));
        assert!(ServiceReferenceChecker::new(false)
            .is_referenced_by_virtual_server("default", "tea-svc", &vs));
    }

    #[test]
    fn test_secret_checker_matches_tls_secrets() {
        let checker = SecretReferenceChecker::new(false);

        let mut ingress = ingress_with_backend("tea-svc");
        ingress.spec.as_mut().unwrap().tls = Some(vec![IngressTLS {
            secret_name: Some("cafe-tls".to_string()),
            hosts: None,
        }]);
        assert!(checker.is_referenced_by_ingress("default", "cafe-tls", &ingress));

        let mut vs = virtual_server("default", "tea-svc");
        vs.spec.tls = Some(Tls {
            secret: Some("cafe-tls".to_string()),
        });
        assert!(checker.is_referenced_by_virtual_server("default", "cafe-tls", &vs));
        assert!(!checker.is_referenced_by_virtual_server("default", "other-tls", &vs));
    }

    #[test]
    fn test_jwt_secret_annotation_requires_plus() {
        let mut ingress = ingress_with_backend("tea-svc");
        ingress.metadata.annotations =
            Some([(JWT_KEY_ANNOTATION.to_string(), "jwk".to_string())].into());

        assert!(SecretReferenceChecker::new(true).is_referenced_by_ingress(
            "default",
            "jwk",
            &ingress
        ));
        assert!(!SecretReferenceChecker::new(false).is_referenced_by_ingress(
            "default",
            "jwk",
            &ingress
        ));
    }

    #[test]
    fn test_app_protect_checker_resolves_annotation_references() {
        let checker = AppProtectResourceReferenceChecker::new(APP_PROTECT_POLICY_ANNOTATION);

        let mut ingress = ingress_with_backend("tea-svc");
        ingress.metadata.annotations = Some(
            [(
                APP_PROTECT_POLICY_ANNOTATION.to_string(),
                "waf-ns/strict".to_string(),
            )]
            .into(),
        );
        assert!(checker.is_referenced_by_ingress("waf-ns", "strict", &ingress));
        assert!(!checker.is_referenced_by_ingress("default", "strict", &ingress));

        // Unqualified references resolve to the Ingress namespace.
        ingress.metadata.annotations = Some(
            [(
                APP_PROTECT_POLICY_ANNOTATION.to_string(),
                "strict".to_string(),
            )]
            .into(),
        );
        assert!(checker.is_referenced_by_ingress("default", "strict", &ingress));
    }

    #[test]
    fn test_ratelimit_scaling_checker_matches_namespace() {
        let checker = RatelimitScalingAnnotationChecker;

        let mut ingress = ingress_with_backend("tea-svc");
        ingress.metadata.annotations = Some(
            [(
                RATE_LIMIT_SCALING_ANNOTATION.to_string(),
                "true".to_string(),
            )]
            .into(),
        );
        assert!(checker.is_referenced_by_ingress("default", "", &ingress));
        assert!(!checker.is_referenced_by_ingress("other", "", &ingress));

        ingress.metadata.annotations = None;
        assert!(!checker.is_referenced_by_ingress("default", "", &ingress));
    }
}
