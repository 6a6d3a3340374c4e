//! Classification and validation of Ingress resources.
//!
//! An Ingress is a *master* when it declares a single host and delegates all
//! paths to minions; a *minion* contributes paths to its master's host. Both
//! roles are declared through the mergeable-ingress-type annotation.

use gatehouse_api::constants::{
    APP_PROTECT_DOS_PROTECTED_ANNOTATION, APP_PROTECT_LOG_CONF_ANNOTATION,
    APP_PROTECT_POLICY_ANNOTATION, HTTP01_SOLVER_LABEL, HTTP01_SOLVER_LABEL_VALUE,
    LOCATION_SNIPPETS_ANNOTATION, MERGEABLE_INGRESS_TYPE_ANNOTATION,
    MERGEABLE_INGRESS_TYPE_MASTER, MERGEABLE_INGRESS_TYPE_MINION, SERVER_SNIPPETS_ANNOTATION,
};
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressRule};
use thiserror::Error;

use super::Settings;

pub(super) fn ingress_rules(ingress: &Ingress) -> &[IngressRule] {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or_default()
}

pub(super) fn rule_host(rule: &IngressRule) -> &str {
    rule.host.as_deref().unwrap_or_default()
}

pub(super) fn rule_paths(rule: &IngressRule) -> &[HTTPIngressPath] {
    rule.http.as_ref().map(|http| &*http.paths).unwrap_or_default()
}

/// The host of the single rule a master or minion Ingress declares.
pub(super) fn first_rule_host(ingress: &Ingress) -> Option<&str> {
    ingress_rules(ingress).first().map(rule_host)
}

fn mergeable_ingress_type(ingress: &Ingress) -> Option<&str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(MERGEABLE_INGRESS_TYPE_ANNOTATION))
        .map(String::as_str)
}

pub(super) fn is_master(ingress: &Ingress) -> bool {
    mergeable_ingress_type(ingress) == Some(MERGEABLE_INGRESS_TYPE_MASTER)
}

pub(super) fn is_minion(ingress: &Ingress) -> bool {
    mergeable_ingress_type(ingress) == Some(MERGEABLE_INGRESS_TYPE_MINION)
}

/// Tells if the Ingress is an ephemeral ACME HTTP-01 solver created by
/// cert-manager. Only honoured when the cert-manager integration is enabled.
pub(super) fn is_challenge_ingress(ingress: &Ingress, cert_manager_enabled: bool) -> bool {
    if !cert_manager_enabled {
        return false;
    }

    ingress
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(HTTP01_SOLVER_LABEL))
        .is_some_and(|value| value == HTTP01_SOLVER_LABEL_VALUE)
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum IngressValidationError {
    #[error("a master must have exactly one rule with a host")]
    MasterWithoutSingleHostRule,
    #[error("a master must not have paths")]
    MasterWithPaths,
    #[error("a minion must have exactly one rule with a host")]
    MinionWithoutSingleHostRule,
    #[error("a minion must have paths")]
    MinionWithoutPaths,
    #[error("a minion must not have TLS termination")]
    MinionWithTls,
    #[error("annotation {0} requires snippets to be enabled")]
    SnippetsNotAllowed(&'static str),
    #[error("annotation {0} requires App Protect to be enabled")]
    AppProtectNotAllowed(&'static str),
    #[error("annotation {0} requires App Protect DOS to be enabled")]
    AppProtectDosNotAllowed(&'static str),
}

pub(super) fn validate_ingress(
    ingress: &Ingress,
    settings: &Settings,
) -> Result<(), IngressValidationError> {
    let annotations = ingress.metadata.annotations.as_ref();
    let has_annotation =
        |key: &str| annotations.is_some_and(|annotations| annotations.contains_key(key));

    if !settings.snippets_enabled() {
        for annotation in [SERVER_SNIPPETS_ANNOTATION, LOCATION_SNIPPETS_ANNOTATION] {
            if has_annotation(annotation) {
                return Err(IngressValidationError::SnippetsNotAllowed(annotation));
            }
        }
    }

    if !settings.app_protect_enabled() {
        for annotation in [APP_PROTECT_POLICY_ANNOTATION, APP_PROTECT_LOG_CONF_ANNOTATION] {
            if has_annotation(annotation) {
                return Err(IngressValidationError::AppProtectNotAllowed(annotation));
            }
        }
    }

    if !settings.app_protect_dos_enabled() && has_annotation(APP_PROTECT_DOS_PROTECTED_ANNOTATION)
    {
        return Err(IngressValidationError::AppProtectDosNotAllowed(
            APP_PROTECT_DOS_PROTECTED_ANNOTATION,
        ));
    }

    let rules = ingress_rules(ingress);

    if is_master(ingress) {
        let [rule] = rules else {
            return Err(IngressValidationError::MasterWithoutSingleHostRule);
        };
        if rule_host(rule).is_empty() {
            return Err(IngressValidationError::MasterWithoutSingleHostRule);
        }
        if !rule_paths(rule).is_empty() {
            return Err(IngressValidationError::MasterWithPaths);
        }
    } else if is_minion(ingress) {
        let [rule] = rules else {
            return Err(IngressValidationError::MinionWithoutSingleHostRule);
        };
        if rule_host(rule).is_empty() {
            return Err(IngressValidationError::MinionWithoutSingleHostRule);
        }
        if rule_paths(rule).is_empty() {
            return Err(IngressValidationError::MinionWithoutPaths);
        }
        if ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.tls.as_ref())
            .is_some_and(|tls| !tls.is_empty())
        {
            return Err(IngressValidationError::MinionWithTls);
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressRuleValue, IngressBackend, IngressServiceBackend, IngressSpec, IngressTLS,
        ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn path(p: &str) -> HTTPIngressPath {
        HTTPIngressPath {
            path: Some(p.to_string()),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: "svc".to_string(),
                    port: Some(ServiceBackendPort {
                        number: Some(80),
                        name: None,
                    }),
                }),
                resource: None,
            },
        }
    }

    fn ingress(
        ingress_type: Option<&str>,
        hosts_with_paths: &[(&str, &[&str])],
    ) -> Ingress {
        let annotations = ingress_type.map(|t| {
            [(
                MERGEABLE_INGRESS_TYPE_ANNOTATION.to_string(),
                t.to_string(),
            )]
            .into()
        });

        Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("ing".to_string()),
                annotations,
                ..ObjectMeta::default()
            },
            spec: Some(IngressSpec {
                rules: Some(
                    hosts_with_paths
                        .iter()
                        .map(|(host, paths)| IngressRule {
                            host: Some((*host).to_string()),
                            http: if paths.is_empty() {
                                None
                            } else {
                                Some(HTTPIngressRuleValue {
                                    paths: paths.iter().map(|p| path(p)).collect(),
                                })
                            },
                        })
                        .collect(),
                ),
                ..IngressSpec::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_mergeable_ingress_classification() {
        let regular = ingress(None, &[("cafe.example.com", &["/tea"])]);
        assert!(!is_master(&regular));
        assert!(!is_minion(&regular));

        let master = ingress(Some("master"), &[("cafe.example.com", &[])]);
        assert!(is_master(&master));
        assert!(!is_minion(&master));

        let minion = ingress(Some("minion"), &[("cafe.example.com", &["/tea"])]);
        assert!(is_minion(&minion));
        assert!(!is_master(&minion));
    }

    #[test]
    fn test_challenge_ingress_detection() {
        let mut solver = ingress(None, &[("cafe.example.com", &["/.well-known"])]);
        solver.metadata.labels = Some(
            [(
                HTTP01_SOLVER_LABEL.to_string(),
                HTTP01_SOLVER_LABEL_VALUE.to_string(),
            )]
            .into(),
        );

        assert!(is_challenge_ingress(&solver, true));
        assert!(!is_challenge_ingress(&solver, false));

        let plain = ingress(None, &[("cafe.example.com", &["/tea"])]);
        assert!(!is_challenge_ingress(&plain, true));
    }

    #[test]
    fn test_validate_master_shape() {
        let settings = Settings::default();

        validate_ingress(&ingress(Some("master"), &[("cafe.example.com", &[])]), &settings)
            .unwrap();

        assert_eq!(
            validate_ingress(
                &ingress(Some("master"), &[("cafe.example.com", &["/tea"])]),
                &settings,
            )
            .unwrap_err(),
            IngressValidationError::MasterWithPaths
        );

        assert_eq!(
            validate_ingress(
                &ingress(Some("master"), &[("a.example.com", &[]), ("b.example.com", &[])]),
                &settings,
            )
            .unwrap_err(),
            IngressValidationError::MasterWithoutSingleHostRule
        );
    }

    #[test]
    fn test_validate_minion_shape() {
        let settings = Settings::default();

        validate_ingress(
            &ingress(Some("minion"), &[("cafe.example.com", &["/tea"])]),
            &settings,
        )
        .unwrap();

        assert_eq!(
            validate_ingress(
                &ingress(Some("minion"), &[("cafe.example.com", &[])]),
                &settings,
            )
            .unwrap_err(),
            IngressValidationError::MinionWithoutPaths
        );

        let mut with_tls = ingress(Some("minion"), &[("cafe.example.com", &["/tea"])]);
        with_tls.spec.as_mut().unwrap().tls = Some(vec![IngressTLS::default()]);
        assert_eq!(
            validate_ingress(&with_tls, &settings).unwrap_err(),
            IngressValidationError::MinionWithTls
        );
    }

    #[test]
    fn test_validate_annotation_gating() {
        let mut ing = ingress(None, &[("cafe.example.com", &["/tea"])]);
        ing.metadata.annotations = Some(
            [(
                APP_PROTECT_POLICY_ANNOTATION.to_string(),
                "default/policy".to_string(),
            )]
            .into(),
        );

        assert_eq!(
            validate_ingress(&ing, &Settings::default()).unwrap_err(),
            IngressValidationError::AppProtectNotAllowed(APP_PROTECT_POLICY_ANNOTATION)
        );

        let settings = Settings::new_builder()
            .app_protect_enabled(true)
            .build()
            .unwrap();
        validate_ingress(&ing, &settings).unwrap();
    }
}
