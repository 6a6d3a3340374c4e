//! Semantic validators for the gatehouse custom resources.
//!
//! Structural validation (required fields, value shapes) is enforced by the
//! CRD schemas at admission time; these validators cover the cross-field
//! rules the schemas cannot express. The reconciliation core invokes them on
//! every add/update and evicts resources that fail.

use std::collections::HashSet;

use thiserror::Error;

use crate::constants::TLS_PASSTHROUGH_LISTENER_NAME;
use crate::v1::{
    GlobalConfiguration, ListenerProtocol, Route, TransportServer, Upstream, VirtualServer,
    VirtualServerRoute,
};

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum VirtualServerValidationError {
    #[error("spec.host is required")]
    MissingHost,
    #[error("spec.host {0} is not a valid hostname")]
    InvalidHost(String),
    #[error("upstream {0} is declared more than once")]
    DuplicateUpstream(String),
    #[error("upstream {0} has no service")]
    UpstreamWithoutService(String),
    #[error("upstream {0} has an invalid port")]
    InvalidUpstreamPort(String),
    #[error("route path {0} must start with /")]
    InvalidRoutePath(String),
    #[error("route {0} must specify either an action or a route reference")]
    RouteWithoutTarget(String),
    #[error("route {0} specifies both an action and a route reference")]
    AmbiguousRouteTarget(String),
    #[error("route {path} passes to upstream {upstream} which is not declared")]
    UnknownUpstream { path: String, upstream: String },
    #[error("server-snippets are not allowed unless snippets are enabled")]
    SnippetsNotAllowed,
    #[error("internal routes are not allowed unless internal routes are enabled")]
    InternalRoutesNotAllowed,
    #[error("spec.host {actual} does not match the VirtualServer host {expected}")]
    HostMismatch { actual: String, expected: String },
    #[error("subroute path {subroute} is outside the delegated path {path}")]
    SubrouteOutsideDelegatedPath { subroute: String, path: String },
}

/// Validates VirtualServer and VirtualServerRoute resources.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualServerValidator {
    snippets_enabled: bool,
    internal_routes_enabled: bool,
}

impl VirtualServerValidator {
    pub fn new(snippets_enabled: bool, internal_routes_enabled: bool) -> Self {
        Self {
            snippets_enabled,
            internal_routes_enabled,
        }
    }

    pub fn validate_virtual_server(
        &self,
        vs: &VirtualServer,
    ) -> Result<(), VirtualServerValidationError> {
        validate_host(&vs.spec.host)?;

        if vs.spec.server_snippets.is_some() && !self.snippets_enabled {
            return Err(VirtualServerValidationError::SnippetsNotAllowed);
        }

        if vs.spec.internal_route && !self.internal_routes_enabled {
            return Err(VirtualServerValidationError::InternalRoutesNotAllowed);
        }

        let upstreams = validate_upstreams(&vs.spec.upstreams)?;
        validate_routes(&vs.spec.routes, &upstreams, true)
    }

    pub fn validate_virtual_server_route(
        &self,
        vsr: &VirtualServerRoute,
    ) -> Result<(), VirtualServerValidationError> {
        validate_host(&vsr.spec.host)?;

        let upstreams = validate_upstreams(&vsr.spec.upstreams)?;
        validate_routes(&vsr.spec.subroutes, &upstreams, false)
    }

    /// Validates a VirtualServerRoute against the VirtualServer that
    /// delegates to it: the hosts must agree and every subroute must stay
    /// under the delegated path.
    pub fn validate_virtual_server_route_for_virtual_server(
        &self,
        vsr: &VirtualServerRoute,
        virtual_server_host: &str,
        path: &str,
    ) -> Result<(), VirtualServerValidationError> {
        if vsr.spec.host != virtual_server_host {
            return Err(VirtualServerValidationError::HostMismatch {
                actual: vsr.spec.host.clone(),
                expected: virtual_server_host.to_string(),
            });
        }

        for subroute in &vsr.spec.subroutes {
            if !subroute.path.starts_with(path) {
                return Err(VirtualServerValidationError::SubrouteOutsideDelegatedPath {
                    subroute: subroute.path.clone(),
                    path: path.to_string(),
                });
            }
        }

        Ok(())
    }
}

fn validate_upstreams(
    upstreams: &[Upstream],
) -> Result<HashSet<&str>, VirtualServerValidationError> {
    let mut names = HashSet::new();

    for upstream in upstreams {
        if !names.insert(upstream.name.as_str()) {
            return Err(VirtualServerValidationError::DuplicateUpstream(
                upstream.name.clone(),
            ));
        }
        if upstream.service.is_empty() {
            return Err(VirtualServerValidationError::UpstreamWithoutService(
                upstream.name.clone(),
            ));
        }
        if upstream.port == 0 {
            return Err(VirtualServerValidationError::InvalidUpstreamPort(
                upstream.name.clone(),
            ));
        }
    }

    Ok(names)
}

fn validate_routes(
    routes: &[Route],
    upstreams: &HashSet<&str>,
    delegation_allowed: bool,
) -> Result<(), VirtualServerValidationError> {
    for route in routes {
        if !route.path.starts_with('/') {
            return Err(VirtualServerValidationError::InvalidRoutePath(
                route.path.clone(),
            ));
        }

        let has_reference = delegation_allowed && route.route.is_some();
        match (&route.action, has_reference) {
            (Some(_), true) => {
                return Err(VirtualServerValidationError::AmbiguousRouteTarget(
                    route.path.clone(),
                ));
            }
            (None, false) => {
                return Err(VirtualServerValidationError::RouteWithoutTarget(
                    route.path.clone(),
                ));
            }
            _ => {}
        }

        if let Some(pass) = route.action.as_ref().and_then(|a| a.pass.as_deref()) {
            if !upstreams.contains(pass) {
                return Err(VirtualServerValidationError::UnknownUpstream {
                    path: route.path.clone(),
                    upstream: pass.to_string(),
                });
            }
        }
    }

    Ok(())
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum TransportServerValidationError {
    #[error("spec.listener.name is required")]
    MissingListenerName,
    #[error("listener {0} requires the TLS_PASSTHROUGH protocol")]
    PassthroughListenerRequiresPassthroughProtocol(String),
    #[error("the TLS_PASSTHROUGH protocol requires the listener name {TLS_PASSTHROUGH_LISTENER_NAME}")]
    PassthroughProtocolRequiresPassthroughListener,
    #[error("TLS passthrough is not enabled")]
    TlsPassthroughNotEnabled,
    #[error("spec.host is required for TLS passthrough")]
    MissingHost,
    #[error("spec.host {0} is not a valid hostname")]
    InvalidHost(String),
    #[error("listener protocol HTTP is not allowed for a TransportServer")]
    HttpListenerNotAllowed,
    #[error("upstream {0} is declared more than once")]
    DuplicateUpstream(String),
    #[error("upstream {0} has no service")]
    UpstreamWithoutService(String),
    #[error("upstream {0} has an invalid port")]
    InvalidUpstreamPort(String),
    #[error("action passes to upstream {0} which is not declared")]
    UnknownUpstream(String),
    #[error("server-snippets are not allowed unless snippets are enabled")]
    SnippetsNotAllowed,
}

/// Validates TransportServer resources.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportServerValidator {
    tls_passthrough_enabled: bool,
    snippets_enabled: bool,
}

impl TransportServerValidator {
    pub fn new(tls_passthrough_enabled: bool, snippets_enabled: bool) -> Self {
        Self {
            tls_passthrough_enabled,
            snippets_enabled,
        }
    }

    pub fn validate_transport_server(
        &self,
        ts: &TransportServer,
    ) -> Result<(), TransportServerValidationError> {
        let listener = &ts.spec.listener;

        if listener.name.is_empty() {
            return Err(TransportServerValidationError::MissingListenerName);
        }

        match listener.protocol {
            ListenerProtocol::TlsPassthrough => {
                if listener.name != TLS_PASSTHROUGH_LISTENER_NAME {
                    return Err(
                        TransportServerValidationError::PassthroughProtocolRequiresPassthroughListener,
                    );
                }
                if !self.tls_passthrough_enabled {
                    return Err(TransportServerValidationError::TlsPassthroughNotEnabled);
                }
                if ts.spec.host.is_empty() {
                    return Err(TransportServerValidationError::MissingHost);
                }
            }
            ListenerProtocol::Http => {
                return Err(TransportServerValidationError::HttpListenerNotAllowed);
            }
            ListenerProtocol::Tcp | ListenerProtocol::Udp => {
                if listener.name == TLS_PASSTHROUGH_LISTENER_NAME {
                    return Err(
                        TransportServerValidationError::PassthroughListenerRequiresPassthroughProtocol(
                            listener.name.clone(),
                        ),
                    );
                }
            }
        }

        if !ts.spec.host.is_empty() && !is_valid_hostname(&ts.spec.host) {
            return Err(TransportServerValidationError::InvalidHost(
                ts.spec.host.clone(),
            ));
        }

        if ts.spec.server_snippets.is_some() && !self.snippets_enabled {
            return Err(TransportServerValidationError::SnippetsNotAllowed);
        }

        let mut names = HashSet::new();
        for upstream in &ts.spec.upstreams {
            if !names.insert(upstream.name.as_str()) {
                return Err(TransportServerValidationError::DuplicateUpstream(
                    upstream.name.clone(),
                ));
            }
            if upstream.service.is_empty() {
                return Err(TransportServerValidationError::UpstreamWithoutService(
                    upstream.name.clone(),
                ));
            }
            if upstream.port == 0 {
                return Err(TransportServerValidationError::InvalidUpstreamPort(
                    upstream.name.clone(),
                ));
            }
        }

        if let Some(pass) = ts.spec.action.as_ref().and_then(|a| a.pass.as_deref()) {
            if !names.contains(pass) {
                return Err(TransportServerValidationError::UnknownUpstream(
                    pass.to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum GlobalConfigurationValidationError {
    #[error("listener name {0} is reserved")]
    ReservedListenerName(String),
    #[error("listener {0} has an invalid name")]
    InvalidListenerName(String),
    #[error("listener {0} is declared more than once")]
    DuplicateListenerName(String),
    #[error("port {port} is declared more than once for protocol {protocol}")]
    DuplicatePortProtocol {
        port: u16,
        protocol: ListenerProtocol,
    },
    #[error("listener {0} has an invalid port")]
    InvalidListenerPort(String),
    #[error("listener {0} has a forbidden port")]
    ForbiddenListenerPort(String),
    #[error("listener {0} declares the TLS_PASSTHROUGH protocol")]
    PassthroughProtocolNotAllowed(String),
    #[error("listener {0}: ipv4 is not an IPv4 address")]
    NotAnIpv4Address(String),
    #[error("listener {0}: ipv6 is not an IPv6 address")]
    NotAnIpv6Address(String),
}

/// Validates the GlobalConfiguration resource.
#[derive(Clone, Debug, Default)]
pub struct GlobalConfigurationValidator {
    forbidden_ports: Vec<u16>,
}

impl GlobalConfigurationValidator {
    pub fn new(forbidden_ports: Vec<u16>) -> Self {
        Self { forbidden_ports }
    }

    pub fn validate_global_configuration(
        &self,
        gc: &GlobalConfiguration,
    ) -> Result<(), GlobalConfigurationValidationError> {
        let mut names = HashSet::new();
        let mut port_protocols = HashSet::new();

        for listener in &gc.spec.listeners {
            if listener.name == TLS_PASSTHROUGH_LISTENER_NAME {
                return Err(GlobalConfigurationValidationError::ReservedListenerName(
                    listener.name.clone(),
                ));
            }
            if !is_valid_listener_name(&listener.name) {
                return Err(GlobalConfigurationValidationError::InvalidListenerName(
                    listener.name.clone(),
                ));
            }
            if !names.insert(listener.name.as_str()) {
                return Err(GlobalConfigurationValidationError::DuplicateListenerName(
                    listener.name.clone(),
                ));
            }

            if listener.protocol == ListenerProtocol::TlsPassthrough {
                return Err(
                    GlobalConfigurationValidationError::PassthroughProtocolNotAllowed(
                        listener.name.clone(),
                    ),
                );
            }

            if listener.port == 0 {
                return Err(GlobalConfigurationValidationError::InvalidListenerPort(
                    listener.name.clone(),
                ));
            }
            if self.forbidden_ports.contains(&listener.port) {
                return Err(GlobalConfigurationValidationError::ForbiddenListenerPort(
                    listener.name.clone(),
                ));
            }
            if !port_protocols.insert((listener.port, listener.protocol)) {
                return Err(GlobalConfigurationValidationError::DuplicatePortProtocol {
                    port: listener.port,
                    protocol: listener.protocol,
                });
            }

            if listener.ipv4.is_some_and(|ip| !ip.is_ipv4()) {
                return Err(GlobalConfigurationValidationError::NotAnIpv4Address(
                    listener.name.clone(),
                ));
            }
            if listener.ipv6.is_some_and(|ip| !ip.is_ipv6()) {
                return Err(GlobalConfigurationValidationError::NotAnIpv6Address(
                    listener.name.clone(),
                ));
            }
        }

        Ok(())
    }
}

fn validate_host(host: &str) -> Result<(), VirtualServerValidationError> {
    if host.is_empty() {
        return Err(VirtualServerValidationError::MissingHost);
    }
    if !is_valid_hostname(host) {
        return Err(VirtualServerValidationError::InvalidHost(host.to_string()));
    }
    Ok(())
}

/// RFC 1123 subdomain check, the shape Kubernetes expects for rule hosts.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }
    host.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

fn is_valid_listener_name(name: &str) -> bool {
    is_valid_label(name) && name.as_bytes().first().is_some_and(u8::is_ascii_lowercase)
}
