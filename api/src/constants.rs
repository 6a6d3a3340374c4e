pub const GROUP: &str = "gatehouse.dev";

pub const VIRTUAL_SERVER_CRD_KIND: &str = "VirtualServer";
pub const VIRTUAL_SERVER_ROUTE_CRD_KIND: &str = "VirtualServerRoute";
pub const TRANSPORT_SERVER_CRD_KIND: &str = "TransportServer";
pub const GLOBAL_CONFIGURATION_CRD_KIND: &str = "GlobalConfiguration";

/// Reserved listener name that binds a TransportServer to the TLS
/// passthrough proxy instead of a GlobalConfiguration listener.
pub const TLS_PASSTHROUGH_LISTENER_NAME: &str = "tls-passthrough";

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

pub const MERGEABLE_INGRESS_TYPE_ANNOTATION: &str = "gatehouse.dev/mergeable-ingress-type";
pub const MERGEABLE_INGRESS_TYPE_MASTER: &str = "master";
pub const MERGEABLE_INGRESS_TYPE_MINION: &str = "minion";

pub const SERVER_SNIPPETS_ANNOTATION: &str = "gatehouse.dev/server-snippets";
pub const LOCATION_SNIPPETS_ANNOTATION: &str = "gatehouse.dev/location-snippets";

pub const JWT_KEY_ANNOTATION: &str = "gatehouse.dev/jwt-key";

pub const RATE_LIMIT_SCALING_ANNOTATION: &str = "gatehouse.dev/rate-limit-scaling";

pub const APP_PROTECT_POLICY_ANNOTATION: &str = "appprotect.gatehouse.dev/policy";
pub const APP_PROTECT_LOG_CONF_ANNOTATION: &str = "appprotect.gatehouse.dev/security-log";
pub const APP_PROTECT_DOS_PROTECTED_ANNOTATION: &str = "appprotectdos.gatehouse.dev/protected";

/// Label cert-manager stamps on the ephemeral Ingress resources it creates
/// to answer ACME HTTP-01 challenges.
pub const HTTP01_SOLVER_LABEL: &str = "acme.cert-manager.io/http01-solver";
pub const HTTP01_SOLVER_LABEL_VALUE: &str = "true";
