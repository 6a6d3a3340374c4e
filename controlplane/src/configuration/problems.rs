//! Problem records surfaced to whoever publishes status back to the cluster.

use std::collections::BTreeMap;

use getset::Getters;
use strum::IntoStaticStr;

use crate::objects::{KubeObject, ResourceKey};

/// Why a resource's configuration is in trouble. Matches the event reasons
/// published to the cluster, so the set is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum ProblemReason {
    Rejected,
    NoIngressMasterFound,
    NoVirtualServerFound,
    Ignored,
}

impl std::fmt::Display for ProblemReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: &'static str = self.into();
        f.write_str(s)
    }
}

/// A problem associated with a configuration object.
#[derive(Clone, Debug, Getters)]
pub struct ConfigurationProblem {
    /// The configuration object the problem is about.
    #[getset(get = "pub")]
    object: KubeObject,

    /// If true, the object's status is expected to become `invalid`;
    /// otherwise it becomes `warning`.
    #[getset(get = "pub")]
    is_error: bool,

    #[getset(get = "pub")]
    reason: ProblemReason,

    #[getset(get = "pub")]
    message: String,
}

impl ConfigurationProblem {
    pub(super) fn new<S: Into<String>>(
        object: KubeObject,
        is_error: bool,
        reason: ProblemReason,
        message: S,
    ) -> Self {
        Self {
            object,
            is_error,
            reason,
            message: message.into(),
        }
    }

    /// An error-grade rejection carrying a validator's report.
    pub(super) fn rejected<S: Into<String>>(object: KubeObject, message: S) -> Self {
        Self::new(object, true, ProblemReason::Rejected, message)
    }

    fn same_report(&self, other: &ConfigurationProblem) -> bool {
        self.is_error == other.is_error
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Emits only the problems that are new or whose report changed since the
/// previous reconciliation. Re-emitting an unchanged state yields nothing.
pub(super) fn detect_changes_in_problems(
    new_problems: &BTreeMap<ResourceKey, ConfigurationProblem>,
    old_problems: &BTreeMap<ResourceKey, ConfigurationProblem>,
) -> Vec<ConfigurationProblem> {
    new_problems
        .iter()
        .filter(|(key, new_problem)| {
            old_problems
                .get(*key)
                .is_none_or(|old_problem| !new_problem.same_report(old_problem))
        })
        .map(|(_, problem)| problem.clone())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::objects::{ObjectKey, ResourceKind};
    use k8s_openapi::api::networking::v1::Ingress;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn problem(message: &str) -> ConfigurationProblem {
        let ingress = Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("ing".to_string()),
                ..ObjectMeta::default()
            },
            ..Ingress::default()
        };
        ConfigurationProblem::new(
            KubeObject::Ingress(Arc::new(ingress)),
            false,
            ProblemReason::Rejected,
            message,
        )
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(ResourceKind::Ingress, ObjectKey::new("default", name))
    }

    #[test]
    fn test_unchanged_problems_are_not_re_emitted() {
        let problems: BTreeMap<_, _> = [(key("a"), problem("taken"))].into();

        assert_eq!(detect_changes_in_problems(&problems, &problems).len(), 0);
    }

    #[test]
    fn test_new_and_changed_problems_are_emitted() {
        let old: BTreeMap<_, _> = [(key("a"), problem("taken"))].into();
        let new: BTreeMap<_, _> = [
            (key("a"), problem("still taken, differently")),
            (key("b"), problem("taken")),
        ]
        .into();

        let emitted = detect_changes_in_problems(&new, &old);
        assert_eq!(emitted.len(), 2);
    }

    #[test]
    fn test_problems_emitted_in_key_order() {
        let old = BTreeMap::new();
        let new: BTreeMap<_, _> = [
            (key("b"), problem("b")),
            (key("a"), problem("a")),
        ]
        .into();

        let emitted = detect_changes_in_problems(&new, &old);
        let messages: Vec<&str> = emitted.iter().map(|p| p.message().as_str()).collect();
        assert_eq!(messages, ["a", "b"]);
    }

    #[test]
    fn test_reason_rendering() {
        assert_eq!(ProblemReason::NoIngressMasterFound.to_string(), "NoIngressMasterFound");
        assert_eq!(ProblemReason::Rejected.to_string(), "Rejected");
    }
}
