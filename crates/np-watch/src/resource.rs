use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy as StableNetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};

/// Network policy as served by `extensions/v1beta1`, for clusters that predate
/// `networking.k8s.io/v1`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, kube::CustomResource)]
#[kube(
    group = "extensions",
    version = "v1beta1",
    kind = "NetworkPolicy",
    root = "LegacyNetworkPolicy",
    plural = "networkpolicies",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct LegacyNetworkPolicySpec {
    #[serde(default)]
    pub pod_selector: LabelSelector,
    pub ingress: Option<Vec<NetworkPolicyIngressRule>>,
    pub egress: Option<Vec<NetworkPolicyEgressRule>>,
    pub policy_types: Option<Vec<String>>,
}

/// A network policy in whichever API shape the cluster is watched with.
#[derive(Clone, Debug, PartialEq)]
pub enum NetworkPolicy {
    Legacy(LegacyNetworkPolicy),
    Stable(StableNetworkPolicy),
}

impl NetworkPolicy {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            NetworkPolicy::Legacy(np) => &np.metadata,
            NetworkPolicy::Stable(np) => &np.metadata,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, NetworkPolicy::Legacy(_))
    }
}

impl From<LegacyNetworkPolicy> for NetworkPolicy {
    fn from(np: LegacyNetworkPolicy) -> Self {
        NetworkPolicy::Legacy(np)
    }
}

impl From<StableNetworkPolicy> for NetworkPolicy {
    fn from(np: StableNetworkPolicy) -> Self {
        NetworkPolicy::Stable(np)
    }
}

/// Cache key of a watched object: `namespace/name`, or `name` for
/// cluster-scoped objects.
pub trait ObjectKey {
    fn key(&self) -> String;
}

pub fn object_key(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

impl ObjectKey for Namespace {
    fn key(&self) -> String {
        object_key(&self.metadata)
    }
}

impl ObjectKey for Pod {
    fn key(&self) -> String {
        object_key(&self.metadata)
    }
}

impl ObjectKey for NetworkPolicy {
    fn key(&self) -> String {
        object_key(self.metadata())
    }
}
