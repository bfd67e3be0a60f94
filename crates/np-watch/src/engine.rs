use crate::resource::NetworkPolicy;
use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};

/// Consumer of resource changes.
///
/// Called concurrently from the namespace, pod and network policy watches;
/// implementations serialize access to their own state. An error is fatal to
/// the process.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn add_namespace(&self, ns: Namespace) -> Result<()>;
    async fn update_namespace(&self, old: Namespace, new: Namespace) -> Result<()>;
    async fn delete_namespace(&self, ns: Namespace) -> Result<()>;

    async fn add_pod(&self, pod: Pod) -> Result<()>;
    async fn update_pod(&self, old: Pod, new: Pod) -> Result<()>;
    async fn delete_pod(&self, pod: Pod) -> Result<()>;

    async fn add_network_policy(&self, np: NetworkPolicy) -> Result<()>;
    async fn update_network_policy(&self, old: NetworkPolicy, new: NetworkPolicy) -> Result<()>;
    async fn delete_network_policy(&self, np: NetworkPolicy) -> Result<()>;
}
