use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use np_core::SetName;
use np_filter::Backend;
use np_metrics::MetricsCollector;
use np_watch::{NetworkPolicy, ObjectKey, PolicyEngine};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct State {
    backend: Arc<dyn Backend>,
    namespaces: HashMap<String, Namespace>,
    policies: HashMap<String, NetworkPolicy>,
    /// Pod key to pod IP, for pods on this node.
    local_pods: HashMap<String, String>,
    /// Pods per IP. An IP can briefly belong to two pods while one of them
    /// terminates.
    ip_refs: HashMap<String, usize>,
}

impl State {
    /// Point `key` at `ip`, or stop tracking it when `ip` is `None`.
    ///
    /// A new IP is added to the set before the old one is removed, so a pod
    /// changing address is never absent from the set.
    async fn set_local(&mut self, key: &str, ip: Option<String>) -> Result<()> {
        if self.local_pods.get(key) == ip.as_ref() {
            return Ok(());
        }

        let previous = self.local_pods.remove(key);
        if let Some(ip) = ip {
            self.retain_ip(key, &ip).await?;
            debug!(pod = %key, %ip, "Tracking local pod");
            self.local_pods.insert(key.to_string(), ip);
        }
        if let Some(ip) = previous {
            self.release_ip(key, &ip).await?;
            debug!(pod = %key, %ip, "Released local pod IP");
        }
        Ok(())
    }

    async fn retain_ip(&mut self, key: &str, ip: &str) -> Result<()> {
        let refs = self.ip_refs.entry(ip.to_string()).or_default();
        *refs += 1;
        if *refs > 1 {
            return Ok(());
        }

        let set = SetName::local_pods();
        self.backend
            .add_entry(&set, ip)
            .await
            .with_context(|| format!("adding {} ({}) to {}", ip, key, set))
    }

    async fn release_ip(&mut self, key: &str, ip: &str) -> Result<()> {
        let remaining = match self.ip_refs.get_mut(ip) {
            Some(refs) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(());
        }

        self.ip_refs.remove(ip);
        let set = SetName::local_pods();
        self.backend
            .del_entry(&set, ip)
            .await
            .with_context(|| format!("removing {} ({}) from {}", ip, key, set))
    }
}

/// Policy engine for one node.
///
/// Tracks namespaces and network policies, and keeps the local-pods set equal
/// to the IPs of running pods scheduled on this node. All calls go through one
/// lock, so the three watches may call it concurrently.
pub struct NodeEngine {
    node_name: String,
    legacy: bool,
    state: Mutex<State>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl NodeEngine {
    pub fn new(node_name: impl Into<String>, legacy: bool, backend: Arc<dyn Backend>) -> Self {
        Self {
            node_name: node_name.into(),
            legacy,
            state: Mutex::new(State {
                backend,
                namespaces: HashMap::new(),
                policies: HashMap::new(),
                local_pods: HashMap::new(),
                ip_refs: HashMap::new(),
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn local_pod_count(&self) -> usize {
        self.state.lock().await.local_pods.len()
    }

    pub async fn namespace_count(&self) -> usize {
        self.state.lock().await.namespaces.len()
    }

    pub async fn policy_count(&self) -> usize {
        self.state.lock().await.policies.len()
    }

    /// IP of `pod` if it belongs in the local-pods set.
    fn local_ip(&self, pod: &Pod) -> Option<String> {
        let spec = pod.spec.as_ref()?;
        if spec.node_name.as_deref() != Some(self.node_name.as_str()) {
            return None;
        }
        if spec.host_network == Some(true) {
            return None;
        }

        let status = pod.status.as_ref()?;
        if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
            return None;
        }
        status.pod_ip.clone().filter(|ip| !ip.is_empty())
    }

    fn check_shape(&self, np: &NetworkPolicy) -> Result<()> {
        if np.is_legacy() != self.legacy {
            bail!(
                "network policy {} is in the {} API shape but the engine runs in {} mode",
                np.key(),
                if np.is_legacy() { "legacy" } else { "stable" },
                if self.legacy { "legacy" } else { "stable" },
            );
        }
        Ok(())
    }

    fn report(&self, state: &State) {
        if let Some(metrics) = &self.metrics {
            metrics.set_local_pods(state.local_pods.len());
        }
    }
}

#[async_trait]
impl PolicyEngine for NodeEngine {
    async fn add_namespace(&self, ns: Namespace) -> Result<()> {
        let key = ns.key();
        debug!(namespace = %key, "Namespace added");
        self.state.lock().await.namespaces.insert(key, ns);
        Ok(())
    }

    async fn update_namespace(&self, old: Namespace, new: Namespace) -> Result<()> {
        let mut state = self.state.lock().await;
        state.namespaces.remove(&old.key());
        state.namespaces.insert(new.key(), new);
        Ok(())
    }

    async fn delete_namespace(&self, ns: Namespace) -> Result<()> {
        let key = ns.key();
        debug!(namespace = %key, "Namespace deleted");
        self.state.lock().await.namespaces.remove(&key);
        Ok(())
    }

    async fn add_pod(&self, pod: Pod) -> Result<()> {
        let ip = self.local_ip(&pod);
        if ip.is_none() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        state.set_local(&pod.key(), ip).await?;
        self.report(&state);
        Ok(())
    }

    async fn update_pod(&self, old: Pod, new: Pod) -> Result<()> {
        let key = new.key();
        let mut state = self.state.lock().await;
        let old_key = old.key();
        if old_key != key {
            state.set_local(&old_key, None).await?;
        }
        state.set_local(&key, self.local_ip(&new)).await?;
        self.report(&state);
        Ok(())
    }

    async fn delete_pod(&self, pod: Pod) -> Result<()> {
        let mut state = self.state.lock().await;
        state.set_local(&pod.key(), None).await?;
        self.report(&state);
        Ok(())
    }

    async fn add_network_policy(&self, np: NetworkPolicy) -> Result<()> {
        self.check_shape(&np)?;
        let key = np.key();
        info!(policy = %key, "Network policy added");
        self.state.lock().await.policies.insert(key, np);
        Ok(())
    }

    async fn update_network_policy(&self, old: NetworkPolicy, new: NetworkPolicy) -> Result<()> {
        self.check_shape(&new)?;
        let key = new.key();
        debug!(policy = %key, "Network policy updated");
        let mut state = self.state.lock().await;
        state.policies.remove(&old.key());
        state.policies.insert(key, new);
        Ok(())
    }

    async fn delete_network_policy(&self, np: NetworkPolicy) -> Result<()> {
        let key = np.key();
        info!(policy = %key, "Network policy deleted");
        self.state.lock().await.policies.remove(&key);
        Ok(())
    }
}
