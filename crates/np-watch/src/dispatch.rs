use crate::change::Change;
use crate::engine::PolicyEngine;
use crate::error::{Error, Result};
use crate::resource::{NetworkPolicy, ObjectKey};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use np_metrics::MetricsCollector;
use std::sync::Arc;
use tracing::debug;

/// Routes each change to exactly one policy engine method.
#[async_trait]
pub trait Dispatch<K>: Send + Sync {
    async fn dispatch(&self, change: Change<K>) -> Result<()>;
}

#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn PolicyEngine>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            engine,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record<K: ObjectKey>(
        &self,
        resource: &'static str,
        change: &Change<K>,
    ) -> (&'static str, String) {
        let kind = change.kind();
        let key = change.key();
        if let Change::Deleted(deleted) = change {
            debug!(resource, %key, tombstone = deleted.is_tombstone(), "Dispatching delete");
        } else {
            debug!(resource, change = kind, %key, "Dispatching");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_event(resource, kind);
        }
        (kind, key)
    }
}

fn engine_error(
    resource: &'static str,
    change: &'static str,
    key: String,
) -> impl FnOnce(anyhow::Error) -> Error {
    move |e| Error::Engine {
        resource,
        change,
        key,
        source: e.into(),
    }
}

#[async_trait]
impl Dispatch<Namespace> for Dispatcher {
    async fn dispatch(&self, change: Change<Namespace>) -> Result<()> {
        let (kind, key) = self.record("namespace", &change);
        let result = match change {
            Change::Added(ns) => self.engine.add_namespace(ns).await,
            Change::Updated { old, new } => self.engine.update_namespace(old, new).await,
            Change::Deleted(deleted) => {
                self.engine
                    .delete_namespace(deleted.into_last_known())
                    .await
            }
        };
        result.map_err(engine_error("namespace", kind, key))
    }
}

#[async_trait]
impl Dispatch<Pod> for Dispatcher {
    async fn dispatch(&self, change: Change<Pod>) -> Result<()> {
        let (kind, key) = self.record("pod", &change);
        let result = match change {
            Change::Added(pod) => self.engine.add_pod(pod).await,
            Change::Updated { old, new } => self.engine.update_pod(old, new).await,
            Change::Deleted(deleted) => self.engine.delete_pod(deleted.into_last_known()).await,
        };
        result.map_err(engine_error("pod", kind, key))
    }
}

#[async_trait]
impl Dispatch<NetworkPolicy> for Dispatcher {
    async fn dispatch(&self, change: Change<NetworkPolicy>) -> Result<()> {
        let (kind, key) = self.record("networkpolicy", &change);
        let result = match change {
            Change::Added(np) => self.engine.add_network_policy(np).await,
            Change::Updated { old, new } => self.engine.update_network_policy(old, new).await,
            Change::Deleted(deleted) => {
                self.engine
                    .delete_network_policy(deleted.into_last_known())
                    .await
            }
        };
        result.map_err(engine_error("networkpolicy", kind, key))
    }
}
