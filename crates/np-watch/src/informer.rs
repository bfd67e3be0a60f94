use crate::change::{Change, Deleted};
use crate::resource::ObjectKey;
use kube::runtime::watcher::Event;
use std::collections::{HashMap, HashSet};

/// Turns raw watcher events into typed changes.
///
/// The watcher reports current state only. Telling an add from an update, and
/// noticing deletions missed while disconnected, needs the last state seen for
/// every object, which this cache keeps.
#[derive(Debug)]
pub struct Informer<K> {
    store: HashMap<String, K>,
    relist: Option<HashSet<String>>,
}

impl<K> Default for Informer<K> {
    fn default() -> Self {
        Self {
            store: HashMap::new(),
            relist: None,
        }
    }
}

impl<K: ObjectKey + Clone> Informer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&K> {
        self.store.get(key)
    }

    pub fn apply(&mut self, event: Event<K>) -> Vec<Change<K>> {
        match event {
            Event::Apply(obj) => vec![self.upsert(obj)],
            Event::Delete(obj) => {
                self.store.remove(&obj.key());
                vec![Change::Deleted(Deleted::Live(obj))]
            }
            Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(obj.key());
                }
                vec![self.upsert(obj)]
            }
            Event::InitDone => self.finish_relist(),
        }
    }

    fn upsert(&mut self, obj: K) -> Change<K> {
        match self.store.insert(obj.key(), obj.clone()) {
            Some(old) => Change::Updated { old, new: obj },
            None => Change::Added(obj),
        }
    }

    fn finish_relist(&mut self) -> Vec<Change<K>> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };

        let mut gone: Vec<String> = self
            .store
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        gone.sort();

        gone.into_iter()
            .filter_map(|key| {
                let last_known = self.store.remove(&key)?;
                Some(Change::Deleted(Deleted::FinalStateUnknown { key, last_known }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, ip: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(ip.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn apply_of_cached_key_is_an_update() {
        let mut informer = Informer::new();

        let changes = informer.apply(Event::Apply(pod("web", "10.32.0.4")));
        assert_eq!(changes, vec![Change::Added(pod("web", "10.32.0.4"))]);

        let changes = informer.apply(Event::Apply(pod("web", "10.32.0.5")));
        assert_eq!(
            changes,
            vec![Change::Updated {
                old: pod("web", "10.32.0.4"),
                new: pod("web", "10.32.0.5"),
            }]
        );
        assert_eq!(informer.len(), 1);
    }

    #[test]
    fn delete_removes_from_cache() {
        let mut informer = Informer::new();
        informer.apply(Event::Apply(pod("web", "10.32.0.4")));

        let changes = informer.apply(Event::Delete(pod("web", "10.32.0.4")));

        assert_eq!(
            changes,
            vec![Change::Deleted(Deleted::Live(pod("web", "10.32.0.4")))]
        );
        assert!(informer.is_empty());
    }

    #[test]
    fn relist_missing_object_yields_tombstone() {
        let mut informer = Informer::new();
        informer.apply(Event::Init);
        informer.apply(Event::InitApply(pod("web", "10.32.0.4")));
        informer.apply(Event::InitApply(pod("db", "10.32.0.6")));
        assert!(informer.apply(Event::InitDone).is_empty());

        // Watch reconnects; db was deleted in the meantime.
        informer.apply(Event::Init);
        let changes = informer.apply(Event::InitApply(pod("web", "10.32.0.4")));
        assert!(matches!(changes[..], [Change::Updated { .. }]));
        let changes = informer.apply(Event::InitDone);

        assert_eq!(
            changes,
            vec![Change::Deleted(Deleted::FinalStateUnknown {
                key: "default/db".to_string(),
                last_known: pod("db", "10.32.0.6"),
            })]
        );
        assert!(informer.get("default/db").is_none());
        assert!(informer.get("default/web").is_some());
    }

    #[test]
    fn init_done_without_init_is_ignored() {
        let mut informer = Informer::new();
        informer.apply(Event::Apply(pod("web", "10.32.0.4")));

        assert!(informer.apply(Event::InitDone).is_empty());
        assert_eq!(informer.len(), 1);
    }
}
