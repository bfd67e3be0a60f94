use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::{Error, Result};
use crate::informer::Informer;
use crate::resource::{LegacyNetworkPolicy, NetworkPolicy, ObjectKey};
use futures::future::select_all;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy as StableNetworkPolicy;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub type EventStream<K> = BoxStream<'static, watcher::Result<Event<K>>>;

/// The three cluster-wide watches feeding the policy engine.
pub struct ResourceWatches {
    client: Client,
    legacy: bool,
}

impl ResourceWatches {
    pub fn new(client: Client, legacy: bool) -> Self {
        Self { client, legacy }
    }

    pub fn spawn(self, dispatcher: Dispatcher) -> WatchTasks {
        let dispatcher = Arc::new(dispatcher);

        let namespaces = watch_stream(Api::<Namespace>::all(self.client.clone()));
        let pods = watch_stream(Api::<Pod>::all(self.client.clone()));
        let policy_api = PolicyApi::for_cluster(self.legacy);
        info!(path = %policy_api.url_path(), "Watching network policies");
        let policies = policy_api.stream(self.client);

        WatchTasks {
            tasks: vec![
                (
                    "namespace",
                    tokio::spawn(run_watch("namespace", namespaces, dispatcher.clone())),
                ),
                (
                    "pod",
                    tokio::spawn(run_watch("pod", pods, dispatcher.clone())),
                ),
                (
                    "networkpolicy",
                    tokio::spawn(run_watch("networkpolicy", policies, dispatcher)),
                ),
            ],
        }
    }
}

/// Which API group network policies are watched through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyApi {
    /// `extensions/v1beta1`
    Legacy,
    /// `networking.k8s.io/v1`
    Stable,
}

impl PolicyApi {
    fn for_cluster(legacy: bool) -> Self {
        if legacy {
            PolicyApi::Legacy
        } else {
            PolicyApi::Stable
        }
    }

    /// Cluster-wide list path of the selected resource.
    fn url_path(self) -> String {
        match self {
            PolicyApi::Legacy => LegacyNetworkPolicy::url_path(&(), None),
            PolicyApi::Stable => StableNetworkPolicy::url_path(&(), None),
        }
    }

    fn stream(self, client: Client) -> EventStream<NetworkPolicy> {
        match self {
            PolicyApi::Legacy => watch_stream(Api::<LegacyNetworkPolicy>::all(client))
                .map_ok(|event| map_event(event, NetworkPolicy::Legacy))
                .boxed(),
            PolicyApi::Stable => watch_stream(Api::<StableNetworkPolicy>::all(client))
                .map_ok(|event| map_event(event, NetworkPolicy::Stable))
                .boxed(),
        }
    }
}

fn watch_stream<K>(api: Api<K>) -> EventStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed()
}

fn map_event<A, B>(event: Event<A>, f: impl Fn(A) -> B) -> Event<B> {
    match event {
        Event::Apply(obj) => Event::Apply(f(obj)),
        Event::Delete(obj) => Event::Delete(f(obj)),
        Event::Init => Event::Init,
        Event::InitApply(obj) => Event::InitApply(f(obj)),
        Event::InitDone => Event::InitDone,
    }
}

/// Feed one event stream through an informer into the dispatcher.
///
/// Each change is fully handled before the next event is read. Stream errors
/// are logged and the watcher's backoff decides when to retry. Returns only
/// on an engine error or if the stream ends.
pub async fn run_watch<K, D>(
    resource: &'static str,
    mut events: EventStream<K>,
    dispatcher: Arc<D>,
) -> Result<()>
where
    K: ObjectKey + Clone + Send + 'static,
    D: Dispatch<K> + ?Sized,
{
    info!(resource, "Starting watch");
    let mut informer = Informer::new();

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                for change in informer.apply(event) {
                    dispatcher.dispatch(change).await?;
                }
            }
            Err(error) => warn!(resource, %error, "Watch failed, retrying"),
        }
    }

    Err(Error::WatchEnded { resource })
}

/// Handles of the running watch loops.
pub struct WatchTasks {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl WatchTasks {
    /// Wait for the first loop to stop, abort the others, and report why it
    /// stopped.
    pub async fn wait(self) -> Result<()> {
        let (resources, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let (result, index, rest) = select_all(handles).await;
        for handle in rest {
            handle.abort();
        }

        let resource = resources[index];
        match result {
            Ok(result) => result,
            Err(source) => Err(Error::Task { resource, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Change, Deleted};
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        changes: Mutex<Vec<Change<Pod>>>,
        fail_on_delete: bool,
    }

    #[async_trait]
    impl Dispatch<Pod> for Collect {
        async fn dispatch(&self, change: Change<Pod>) -> Result<()> {
            let is_delete = matches!(change, Change::Deleted(_));
            let key = change.key();
            self.changes.lock().unwrap().push(change);
            if self.fail_on_delete && is_delete {
                return Err(Error::Engine {
                    resource: "pod",
                    change: "delete",
                    key,
                    source: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn stream(events: Vec<Event<Pod>>) -> EventStream<Pod> {
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn relist_tombstone_reaches_dispatcher() {
        let collect = Arc::new(Collect::default());
        let events = stream(vec![
            Event::Init,
            Event::InitApply(pod("web")),
            Event::InitApply(pod("db")),
            Event::InitDone,
            Event::Init,
            Event::InitApply(pod("web")),
            Event::InitDone,
        ]);

        let err = run_watch("pod", events, collect.clone()).await.unwrap_err();
        assert!(matches!(err, Error::WatchEnded { resource: "pod" }));

        let changes = collect.changes.lock().unwrap();
        assert_eq!(changes.len(), 4);
        assert_eq!(
            changes[3],
            Change::Deleted(Deleted::FinalStateUnknown {
                key: "default/db".to_string(),
                last_known: pod("db"),
            })
        );
    }

    #[tokio::test]
    async fn dispatch_error_stops_the_loop() {
        let collect = Arc::new(Collect {
            fail_on_delete: true,
            ..Default::default()
        });
        let events = stream(vec![
            Event::Apply(pod("web")),
            Event::Delete(pod("web")),
            Event::Apply(pod("db")),
        ]);

        let err = run_watch("pod", events, collect.clone()).await.unwrap_err();

        assert!(matches!(err, Error::Engine { .. }));
        assert_eq!(collect.changes.lock().unwrap().len(), 2);
    }

    #[test]
    fn legacy_flag_selects_policy_api_group() {
        assert_eq!(PolicyApi::for_cluster(true), PolicyApi::Legacy);
        assert_eq!(
            PolicyApi::for_cluster(true).url_path(),
            "/apis/extensions/v1beta1/networkpolicies"
        );

        assert_eq!(PolicyApi::for_cluster(false), PolicyApi::Stable);
        assert_eq!(
            PolicyApi::for_cluster(false).url_path(),
            "/apis/networking.k8s.io/v1/networkpolicies"
        );
    }

    #[test]
    fn map_event_preserves_shape() {
        let event = map_event(Event::InitApply(1), |n| n * 10);
        assert!(matches!(event, Event::InitApply(10)));
        assert!(matches!(map_event(Event::<u8>::InitDone, u32::from), Event::InitDone));
    }

    #[tokio::test]
    async fn wait_reports_first_finished_task() {
        let tasks = WatchTasks {
            tasks: vec![
                (
                    "namespace",
                    tokio::spawn(async { futures::future::pending::<Result<()>>().await }),
                ),
                (
                    "pod",
                    tokio::spawn(async { Err(Error::WatchEnded { resource: "pod" }) }),
                ),
            ],
        };

        let err = tasks.wait().await.unwrap_err();
        assert!(matches!(err, Error::WatchEnded { resource: "pod" }));
    }
}
