//! Kubernetes implementations of [`Orchestrator`] and [`WatchSource`].

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};
use kube::runtime::watcher;
use kube::Client;

use crate::error::OrchestratorError;
use crate::manifest::{LabelSelector, Manifest, ResourceKind, JOB_LABEL};
use crate::orchestrator::{Orchestrator, WatchSource};
use crate::reconcile::{
    ClusterEvent, EventSeverity, InvolvedObject, PodCondition, PodEvent, PodPhase, WatchEvent,
    WatchEventType,
};

fn api_resource(kind: ResourceKind) -> ApiResource {
    let gvk = match kind {
        ResourceKind::Job => GroupVersionKind::gvk("batch", "v1", "Job"),
        ResourceKind::ReplicationController => {
            GroupVersionKind::gvk("", "v1", "ReplicationController")
        }
        ResourceKind::Service => GroupVersionKind::gvk("", "v1", "Service"),
        ResourceKind::Ingress => GroupVersionKind::gvk("networking.k8s.io", "v1", "Ingress"),
    };
    ApiResource::from_gvk(&gvk)
}

fn to_orchestrator_error(err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(response) => OrchestratorError::new(Some(response.code), response.message),
        other => OrchestratorError::new(None, other.to_string()),
    }
}

/// Orchestrator backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl std::fmt::Debug for KubeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeOrchestrator").finish_non_exhaustive()
    }
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the in-cluster environment or the local kubeconfig.
    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create(&self, namespace: &str, manifest: &Manifest) -> Result<(), OrchestratorError> {
        let object: DynamicObject = serde_json::from_value(manifest.body.clone()).map_err(|err| {
            OrchestratorError::new(None, format!("invalid {} manifest: {err}", manifest.kind))
        })?;
        self.api(manifest.kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(to_orchestrator_error)?;
        tracing::debug!("Created {} {}/{}", manifest.kind, namespace, manifest.name);
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), OrchestratorError> {
        // Not every kind supports collection deletes, so delete by name.
        let api = self.api(kind, namespace);
        for name in self.list(kind, namespace, selector).await? {
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => tracing::debug!("Deleted {} {}/{}", kind, namespace, name),
                Err(err) => {
                    let err = to_orchestrator_error(err);
                    if !err.is_not_found() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<String>, OrchestratorError> {
        let params = ListParams::default().labels(&selector.to_string());
        let objects = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(to_orchestrator_error)?;
        Ok(objects
            .items
            .into_iter()
            .filter_map(|object| object.metadata.name)
            .collect())
    }
}

/// Translate a watched pod. Objects replayed by the initial list count as
/// additions; later applies count as modifications.
pub fn pod_event(event_type: WatchEventType, pod: Pod) -> PodEvent {
    let status = pod.status.unwrap_or_default();
    let conditions = status
        .conditions
        .unwrap_or_default()
        .into_iter()
        .map(|condition| PodCondition {
            condition_type: condition.type_,
            reason: condition.reason,
            last_transition_time: condition.last_transition_time.map(|time| time.0),
        })
        .collect();
    let waiting_reasons = status
        .init_container_statuses
        .unwrap_or_default()
        .into_iter()
        .chain(status.container_statuses.unwrap_or_default())
        .filter_map(|container| container.state?.waiting?.reason)
        .collect();

    PodEvent {
        event_type,
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
        phase: PodPhase::parse(status.phase.as_deref()),
        conditions,
        waiting_reasons,
    }
}

/// Translate a core `Event` object.
pub fn cluster_event(event: Event) -> ClusterEvent {
    let severity = match event.type_.as_deref() {
        Some("Warning") => EventSeverity::Warning,
        _ => EventSeverity::Normal,
    };
    ClusterEvent {
        involved_object: InvolvedObject {
            kind: event.involved_object.kind.unwrap_or_default(),
            name: event.involved_object.name.unwrap_or_default(),
            namespace: event.involved_object.namespace.unwrap_or_default(),
        },
        severity,
        reason: event.reason.unwrap_or_default(),
        message: event.message.unwrap_or_default(),
        last_timestamp: event.last_timestamp.map(|time| time.0),
        count: event
            .count
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or_default(),
    }
}

fn classify<K>(event: watcher::Event<K>) -> Option<(WatchEventType, K)> {
    match event {
        watcher::Event::InitApply(object) => Some((WatchEventType::Added, object)),
        watcher::Event::Apply(object) => Some((WatchEventType::Modified, object)),
        watcher::Event::Delete(object) => Some((WatchEventType::Deleted, object)),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Pods carrying the job label, across all namespaces.
#[derive(Clone)]
pub struct KubePodWatch {
    client: Client,
}

impl KubePodWatch {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchSource for KubePodWatch {
    fn name(&self) -> &str {
        "pods"
    }

    async fn open(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<WatchEvent>>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(JOB_LABEL);
        let stream = watcher(api, config).filter_map(|event| async move {
            match event {
                Ok(event) => classify(event)
                    .map(|(event_type, pod)| Ok(WatchEvent::Pod(pod_event(event_type, pod)))),
                Err(err) => Some(Err(anyhow::Error::new(err))),
            }
        });
        Ok(stream.boxed())
    }
}

/// Core `Event` objects across all namespaces.
#[derive(Clone)]
pub struct KubeEventWatch {
    client: Client,
}

impl KubeEventWatch {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchSource for KubeEventWatch {
    fn name(&self) -> &str {
        "events"
    }

    async fn open(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<WatchEvent>>> {
        let api: Api<Event> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default()).filter_map(|event| async move {
            match event {
                Ok(event) => classify(event)
                    .filter(|(event_type, _)| *event_type != WatchEventType::Deleted)
                    .map(|(_, event)| Ok(WatchEvent::Cluster(cluster_event(event)))),
                Err(err) => Some(Err(anyhow::Error::new(err))),
            }
        });
        Ok(stream.boxed())
    }
}
