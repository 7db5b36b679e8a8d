//! Kubernetes watch loops

use std::fmt::Debug;
use std::pin::pin;
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use kube::api::{Api, DynamicObject};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventHandler, ResourceEvent};
use crate::repository::{CustomKind, KubeStore, StoreResult, decode, pod_snapshot};

/// Resource kinds the controllers watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedKind {
    Pods,
    PipelineRuns,
    Activities,
    Workflows,
}

impl WatchedKind {
    fn custom_kind(self) -> Option<CustomKind> {
        match self {
            WatchedKind::Pods => None,
            WatchedKind::PipelineRuns => Some(CustomKind::PipelineRun),
            WatchedKind::Activities => Some(CustomKind::PipelineActivity),
            WatchedKind::Workflows => Some(CustomKind::Workflow),
        }
    }
}

/// Deleted pods carry nothing the reconciler needs
pub(crate) fn normalize_pod(pod: &Pod, deleted: bool) -> Option<ResourceEvent> {
    if deleted {
        return None;
    }
    pod_snapshot(pod).map(ResourceEvent::PodChanged)
}

pub(crate) fn normalize_custom(
    kind: WatchedKind,
    object: DynamicObject,
    deleted: bool,
) -> StoreResult<Option<ResourceEvent>> {
    let name = object.metadata.name.clone().unwrap_or_default();
    let event = match (kind, deleted) {
        (WatchedKind::PipelineRuns, false) => Some(ResourceEvent::PipelineRunChanged(name)),
        (WatchedKind::Activities, false) => Some(ResourceEvent::ActivityChanged(decode(object)?)),
        (WatchedKind::Activities, true) => Some(ResourceEvent::ActivityDeleted(name)),
        (WatchedKind::Workflows, false) => Some(ResourceEvent::WorkflowChanged(decode(object)?)),
        (WatchedKind::Workflows, true) => Some(ResourceEvent::WorkflowDeleted(name)),
        (WatchedKind::PipelineRuns, true) | (WatchedKind::Pods, _) => None,
    };
    Ok(event)
}

/// Feeds watch events of one namespace to a handler until cancelled
pub struct ResourceWatcher {
    store: KubeStore,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl ResourceWatcher {
    pub fn new(store: KubeStore, handler: Arc<dyn EventHandler>, cancel: CancellationToken) -> Self {
        Self {
            store,
            handler,
            cancel,
        }
    }

    pub async fn run(&self, kind: WatchedKind) {
        match kind.custom_kind() {
            None => {
                let pods: Api<Pod> =
                    Api::namespaced(self.store.client().clone(), self.store.namespace());
                self.run_stream(kind, pods, |pod, deleted| Ok(normalize_pod(&pod, deleted)))
                    .await
            }
            Some(custom) => {
                let api = self.store.custom_api(custom);
                self.run_stream(kind, api, move |object, deleted| {
                    normalize_custom(kind, object, deleted)
                })
                .await
            }
        }
    }

    async fn run_stream<K, F>(&self, kind: WatchedKind, api: Api<K>, normalize: F)
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        F: Fn(K, bool) -> StoreResult<Option<ResourceEvent>>,
    {
        let mut stream = pin!(watcher::watcher(api, watcher::Config::default()).default_backoff());
        info!(kind = ?kind, namespace = %self.store.namespace(), "Starting watcher");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(kind = ?kind, "Watcher stopped");
                    return;
                }
                next = stream.try_next() => next,
            };

            let (object, deleted) = match next {
                Ok(Some(Event::Apply(object) | Event::InitApply(object))) => (object, false),
                Ok(Some(Event::Delete(object))) => (object, true),
                Ok(Some(Event::Init)) => {
                    debug!(kind = ?kind, "Watcher initializing");
                    continue;
                }
                Ok(Some(Event::InitDone)) => {
                    debug!(kind = ?kind, "Watcher initialized");
                    continue;
                }
                Ok(None) => {
                    warn!(kind = ?kind, "Watch stream ended");
                    return;
                }
                Err(e) => {
                    warn!(kind = ?kind, error = %e, "Watch error, backing off");
                    continue;
                }
            };

            match normalize(object, deleted) {
                Ok(Some(event)) => self.handler.handle(event).await,
                Ok(None) => {}
                Err(e) => warn!(kind = ?kind, error = %e, "Skipping undecodable watch event"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(kind: &str, body: serde_json::Value) -> DynamicObject {
        let mut value = json!({
            "apiVersion": "jenkins.io/v1",
            "kind": kind,
            "metadata": { "name": "thing" }
        });
        if let (Some(target), Some(extra)) = (value.as_object_mut(), body.as_object()) {
            target.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_normalize_activity() {
        let activity = object(
            "PipelineActivity",
            json!({ "spec": { "pipeline": "org/app/master", "build": "2", "status": "Running" } }),
        );
        match normalize_custom(WatchedKind::Activities, activity, false).unwrap() {
            Some(ResourceEvent::ActivityChanged(a)) => {
                assert_eq!(a.name(), "thing");
                assert_eq!(a.spec.build, "2");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_normalize_deletions() {
        let workflow = object("Workflow", json!({ "spec": { "steps": [] } }));
        assert!(matches!(
            normalize_custom(WatchedKind::Workflows, workflow, true).unwrap(),
            Some(ResourceEvent::WorkflowDeleted(name)) if name == "thing"
        ));

        let run = object("PipelineRun", json!({}));
        assert!(normalize_custom(WatchedKind::PipelineRuns, run, true).unwrap().is_none());
    }

    #[test]
    fn test_undecodable_payload_is_an_error() {
        let broken = object(
            "PipelineActivity",
            json!({ "spec": { "steps": [ { "kind": "Unknown" } ] } }),
        );
        assert!(normalize_custom(WatchedKind::Activities, broken, false).is_err());
    }

    #[test]
    fn test_deleted_pods_are_ignored() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "p" },
            "spec": { "containers": [ { "name": "build-step-a" } ] }
        }))
        .unwrap();
        assert!(normalize_pod(&pod, true).is_none());
        assert!(matches!(normalize_pod(&pod, false), Some(ResourceEvent::PodChanged(_))));
    }
}
