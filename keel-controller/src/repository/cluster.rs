//! Kubernetes-backed repositories
//!
//! Custom resources are accessed as [`DynamicObject`]s and converted to the
//! domain types through their JSON form, so the domain crate stays free of
//! any Kubernetes dependency.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerState as K8sContainerState, ContainerStatus, Pod, Secret,
};
use keel_core::domain::activity::PipelineActivity;
use keel_core::domain::environment::Environment;
use keel_core::domain::pod::{ContainerSnapshot, ContainerState, PIPELINE_RUN_LABEL, PodSnapshot};
use keel_core::domain::run::{PipelineRunInfo, PipelineStructure};
use keel_core::domain::workflow::Workflow;
use kube::Client;
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, LogParams, PostParams,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{BuildLogSource, ResourceStore, RunSource, StoreError, StoreResult};

/// Custom resource kinds the controllers use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CustomKind {
    PipelineActivity,
    Workflow,
    Environment,
    PipelineStructure,
    PipelineRun,
}

impl CustomKind {
    pub(crate) fn api_resource(self) -> ApiResource {
        let (group, version, kind, plural) = match self {
            CustomKind::PipelineActivity => {
                ("jenkins.io", "v1", "PipelineActivity", "pipelineactivities")
            }
            CustomKind::Workflow => ("jenkins.io", "v1", "Workflow", "workflows"),
            CustomKind::Environment => ("jenkins.io", "v1", "Environment", "environments"),
            CustomKind::PipelineStructure => {
                ("jenkins.io", "v1", "PipelineStructure", "pipelinestructures")
            }
            CustomKind::PipelineRun => ("tekton.dev", "v1alpha1", "PipelineRun", "pipelineruns"),
        };
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
    }

    fn kind(self) -> &'static str {
        match self {
            CustomKind::PipelineActivity => "PipelineActivity",
            CustomKind::Workflow => "Workflow",
            CustomKind::Environment => "Environment",
            CustomKind::PipelineStructure => "PipelineStructure",
            CustomKind::PipelineRun => "PipelineRun",
        }
    }
}

/// Converts a dynamic object into a domain resource
pub(crate) fn decode<T: DeserializeOwned>(object: DynamicObject) -> StoreResult<T> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(resource: &T, kind: CustomKind) -> StoreResult<DynamicObject> {
    let resource_api = kind.api_resource();
    let mut value = serde_json::to_value(resource)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid(format!("{} is not an object", kind.kind())))?;
    object.insert("apiVersion".to_string(), resource_api.api_version.into());
    object.insert("kind".to_string(), resource_api.kind.into());
    Ok(serde_json::from_value(value)?)
}

/// Flattens a pod into the snapshot the status logic works on
///
/// Returns `None` for pods without a name or spec.
pub(crate) fn pod_snapshot(pod: &Pod) -> Option<PodSnapshot> {
    let name = pod.metadata.name.clone()?;
    let spec = pod.spec.as_ref()?;
    let status = pod.status.as_ref();
    let init_statuses = status
        .and_then(|s| s.init_container_statuses.as_deref())
        .unwrap_or_default();
    let statuses = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();

    Some(PodSnapshot {
        name,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        init_containers: spec
            .init_containers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| container_snapshot(c, init_statuses))
            .collect(),
        containers: spec
            .containers
            .iter()
            .map(|c| container_snapshot(c, statuses))
            .collect(),
    })
}

fn container_snapshot(container: &Container, statuses: &[ContainerStatus]) -> ContainerSnapshot {
    let state = statuses
        .iter()
        .find(|status| status.name == container.name)
        .and_then(|status| status.state.as_ref())
        .map(container_state)
        .unwrap_or_default();

    ContainerSnapshot {
        name: container.name.clone(),
        args: container.args.clone().unwrap_or_default(),
        env: container
            .env
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|var| Some((var.name.clone(), var.value.clone()?)))
            .collect(),
        state,
    }
}

fn container_state(state: &K8sContainerState) -> ContainerState {
    if let Some(terminated) = &state.terminated {
        ContainerState::Terminated {
            exit_code: terminated.exit_code,
            started_at: terminated.started_at.as_ref().map(|t| t.0),
            finished_at: terminated.finished_at.as_ref().map(|t| t.0),
        }
    } else if let Some(running) = &state.running {
        ContainerState::Running {
            started_at: running.started_at.as_ref().map(|t| t.0),
        }
    } else {
        ContainerState::Waiting
    }
}

/// Kubernetes implementation of every repository trait
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn custom_api(&self, kind: CustomKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &kind.api_resource())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get_custom<T: DeserializeOwned>(
        &self,
        kind: CustomKind,
        name: &str,
    ) -> StoreResult<Option<T>> {
        match self.custom_api(kind).get_opt(name).await? {
            Some(object) => decode(object).map(Some),
            None => Ok(None),
        }
    }

    /// Lists a kind, skipping resources that do not decode
    async fn list_custom<T: DeserializeOwned>(&self, kind: CustomKind) -> StoreResult<Vec<T>> {
        let list = self.custom_api(kind).list(&ListParams::default()).await?;
        let mut resources = Vec::with_capacity(list.items.len());
        for object in list.items {
            let name = object.metadata.name.clone().unwrap_or_default();
            match decode(object) {
                Ok(resource) => resources.push(resource),
                Err(e) => warn!(kind = kind.kind(), name = %name, error = %e, "Skipping undecodable resource"),
            }
        }
        Ok(resources)
    }

    async fn create_custom<T: Serialize + DeserializeOwned>(
        &self,
        kind: CustomKind,
        resource: &T,
    ) -> StoreResult<T> {
        let object = encode(resource, kind)?;
        let created = self
            .custom_api(kind)
            .create(&PostParams::default(), &object)
            .await?;
        decode(created)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_activity(&self, name: &str) -> StoreResult<Option<PipelineActivity>> {
        self.get_custom(CustomKind::PipelineActivity, name).await
    }

    async fn list_activities(&self) -> StoreResult<Vec<PipelineActivity>> {
        self.list_custom(CustomKind::PipelineActivity).await
    }

    async fn create_activity(&self, activity: &PipelineActivity) -> StoreResult<PipelineActivity> {
        debug!(activity = %activity.name(), "Creating activity");
        self.create_custom(CustomKind::PipelineActivity, activity).await
    }

    async fn update_activity(&self, activity: &PipelineActivity) -> StoreResult<PipelineActivity> {
        let object = encode(activity, CustomKind::PipelineActivity)?;
        let result = self
            .custom_api(CustomKind::PipelineActivity)
            .replace(activity.name(), &PostParams::default(), &object)
            .await;
        match result {
            Ok(updated) => decode(updated),
            Err(kube::Error::Api(response)) if response.code == 409 => Err(StoreError::Conflict {
                kind: CustomKind::PipelineActivity.kind(),
                name: activity.name().to_string(),
            }),
            Err(kube::Error::Api(response)) if response.code == 404 => Err(StoreError::NotFound {
                kind: CustomKind::PipelineActivity.kind(),
                name: activity.name().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        self.list_custom(CustomKind::Workflow).await
    }

    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<Workflow> {
        self.create_custom(CustomKind::Workflow, workflow).await
    }

    async fn get_environment(&self, name: &str) -> StoreResult<Option<Environment>> {
        self.get_custom(CustomKind::Environment, name).await
    }

    async fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        self.list_custom(CustomKind::Environment).await
    }

    async fn list_secret_values(&self) -> StoreResult<Vec<String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = secrets.list(&ListParams::default()).await?;
        let values = list
            .items
            .into_iter()
            .filter_map(|secret| secret.data)
            .flat_map(|data| data.into_values())
            .filter_map(|bytes| String::from_utf8(bytes.0).ok())
            .collect();
        Ok(values)
    }
}

#[async_trait]
impl RunSource for KubeStore {
    async fn pipeline_run(&self, name: &str) -> StoreResult<Option<PipelineRunInfo>> {
        let run = self.custom_api(CustomKind::PipelineRun).get_opt(name).await?;
        let selector = format!("{PIPELINE_RUN_LABEL}={name}");
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        let pods: Vec<PodSnapshot> = pods.items.iter().filter_map(pod_snapshot).collect();

        if run.is_none() && pods.is_empty() {
            return Ok(None);
        }

        let labels = run
            .and_then(|run| run.metadata.labels)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let structure: Option<PipelineStructure> =
            self.get_custom(CustomKind::PipelineStructure, name).await?;

        Ok(Some(PipelineRunInfo::compose(
            name,
            labels,
            structure.as_ref(),
            pods,
        )))
    }
}

#[async_trait]
impl BuildLogSource for KubeStore {
    async fn container_logs(&self, pod: &PodSnapshot, container: &str) -> StoreResult<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            ..LogParams::default()
        };
        Ok(self.pods().logs(&pod.name, &params).await?)
    }
}
