//! Pipeline-run info
//!
//! A pipeline run executes a tree of stages, each leaf stage in its own pod.
//! [`PipelineRunInfo`] stores that tree as an arena: nodes live in one vector
//! and refer to their children by index, so the status fold can walk it
//! bottom-up without shared mutable pointers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::meta::ObjectMeta;
use super::pod::PodSnapshot;
use crate::naming::to_valid_name;

/// Name of the single stage a meta pipeline reports
pub const META_PIPELINE_STAGE: &str = "meta pipeline";

/// Separator between parent and child stage names
pub const STAGE_NAME_SEPARATOR: &str = " / ";

/// Stored stage layout of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineStructure {
    pub metadata: ObjectMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_run_ref: Option<String>,
    pub stages: Vec<PipelineStructureStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineStructureStage {
    pub name: String,
    pub depth: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Sequential children
    pub stages: Vec<String>,
    /// Parallel children
    pub parallel: Vec<String>,
}

/// One node of the stage arena
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageInfo {
    pub name: String,
    pub parents: Vec<String>,
    pub pod: Option<PodSnapshot>,
    pub children: Vec<usize>,
    pub parallel: bool,
}

impl StageInfo {
    /// Stage name prefixed by its ancestors
    pub fn full_name(&self) -> String {
        if self.parents.is_empty() {
            return self.name.clone();
        }
        let mut parts = self.parents.clone();
        parts.push(self.name.clone());
        parts.join(STAGE_NAME_SEPARATOR)
    }
}

/// A pipeline run composed with its pods
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineRunInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub stages: Vec<StageInfo>,
    pub roots: Vec<usize>,
}

impl PipelineRunInfo {
    /// Builds the stage arena for a run
    ///
    /// With a structure, stages follow it and pods attach by their stage label.
    /// Without one every pod becomes its own top-level stage.
    pub fn compose(
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        structure: Option<&PipelineStructure>,
        pods: Vec<PodSnapshot>,
    ) -> Self {
        let mut info = Self {
            name: name.into(),
            labels,
            ..Default::default()
        };

        match structure.filter(|s| !s.stages.is_empty()) {
            Some(structure) => {
                let mut pods = pods;
                let by_name: BTreeMap<&str, &PipelineStructureStage> = structure
                    .stages
                    .iter()
                    .map(|stage| (stage.name.as_str(), stage))
                    .collect();
                let mut visited = HashSet::new();
                for stage in structure.stages.iter().filter(|s| s.parent.is_none()) {
                    if let Some(index) =
                        info.add_stage(stage, &[], &by_name, &mut pods, &mut visited)
                    {
                        info.roots.push(index);
                    }
                }
            }
            None => {
                for pod in pods {
                    let stage_name = pod.stage_name().unwrap_or(&pod.name).to_string();
                    info.stages.push(StageInfo {
                        name: stage_name,
                        pod: Some(pod),
                        ..Default::default()
                    });
                    info.roots.push(info.stages.len() - 1);
                }
            }
        }
        info
    }

    fn add_stage(
        &mut self,
        stage: &PipelineStructureStage,
        parents: &[String],
        by_name: &BTreeMap<&str, &PipelineStructureStage>,
        pods: &mut Vec<PodSnapshot>,
        visited: &mut HashSet<String>,
    ) -> Option<usize> {
        if !visited.insert(stage.name.clone()) {
            return None;
        }

        let pod = pods
            .iter()
            .position(|pod| {
                pod.stage_name()
                    .is_some_and(|label| label == stage.name || label == to_valid_name(&stage.name))
            })
            .map(|index| pods.remove(index));

        let index = self.stages.len();
        self.stages.push(StageInfo {
            name: stage.name.clone(),
            parents: parents.to_vec(),
            pod,
            children: Vec::new(),
            parallel: !stage.parallel.is_empty(),
        });

        let mut child_parents = parents.to_vec();
        child_parents.push(stage.name.clone());
        let mut children = Vec::new();
        for child in stage.stages.iter().chain(stage.parallel.iter()) {
            if let Some(child_stage) = by_name.get(child.as_str()) {
                if let Some(child_index) =
                    self.add_stage(child_stage, &child_parents, by_name, pods, visited)
                {
                    children.push(child_index);
                }
            }
        }
        self.stages[index].children = children;
        Some(index)
    }

    pub fn full_name(&self, index: usize) -> String {
        self.stages[index].full_name()
    }

    /// Node indices with every child before its parent
    pub fn post_order(&self) -> Vec<usize> {
        fn visit(info: &PipelineRunInfo, index: usize, out: &mut Vec<usize>) {
            for &child in &info.stages[index].children {
                visit(info, child, out);
            }
            out.push(index);
        }

        let mut out = Vec::with_capacity(self.stages.len());
        for &root in &self.roots {
            visit(self, root, &mut out);
        }
        out
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodSnapshot> {
        self.stages.iter().filter_map(|stage| stage.pod.as_ref())
    }

    pub fn is_meta_pipeline(&self) -> bool {
        self.stages.len() == 1 && self.stages[0].name == META_PIPELINE_STAGE
    }
}
