//! Provisioning plans
//!
//! A [`ProvisionPlan`] holds the resource nodes of one run in topological
//! order. The per-cloud creation order is that order filtered by cloud, and
//! the deletion order is its reverse.

use gridflow_core::{
    ClusterError, ClusterSpec, ResourceId, ResourceKind, ResourceNode, ResourceStatus, Result,
    MULTI_CLOUD_SCOPE,
};
use std::collections::{BTreeMap, BTreeSet};

/// Dependency-ordered nodes of a provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub cluster_id: String,

    /// The specification the plan was derived from
    pub spec: ClusterSpec,

    nodes: Vec<ResourceNode>,
}

impl ProvisionPlan {
    /// Orders `nodes` topologically.
    ///
    /// Fails when a dependency is missing, when an edge crosses clouds (only
    /// multi-cloud nodes may depend on other clouds) or when the graph has a
    /// cycle.
    pub fn new(
        cluster_id: impl Into<String>,
        spec: ClusterSpec,
        nodes: Vec<ResourceNode>,
    ) -> Result<Self> {
        let by_id: BTreeMap<&ResourceId, &ResourceNode> =
            nodes.iter().map(|n| (&n.id, n)).collect();

        for node in &nodes {
            for dep in &node.depends_on {
                let target = by_id.get(dep).ok_or_else(|| {
                    ClusterError::SpecInvalid(format!(
                        "{} depends on unknown resource {}",
                        node.id, dep
                    ))
                })?;
                if node.cloud != MULTI_CLOUD_SCOPE && target.cloud != node.cloud {
                    return Err(ClusterError::SpecInvalid(format!(
                        "{} on cloud {} depends on {} on cloud {}",
                        node.id, node.cloud, dep, target.cloud
                    )));
                }
            }
        }

        let order = topological_order(&nodes)?;
        let mut slots: Vec<Option<ResourceNode>> = nodes.into_iter().map(Some).collect();
        let nodes = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();

        Ok(Self {
            cluster_id: cluster_id.into(),
            spec,
            nodes,
        })
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn clouds(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.cloud.as_str()).collect()
    }

    /// Creation order of one cloud.
    pub fn cloud_plan(&self, cloud: &str) -> CloudPlan {
        CloudPlan {
            cloud: cloud.to_string(),
            creation: self
                .nodes
                .iter()
                .filter(|n| n.cloud == cloud)
                .map(|n| n.id.clone())
                .collect(),
        }
    }

    pub fn cloud_plans(&self) -> Vec<CloudPlan> {
        self.clouds()
            .into_iter()
            .map(|cloud| self.cloud_plan(cloud))
            .collect()
    }

    pub fn deletion_order(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter().rev()
    }

    /// Nodes the run has to create; nodes of an existing cluster are reused.
    pub fn to_create(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes
            .iter()
            .filter(|n| n.status != ResourceStatus::Ready)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for node in &self.nodes {
            if node.status == ResourceStatus::Ready {
                summary.reuse += 1;
            } else {
                summary.create += 1;
                *summary.by_kind.entry(node.kind()).or_default() += 1;
            }
        }
        summary
    }
}

/// Per-cloud view of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudPlan {
    pub cloud: String,
    pub creation: Vec<ResourceId>,
}

impl CloudPlan {
    pub fn deletion(&self) -> impl Iterator<Item = &ResourceId> {
        self.creation.iter().rev()
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub create: usize,
    pub reuse: usize,
    pub by_kind: BTreeMap<ResourceKind, usize>,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to create, {} reused", self.create, self.reuse)?;
        if !self.by_kind.is_empty() {
            let kinds = self
                .by_kind
                .iter()
                .map(|(kind, count)| format!("{} {}", count, kind))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ({})", kinds)?;
        }
        Ok(())
    }
}

/// Kahn's algorithm over `depends_on`, ties broken by kind precedence and id
/// so the order is deterministic. Dependencies outside `nodes` are ignored.
pub fn topological_order(nodes: &[ResourceNode]) -> Result<Vec<usize>> {
    let index: BTreeMap<&ResourceId, usize> =
        nodes.iter().enumerate().map(|(i, n)| (&n.id, i)).collect();

    let mut pending: Vec<usize> = vec![0; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            if let Some(&j) = index.get(dep) {
                pending[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let key = |i: usize| (nodes[i].kind(), nodes[i].id.clone());
    let mut ready: BTreeSet<(ResourceKind, ResourceId, usize)> = (0..nodes.len())
        .filter(|&i| pending[i] == 0)
        .map(|i| {
            let (kind, id) = key(i);
            (kind, id, i)
        })
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        let i = next.2;
        order.push(i);
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                let (kind, id) = key(d);
                ready.insert((kind, id, d));
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = (0..nodes.len())
            .filter(|i| pending[*i] > 0)
            .map(|i| nodes[i].id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ClusterError::SpecInvalid(format!(
            "dependency cycle between {}",
            stuck
        )));
    }
    Ok(order)
}
