//! Resource dependency graph.
//!
//! Hard edges order creation: a resource is only created after everything it
//! hard-depends on. Deferred edges model create-then-patch: the dependent is
//! created first and patched once the target exists, so they never take part
//! in ordering and cannot form a cycle.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use claimstack_shared::{ClaimStackError, Result};

use crate::resources::ResourceKind;
use crate::step::DeployStep;

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Hard,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub target: String,
    pub kind: EdgeKind,
}

/// Who creates the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioning {
    /// Declared in the stack template.
    Template,
    /// Created by a direct service call during its step.
    Bootstrap,
}

/// One declared resource.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    /// Logical id, unique within the graph.
    pub id: String,
    pub kind: ResourceKind,
    pub step: DeployStep,
    pub provisioning: Provisioning,
    pub depends_on: Vec<Dependency>,
}

impl Resource {
    pub fn new(id: impl Into<String>, kind: ResourceKind, step: DeployStep) -> Self {
        Self {
            id: id.into(),
            kind,
            step,
            provisioning: Provisioning::Template,
            depends_on: Vec::new(),
        }
    }

    /// Add a hard dependency.
    pub fn after(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(Dependency {
            target: target.into(),
            kind: EdgeKind::Hard,
        });
        self
    }

    /// Add a deferred (patch) dependency.
    pub fn patched_after(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(Dependency {
            target: target.into(),
            kind: EdgeKind::Deferred,
        });
        self
    }

    pub fn bootstrapped(mut self) -> Self {
        self.provisioning = Provisioning::Bootstrap;
        self
    }

    pub fn hard_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .filter(|d| d.kind == EdgeKind::Hard)
            .map(|d| d.target.as_str())
    }

    pub fn deferred_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .filter(|d| d.kind == EdgeKind::Deferred)
            .map(|d| d.target.as_str())
    }

    pub fn depends_on(&self, target: &str) -> bool {
        self.depends_on.iter().any(|d| d.target == target)
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A set of resources and their dependencies, in declaration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceGraph {
    resources: Vec<Resource>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource. Logical ids must be unique.
    pub fn add(&mut self, resource: Resource) -> Result<()> {
        if self.get(&resource.id).is_some() {
            return Err(ClaimStackError::validation(format!(
                "resource '{}' declared twice",
                resource.id
            )));
        }
        self.resources.push(resource);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Reject unknown or self references, hard dependencies on resources
    /// declared for a later step, and cycles.
    pub fn validate(&self) -> Result<()> {
        for resource in &self.resources {
            for dep in &resource.depends_on {
                if dep.target == resource.id {
                    return Err(ClaimStackError::validation(format!(
                        "resource '{}' depends on itself",
                        resource.id
                    )));
                }
                let Some(target) = self.get(&dep.target) else {
                    return Err(ClaimStackError::validation(format!(
                        "resource '{}' depends on undeclared resource '{}'",
                        resource.id, dep.target
                    )));
                };
                if dep.kind == EdgeKind::Hard && target.step > resource.step {
                    return Err(ClaimStackError::validation(format!(
                        "resource '{}' (step {}) depends on '{}' which is created later (step {})",
                        resource.id,
                        resource.step.number(),
                        target.id,
                        target.step.number()
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Resources in creation order. Ties keep declaration order, so the same
    /// graph always yields the same plan.
    pub fn topological_order(&self) -> Result<Vec<&Resource>> {
        let position: HashMap<&str, usize> = self
            .resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.as_str(), i))
            .collect();

        let mut pending = vec![0usize; self.resources.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.resources.len()];
        for (i, resource) in self.resources.iter().enumerate() {
            for target in resource.hard_dependencies() {
                let Some(&j) = position.get(target) else {
                    return Err(ClaimStackError::validation(format!(
                        "resource '{}' depends on undeclared resource '{target}'",
                        resource.id
                    )));
                };
                pending[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.resources.len())
            .filter(|&i| pending[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.resources.len());

        while let Some(i) = ready.pop_first() {
            order.push(&self.resources[i]);
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < self.resources.len() {
            let stuck: HashSet<usize> = (0..self.resources.len())
                .filter(|&i| pending[i] > 0)
                .collect();
            return Err(ClaimStackError::validation(format!(
                "dependency cycle: {}",
                self.describe_cycle(&stuck, &position)
            )));
        }

        Ok(order)
    }

    /// Walk hard edges among the unresolved nodes until one repeats. Every
    /// unresolved node still waits on another unresolved node, so the walk
    /// always closes a loop.
    fn describe_cycle(&self, stuck: &HashSet<usize>, position: &HashMap<&str, usize>) -> String {
        let Some(&start) = stuck.iter().min() else {
            return String::from("(unknown)");
        };
        let mut path = vec![start];
        let mut seen = HashMap::from([(start, 0usize)]);
        let mut current = start;

        loop {
            let next = self.resources[current]
                .hard_dependencies()
                .filter_map(|t| position.get(t).copied())
                .find(|j| stuck.contains(j));
            let Some(next) = next else {
                break;
            };
            if let Some(&at) = seen.get(&next) {
                let mut ids: Vec<&str> = path[at..]
                    .iter()
                    .map(|&i| self.resources[i].id.as_str())
                    .collect();
                ids.push(self.resources[next].id.as_str());
                return ids.join(" -> ");
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }

        path.iter()
            .map(|&i| self.resources[i].id.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// `(resource, target)` pairs patched after creation.
    pub fn deferred_patches(&self) -> Vec<(&Resource, &str)> {
        self.resources
            .iter()
            .flat_map(|r| r.deferred_dependencies().map(move |t| (r, t)))
            .collect()
    }

    /// Resources created at or before `step`.
    pub fn through(&self, step: DeployStep) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |r| r.step <= step)
    }

    /// Resources belonging to exactly `step`.
    pub fn at_step(&self, step: DeployStep) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |r| r.step == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::BucketPurpose;

    fn bucket(id: &str) -> Resource {
        Resource::new(id, ResourceKind::Bucket(BucketPurpose::Input), DeployStep::Foundation)
    }

    fn ids<'a>(order: &[&'a Resource]) -> Vec<&'a str> {
        order.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn order_respects_dependencies_and_declaration_order() {
        let mut graph = ResourceGraph::new();
        graph.add(bucket("C").after("A")).expect("add");
        graph.add(bucket("A")).expect("add");
        graph.add(bucket("B")).expect("add");
        graph.add(bucket("D").after("C").after("B")).expect("add");

        let order = graph.topological_order().expect("acyclic");
        assert_eq!(ids(&order), vec!["A", "C", "B", "D"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add(bucket("A")).expect("add");
        assert!(graph.add(bucket("A")).is_err());
    }

    #[test]
    fn cycle_is_reported_with_members() {
        let mut graph = ResourceGraph::new();
        graph.add(bucket("Role").after("Collection")).expect("add");
        graph.add(bucket("AccessPolicy").after("Role")).expect("add");
        graph.add(bucket("Collection").after("AccessPolicy")).expect("add");
        graph.add(bucket("Unrelated")).expect("add");

        let err = graph.validate().unwrap_err().to_string();
        assert!(err.contains("dependency cycle"), "{err}");
        for member in ["Role", "AccessPolicy", "Collection"] {
            assert!(err.contains(member), "{err}");
        }
        assert!(!err.contains("Unrelated"), "{err}");
    }

    #[test]
    fn deferred_edges_break_cycles() {
        let mut graph = ResourceGraph::new();
        graph.add(bucket("Bucket").patched_after("Function")).expect("add");
        graph.add(bucket("Function").after("Bucket")).expect("add");

        graph.validate().expect("deferred edge is not a cycle");
        assert_eq!(ids(&graph.topological_order().expect("order")), vec!["Bucket", "Function"]);
        let patches = graph.deferred_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0.id, "Bucket");
        assert_eq!(patches[0].1, "Function");
    }

    #[test]
    fn unknown_and_self_references_are_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add(bucket("A").after("Missing")).expect("add");
        assert!(graph.validate().unwrap_err().to_string().contains("undeclared"));

        let mut graph = ResourceGraph::new();
        graph.add(bucket("A").after("A")).expect("add");
        assert!(graph.validate().unwrap_err().to_string().contains("itself"));
    }

    #[test]
    fn hard_dependency_on_later_step_is_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add(bucket("Early").after("Late")).expect("add");
        graph
            .add(Resource::new(
                "Late",
                ResourceKind::Collection,
                DeployStep::Collection,
            ))
            .expect("add");
        let err = graph.validate().unwrap_err().to_string();
        assert!(err.contains("created later"), "{err}");
    }
}
