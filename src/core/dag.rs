//! Step dependency graph for a goal's plan.
//!
//! `StepGraph` stores the steps of one goal in a petgraph arena, keeping
//! an id -> index map for lookups and the original list order for
//! sequential execution. Edges point from a dependency to its dependent.
//! Every mutation that adds an edge is validated against cycles, so a
//! constructed graph is always acyclic.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::step::{PlanningStep, StepId, StepStatus};
use crate::error::{Error, Result};

/// The step dependency graph.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<PlanningStep>", into = "Vec<PlanningStep>")]
pub struct StepGraph {
    graph: DiGraph<PlanningStep, ()>,
    index: HashMap<StepId, NodeIndex>,
    /// Steps in the order they were added.
    order: Vec<StepId>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Build a graph from a step list, wiring each step's declared dependencies.
    ///
    /// All steps are added before any edge, so a dependency may name a step
    /// that appears later in the list; the graph as a whole must still be
    /// acyclic.
    ///
    /// # Errors
    /// Returns `GoalPlanningFailure` for duplicate ids, dependencies on
    /// unknown steps, or a dependency cycle.
    pub fn from_steps(steps: Vec<PlanningStep>) -> Result<Self> {
        let mut graph = Self::new();
        let mut edges = Vec::new();
        for step in steps {
            for dep in &step.dependencies {
                edges.push((dep.clone(), step.id.clone()));
            }
            graph.add_step(step)?;
        }
        for (from, to) in edges {
            graph.link(&from, &to)?;
        }
        Ok(graph)
    }

    /// Add a step with no edges.
    ///
    /// # Errors
    /// Returns `GoalPlanningFailure` if a step with the same id exists.
    pub fn add_step(&mut self, step: PlanningStep) -> Result<NodeIndex> {
        if self.index.contains_key(&step.id) {
            return Err(Error::GoalPlanningFailure(format!(
                "duplicate step id: {}",
                step.id
            )));
        }
        let id = step.id.clone();
        let index = self.graph.add_node(step);
        self.index.insert(id.clone(), index);
        self.order.push(id);
        Ok(index)
    }

    /// Declare that `to` depends on `from`.
    ///
    /// # Errors
    /// Returns `GoalPlanningFailure` if either step is unknown or the edge
    /// would close a cycle.
    pub fn add_dependency(&mut self, from: &StepId, to: &StepId) -> Result<()> {
        self.link(from, to)?;
        if let Some(step) = self.get_mut(to) {
            if !step.dependencies.contains(from) {
                step.dependencies.push(from.clone());
            }
        }
        Ok(())
    }

    fn link(&mut self, from: &StepId, to: &StepId) -> Result<()> {
        let from_index = *self.index.get(from).ok_or_else(|| {
            Error::GoalPlanningFailure(format!("step {} depends on unknown step {}", to, from))
        })?;
        let to_index = *self.index.get(to).ok_or_else(|| {
            Error::GoalPlanningFailure(format!("unknown step {}", to))
        })?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::GoalPlanningFailure(format!(
                "dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &StepId) -> Option<&PlanningStep> {
        self.index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_mut(&mut self, id: &StepId) -> Option<&mut PlanningStep> {
        match self.index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Step ids in list order.
    pub fn step_ids(&self) -> &[StepId] {
        &self.order
    }

    /// Steps in list order.
    pub fn steps(&self) -> Vec<&PlanningStep> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Steps the given step depends on.
    pub fn dependencies_of(&self, id: &StepId) -> Vec<&PlanningStep> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Steps that depend on the given step.
    pub fn dependents_of(&self, id: &StepId) -> Vec<&PlanningStep> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &StepId, direction: Direction) -> Vec<&PlanningStep> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Dependencies of a step that are not yet completed, in list order.
    pub fn unmet_dependencies(&self, id: &StepId) -> Vec<StepId> {
        let mut unmet: Vec<StepId> = self
            .dependencies_of(id)
            .into_iter()
            .filter(|dep| dep.status != StepStatus::Completed)
            .map(|dep| dep.id.clone())
            .collect();
        unmet.sort_by_key(|dep| self.position(dep));
        unmet
    }

    fn position(&self, id: &StepId) -> usize {
        self.order
            .iter()
            .position(|o| o == id)
            .unwrap_or(usize::MAX)
    }

    pub fn dependencies_completed(&self, id: &StepId) -> bool {
        self.unmet_dependencies(id).is_empty()
    }

    /// Pending steps whose dependencies are all completed, in list order.
    pub fn ready_set(&self) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| {
                self.get(id)
                    .map(|step| step.status == StepStatus::Pending)
                    .unwrap_or(false)
                    && self.dependencies_completed(id)
            })
            .cloned()
            .collect()
    }

    /// Move a step into `executing`.
    ///
    /// # Errors
    /// Returns `Validation` if the step is unknown, not pending/ready, or has
    /// a dependency that is not completed.
    pub fn start_step(&mut self, id: &StepId, now: DateTime<Utc>) -> Result<()> {
        let unmet = self.unmet_dependencies(id);
        let step = self
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", id)))?;

        if !matches!(step.status, StepStatus::Pending | StepStatus::Ready) {
            return Err(Error::Validation(format!(
                "Step {} cannot start from status {}",
                id, step.status
            )));
        }
        if !unmet.is_empty() {
            return Err(Error::Validation(format!(
                "Step {} has incomplete dependencies",
                id
            )));
        }

        step.start(now);
        Ok(())
    }

    pub fn completed_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    pub fn all_completed(&self) -> bool {
        self.graph
            .node_weights()
            .all(|s| s.status == StepStatus::Completed)
    }

    /// Steps that still need to run (pending or ready).
    pub fn pending_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Ready))
            .count()
    }

    /// Steps in topological order (each after all of its dependencies).
    pub fn topological_order(&self) -> Result<Vec<&PlanningStep>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|s| s.name.as_str())
                .unwrap_or("unknown");
            Error::GoalPlanningFailure(format!("cycle detected at step: {}", name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Size of the widest dependency layer.
    ///
    /// A step's layer is one more than the deepest of its dependencies;
    /// the widest layer bounds how many steps can ever run at once.
    pub fn max_parallel_width(&self) -> usize {
        let Ok(sorted) = toposort(&self.graph, None) else {
            return 1;
        };
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for index in sorted {
            let d = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(index, d);
        }
        let mut widths: HashMap<usize, usize> = HashMap::new();
        for d in depth.values() {
            *widths.entry(*d).or_insert(0) += 1;
        }
        widths.values().copied().max().unwrap_or(0)
    }

    /// Sum of the estimated step durations.
    pub fn estimated_duration(&self) -> Duration {
        self.graph
            .node_weights()
            .map(|s| s.estimated_duration)
            .sum()
    }
}

impl Default for StepGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Vec<PlanningStep>> for StepGraph {
    type Error = Error;

    fn try_from(steps: Vec<PlanningStep>) -> Result<Self> {
        Self::from_steps(steps)
    }
}

impl From<StepGraph> for Vec<PlanningStep> {
    fn from(graph: StepGraph) -> Self {
        graph.steps().into_iter().cloned().collect()
    }
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("steps", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::StepType;

    fn step(id: &str) -> PlanningStep {
        PlanningStep::new(id, &format!("{} step", id), StepType::Action)
    }

    fn chain() -> StepGraph {
        StepGraph::from_steps(vec![
            step("a"),
            step("b").depends_on("a"),
            step("c").depends_on("b"),
        ])
        .unwrap()
    }

    fn complete(graph: &mut StepGraph, id: &str) {
        let now = Utc::now();
        graph.start_step(&StepId::from(id), now).unwrap();
        graph
            .get_mut(&StepId::from(id))
            .unwrap()
            .complete(serde_json::Value::Null, now);
    }

    #[test]
    fn test_graph_new() {
        let graph = StepGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
        assert!(graph.all_completed());
    }

    #[test]
    fn test_graph_debug() {
        let debug = format!("{:?}", chain());
        assert!(debug.contains("StepGraph"));
        assert!(debug.contains("dependencies: 2"));
    }

    #[test]
    fn test_from_steps_wires_dependencies() {
        let graph = chain();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependency_count(), 2);
        let deps = graph.dependencies_of(&StepId::from("c"));
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, StepId::from("b"));
        assert_eq!(graph.dependents_of(&StepId::from("a"))[0].id, StepId::from("b"));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let result = StepGraph::from_steps(vec![step("a"), step("a")]);
        assert!(matches!(result, Err(Error::GoalPlanningFailure(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = StepGraph::from_steps(vec![step("a").depends_on("ghost")]);
        assert!(matches!(result, Err(Error::GoalPlanningFailure(_))));
    }

    #[test]
    fn test_mutual_dependency_rejected() {
        let result = StepGraph::from_steps(vec![
            step("a").depends_on("b"),
            step("b").depends_on("a"),
        ]);
        assert!(matches!(result, Err(Error::GoalPlanningFailure(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = StepGraph::from_steps(vec![step("a").depends_on("a")]);
        assert!(matches!(result, Err(Error::GoalPlanningFailure(_))));
    }

    #[test]
    fn test_add_dependency_cycle_leaves_graph_unchanged() {
        let mut graph = chain();
        let result = graph.add_dependency(&StepId::from("c"), &StepId::from("a"));
        assert!(result.is_err());
        assert_eq!(graph.dependency_count(), 2);
        assert!(graph.get(&StepId::from("a")).unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_add_dependency_records_on_step() {
        let mut graph = StepGraph::from_steps(vec![step("a"), step("b")]).unwrap();
        graph
            .add_dependency(&StepId::from("a"), &StepId::from("b"))
            .unwrap();
        assert_eq!(
            graph.get(&StepId::from("b")).unwrap().dependencies,
            vec![StepId::from("a")]
        );
    }

    #[test]
    fn test_forward_reference_is_allowed_when_acyclic() {
        let graph =
            StepGraph::from_steps(vec![step("b").depends_on("a"), step("a")]).unwrap();
        assert_eq!(graph.ready_set(), vec![StepId::from("a")]);
    }

    #[test]
    fn test_ready_set_follows_completion() {
        let mut graph = chain();
        assert_eq!(graph.ready_set(), vec![StepId::from("a")]);

        complete(&mut graph, "a");
        assert_eq!(graph.ready_set(), vec![StepId::from("b")]);

        complete(&mut graph, "b");
        complete(&mut graph, "c");
        assert!(graph.ready_set().is_empty());
        assert!(graph.all_completed());
        assert_eq!(graph.completed_count(), 3);
    }

    #[test]
    fn test_ready_set_diamond() {
        let graph = StepGraph::from_steps(vec![
            step("a"),
            step("b"),
            step("c").depends_on("a").depends_on("b"),
        ])
        .unwrap();
        assert_eq!(graph.ready_set(), vec![StepId::from("a"), StepId::from("b")]);
        assert_eq!(
            graph.unmet_dependencies(&StepId::from("c")),
            vec![StepId::from("a"), StepId::from("b")]
        );
    }

    #[test]
    fn test_ready_set_skips_failed_and_executing() {
        let mut graph = StepGraph::from_steps(vec![step("a"), step("b")]).unwrap();
        let now = Utc::now();
        graph.start_step(&StepId::from("a"), now).unwrap();
        graph.get_mut(&StepId::from("b")).unwrap().fail("x", now);
        assert!(graph.ready_set().is_empty());
        assert_eq!(graph.pending_count(), 0);
    }

    #[test]
    fn test_start_step_enforces_dependencies() {
        let mut graph = chain();
        let result = graph.start_step(&StepId::from("b"), Utc::now());
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(
            graph.get(&StepId::from("b")).unwrap().status,
            StepStatus::Pending
        );
    }

    #[test]
    fn test_start_step_rejects_double_start() {
        let mut graph = chain();
        let now = Utc::now();
        graph.start_step(&StepId::from("a"), now).unwrap();
        assert!(graph.start_step(&StepId::from("a"), now).is_err());
    }

    #[test]
    fn test_topological_order() {
        let graph =
            StepGraph::from_steps(vec![step("c").depends_on("b"), step("b").depends_on("a"), step("a")])
                .unwrap();
        let order: Vec<_> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|s| s.id.0.clone())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_max_parallel_width() {
        assert_eq!(chain().max_parallel_width(), 1);
        let wide = StepGraph::from_steps(vec![
            step("a"),
            step("b"),
            step("c"),
            step("d").depends_on("a"),
        ])
        .unwrap();
        assert_eq!(wide.max_parallel_width(), 3);
    }

    #[test]
    fn test_estimated_duration_sums_steps() {
        let graph = StepGraph::from_steps(vec![
            step("a").with_duration(Duration::from_secs(10)),
            step("b").with_duration(Duration::from_secs(20)),
        ])
        .unwrap();
        assert_eq!(graph.estimated_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_serialization_preserves_order_and_edges() {
        let graph = chain();
        let json = serde_json::to_string(&graph).unwrap();
        let parsed: StepGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.step_ids(), graph.step_ids());
        assert_eq!(parsed.dependency_count(), 2);
    }

    #[test]
    fn test_deserialization_rejects_cycles() {
        let cyclic = vec![step("a").depends_on("b"), step("b").depends_on("a")];
        let json = serde_json::to_string(&cyclic).unwrap();
        assert!(serde_json::from_str::<StepGraph>(&json).is_err());
    }
}
