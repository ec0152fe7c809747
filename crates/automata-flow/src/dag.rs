//! Dependency graph for flow execution.
//!
//! [`FlowDag`] turns a validated [`FlowSpec`] into a directed acyclic graph
//! of executable nodes. Parallel steps expand into one node per branch step
//! (keyed by the fully-qualified `{parallel}.{branch}.{step}` id) plus a
//! synthetic join node that synchronizes the branch endpoints. Join nodes
//! are never dispatched; they auto-resolve once every dependency completes.
//!
//! Construction runs Kahn's algorithm with insertion-order tie-breaking, so
//! cycle detection happens up front and iteration is deterministic.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::spec::{join_node_id, qualified_step_id, FlowSpec, StepDef, StepType};

/// A node in the flow DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    /// Node id: the step id, a fully-qualified branch-step id, or a
    /// synthetic `{parallel}.join` id.
    pub id: String,
    /// The step definition, absent for synthetic join nodes.
    pub step: Option<StepDef>,
    /// Owning parallel step, for nodes synthesized from branches.
    pub parallel_id: Option<String>,
    /// Owning branch, for nodes synthesized from branches.
    pub branch_id: Option<String>,
}

impl DagNode {
    /// Returns true for synthetic join nodes.
    #[must_use]
    pub const fn is_join(&self) -> bool {
        self.step.is_none()
    }
}

/// Result of a ready-set computation.
///
/// The computation is pure: join nodes whose dependencies have all completed
/// are reported in `resolved_joins` rather than being folded into the
/// caller's completed set. The caller absorbs them under its own write lock
/// before dispatching `ready`.
#[derive(Debug, Default)]
pub struct ReadySet {
    /// Executable node ids whose dependencies are all completed.
    pub ready: Vec<String>,
    /// Join node ids that became complete, in resolution order.
    pub resolved_joins: Vec<String>,
}

/// Directed acyclic graph of flow steps.
#[derive(Debug, Clone)]
pub struct FlowDag {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, DagNode>,
    index: HashMap<String, NodeIndex>,
    insertion_order: Vec<NodeIndex>,
}

impl FlowDag {
    /// Builds the DAG for a validated spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when a dependency cannot be resolved and
    /// [`Error::CycleDetected`] when the dependency graph is cyclic.
    pub fn build(spec: &FlowSpec) -> Result<Self> {
        let mut dag = Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            index: HashMap::new(),
            insertion_order: Vec::new(),
        };

        // First pass: create every node so dependency resolution can see
        // forward references.
        for step in &spec.steps {
            dag.add_step_nodes(step);
        }

        // Second pass: wire the edges.
        for step in &spec.steps {
            dag.link_dependencies(step)?;
        }

        // Cycle check up front; the order itself is recomputed on demand.
        dag.toposort()?;

        Ok(dag)
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    /// Returns the number of nodes, joins included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Returns all node ids in insertion order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<&str> {
        self.insertion_order
            .iter()
            .map(|&idx| self.graph[idx].as_str())
            .collect()
    }

    /// Returns the executable (non-join) nodes in insertion order.
    #[must_use]
    pub fn executable_nodes(&self) -> Vec<&DagNode> {
        self.insertion_order
            .iter()
            .filter_map(|&idx| self.nodes.get(&self.graph[idx]))
            .filter(|node| !node.is_join())
            .collect()
    }

    /// Returns the ids a node depends on, in insertion order.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        deps.sort_by_key(|n| self.insertion_position(*n));
        deps.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Computes the nodes ready for dispatch given the completed and running
    /// sets.
    ///
    /// A node is ready when it is neither completed nor running and every
    /// dependency is completed. Join nodes are never returned as ready; the
    /// ones whose dependencies completed are reported separately so the
    /// caller can mark them completed (cascading joins resolve in the same
    /// pass).
    #[must_use]
    pub fn ready_set(&self, completed: &HashSet<String>, running: &HashSet<String>) -> ReadySet {
        let mut result = ReadySet::default();
        let mut effective: HashSet<&str> = completed.iter().map(String::as_str).collect();

        // Resolve joins to a fixed point first: a join completing may be the
        // last dependency of another join (nested parallels).
        loop {
            let mut progressed = false;
            for &idx in &self.insertion_order {
                let id = self.graph[idx].as_str();
                let node = &self.nodes[id];
                if !node.is_join() || effective.contains(id) {
                    continue;
                }
                if self.all_dependencies_in(idx, &effective) {
                    effective.insert(id);
                    result.resolved_joins.push(id.to_string());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        for &idx in &self.insertion_order {
            let id = self.graph[idx].as_str();
            let node = &self.nodes[id];
            if node.is_join() || effective.contains(id) || running.contains(id) {
                continue;
            }
            if self.all_dependencies_in(idx, &effective) {
                result.ready.push(id.to_string());
            }
        }

        result
    }

    /// Returns true when every node, joins included, is in `completed`.
    #[must_use]
    pub fn is_complete(&self, completed: &HashSet<String>) -> bool {
        self.nodes.keys().all(|id| completed.contains(id))
    }

    /// Returns a topologically sorted list of node ids.
    ///
    /// Kahn's algorithm with insertion-order tie-breaking for reproducible
    /// results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] if the graph contains a cycle.
    pub fn toposort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = queue.pop_front() {
            order.push(self.graph[idx].clone());

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| self.insertion_position(*n));

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cycle_node = self
                .insertion_order
                .iter()
                .find(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .map_or_else(|| "unknown".to_string(), |&idx| self.graph[idx].clone());
            return Err(Error::CycleDetected {
                cycle: vec![cycle_node],
            });
        }

        Ok(order)
    }

    fn insertion_position(&self, idx: NodeIndex) -> usize {
        self.insertion_order
            .iter()
            .position(|&i| i == idx)
            .unwrap_or(usize::MAX)
    }

    fn all_dependencies_in(&self, idx: NodeIndex, completed: &HashSet<&str>) -> bool {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .all(|dep| completed.contains(self.graph[dep].as_str()))
    }

    fn add_node(&mut self, node: DagNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node.id) {
            return idx;
        }
        let idx = self.graph.add_node(node.id.clone());
        self.index.insert(node.id.clone(), idx);
        self.insertion_order.push(idx);
        self.nodes.insert(node.id.clone(), node);
        idx
    }

    fn add_step_nodes(&mut self, step: &StepDef) {
        self.add_node(DagNode {
            id: step.id.clone(),
            step: Some(step.clone()),
            parallel_id: None,
            branch_id: None,
        });

        if step.step_type == StepType::Parallel {
            for branch in &step.branches {
                for branch_step in &branch.steps {
                    let full_id = qualified_step_id(&step.id, &branch.id, &branch_step.id);
                    self.add_node(DagNode {
                        id: full_id,
                        step: Some(branch_step.clone()),
                        parallel_id: Some(step.id.clone()),
                        branch_id: Some(branch.id.clone()),
                    });
                }
            }
            self.add_node(DagNode {
                id: join_node_id(&step.id),
                step: None,
                parallel_id: Some(step.id.clone()),
                branch_id: None,
            });
        }
    }

    fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        // update_edge deduplicates, keeping in-degrees honest when a
        // dependency is stated both implicitly and explicitly.
        self.graph.update_edge(from, to, ());
    }

    fn resolve(&self, id: &str) -> Option<NodeIndex> {
        // A dependency on a parallel step means "after the whole parallel",
        // which is its join node.
        if let Some(node) = self.nodes.get(id) {
            if node.step.as_ref().map(|s| s.step_type) == Some(StepType::Parallel) {
                return self.index.get(&join_node_id(id)).copied();
            }
        }
        self.index
            .get(id)
            .or_else(|| self.index.get(&join_node_id(id)))
            .copied()
    }

    fn link_dependencies(&mut self, step: &StepDef) -> Result<()> {
        let node_idx = self.index[&step.id];

        for dep in &step.depends_on {
            let dep_idx = self.resolve(dep).ok_or_else(|| {
                Error::validation(
                    &step.id,
                    "depends_on",
                    format!("depends on unknown step: {dep}"),
                )
            })?;
            self.add_edge(dep_idx, node_idx);
        }

        if step.step_type == StepType::Parallel {
            self.link_parallel_dependencies(step)?;
        }

        Ok(())
    }

    fn link_parallel_dependencies(&mut self, parallel: &StepDef) -> Result<()> {
        let parallel_idx = self.index[&parallel.id];
        let join_idx = self.index[&join_node_id(&parallel.id)];

        for branch in &parallel.branches {
            let mut prev: Option<NodeIndex> = None;

            for (i, branch_step) in branch.steps.iter().enumerate() {
                let full_id = qualified_step_id(&parallel.id, &branch.id, &branch_step.id);
                let node_idx = self.index[&full_id];

                if let Some(prev_idx) = prev {
                    self.add_edge(prev_idx, node_idx);
                } else {
                    // First branch step starts when the parallel node does.
                    self.add_edge(parallel_idx, node_idx);
                }

                for dep in &branch_step.depends_on {
                    // Branch-local namespace wins over the flow-level one.
                    let local = qualified_step_id(&parallel.id, &branch.id, dep);
                    let dep_idx = if let Some(&idx) = self.index.get(&local) {
                        idx
                    } else {
                        self.resolve(dep).ok_or_else(|| {
                            Error::validation(
                                &branch_step.id,
                                "depends_on",
                                format!("depends on unknown step: {dep}"),
                            )
                        })?
                    };
                    self.add_edge(dep_idx, node_idx);
                }

                prev = Some(node_idx);
                if i == branch.steps.len() - 1 {
                    self.add_edge(node_idx, join_idx);
                }
            }
        }

        Ok(())
    }
}
