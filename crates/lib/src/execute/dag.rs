//! Dependency graph for resource ordering.
//!
//! This module provides a directed acyclic graph over logical ids, built either from the
//! declared descriptors or from persisted state records. It yields:
//! - A depth-first topological order (dependencies before dependents)
//! - The deletion order (the exact reverse)
//! - Parallel execution waves (groups of mutually independent resources)
//! - Forward dependent queries used for transitive invalidation

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::resource::{ConfigurationError, Declarations, LogicalId, RefMode};
use crate::state::StateRecord;

/// A DAG of resources, with edges pointing from a dependency to its dependent.
///
/// Edge weights record how the dependent consumes the dependency, so that physical-id
/// invalidation only follows edges that embed a physical id.
#[derive(Debug)]
pub struct ResourceDag {
  /// The underlying graph.
  graph: DiGraph<LogicalId, RefMode>,

  /// Map from logical id to node index.
  nodes: HashMap<LogicalId, NodeIndex>,

  /// Depth-first topological order.
  order: Vec<LogicalId>,
}

impl ResourceDag {
  /// Build the graph for a set of declared descriptors.
  ///
  /// # Errors
  ///
  /// - `UnresolvedReference` when a descriptor references an undeclared logical id
  /// - `KindMismatch` when a reference names the wrong kind for its target
  /// - `CyclicDependency` naming the cycle in path order
  pub fn from_declarations(declarations: &Declarations) -> Result<Self, ConfigurationError> {
    let mut edges = Vec::new();

    for descriptor in declarations.iter() {
      for reference in descriptor.references() {
        let Some(target) = declarations.get(&reference.target.id) else {
          return Err(ConfigurationError::UnresolvedReference {
            from: descriptor.logical_id().clone(),
            target: reference.target.id.clone(),
          });
        };
        if target.kind() != reference.target.kind {
          return Err(ConfigurationError::KindMismatch {
            from: descriptor.logical_id().clone(),
            target: reference.target.id.clone(),
            expected: reference.target.kind,
            actual: target.kind(),
          });
        }
        edges.push((reference.target.id.clone(), descriptor.logical_id().clone(), reference.mode));
      }
    }

    let ids = declarations.iter().map(|d| d.logical_id().clone()).collect();
    Self::build(ids, edges)
  }

  /// Build the graph for persisted records using their stored dependencies.
  ///
  /// Dependencies on ids outside `records` are ignored. Dependencies whose physical ids were
  /// recorded as bindings keep the `Physical` mode.
  pub fn from_records(records: &BTreeMap<LogicalId, StateRecord>) -> Result<Self, ConfigurationError> {
    let mut edges = Vec::new();

    for record in records.values() {
      for dep in &record.depends_on {
        if !records.contains_key(dep) {
          continue;
        }
        let mode = if record.bindings.contains_key(dep) {
          RefMode::Physical
        } else {
          RefMode::Order
        };
        edges.push((dep.clone(), record.logical_id.clone(), mode));
      }
    }

    Self::build(records.keys().cloned().collect(), edges)
  }

  /// Add ordering edges for recorded dependencies between resources still in the graph.
  ///
  /// A resource that stopped referencing a dependency keeps converging after it for one more
  /// run, so replacing the dependency can remove the old dependent first. Recorded edges that
  /// would close a cycle with the declared ones are left out.
  pub fn with_recorded_order(
    mut self,
    records: &BTreeMap<LogicalId, StateRecord>,
  ) -> Result<Self, ConfigurationError> {
    for record in records.values() {
      let Some(&to) = self.nodes.get(&record.logical_id) else {
        continue;
      };
      for dep in &record.depends_on {
        let Some(&from) = self.nodes.get(dep) else {
          continue;
        };
        if self.graph.contains_edge(from, to) || has_path_connecting(&self.graph, to, from, None) {
          continue;
        }
        self.graph.add_edge(from, to, RefMode::Order);
      }
    }
    self.order = self.depth_first_order()?;
    Ok(self)
  }

  fn build(ids: Vec<LogicalId>, edges: Vec<(LogicalId, LogicalId, RefMode)>) -> Result<Self, ConfigurationError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for id in ids {
      let idx = graph.add_node(id.clone());
      nodes.insert(id, idx);
    }

    for (dependency, dependent, mode) in edges {
      let from = nodes[&dependency];
      let to = nodes[&dependent];
      // Keep one edge per pair, preferring the mode that carries a physical id.
      if let Some(existing) = graph.find_edge(from, to) {
        if mode == RefMode::Physical {
          graph[existing] = mode;
        }
        continue;
      }
      graph.add_edge(from, to, mode);
    }

    let mut dag = Self {
      graph,
      nodes,
      order: Vec::new(),
    };
    dag.order = dag.depth_first_order()?;
    Ok(dag)
  }

  /// Depth-first topological sort, reporting the first cycle found in path order.
  fn depth_first_order(&self) -> Result<Vec<LogicalId>, ConfigurationError> {
    let mut order = Vec::with_capacity(self.graph.node_count());
    let mut done: HashSet<NodeIndex> = HashSet::new();
    let mut path: Vec<NodeIndex> = Vec::new();

    for idx in self.graph.node_indices() {
      self.visit(idx, &mut done, &mut path, &mut order)?;
    }

    Ok(order)
  }

  fn visit(
    &self,
    idx: NodeIndex,
    done: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
    order: &mut Vec<LogicalId>,
  ) -> Result<(), ConfigurationError> {
    if done.contains(&idx) {
      return Ok(());
    }
    if let Some(start) = path.iter().position(|&p| p == idx) {
      let mut cycle: Vec<LogicalId> = path[start..].iter().map(|&p| self.graph[p].clone()).collect();
      cycle.push(self.graph[idx].clone());
      return Err(ConfigurationError::CyclicDependency { cycle });
    }

    path.push(idx);
    for dep in self.sorted_neighbors(idx, Direction::Incoming) {
      self.visit(dep, done, path, order)?;
    }
    path.pop();

    done.insert(idx);
    order.push(self.graph[idx].clone());
    Ok(())
  }

  /// Neighbors in node-insertion order, so traversal is deterministic.
  fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
    let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
    neighbors.sort();
    neighbors.dedup();
    neighbors
  }

  /// Logical ids with every dependency before its dependents.
  pub fn topological_order(&self) -> &[LogicalId] {
    &self.order
  }

  /// The exact reverse of the topological order.
  pub fn deletion_order(&self) -> Vec<LogicalId> {
    self.order.iter().rev().cloned().collect()
  }

  /// Group resources into parallel execution waves.
  ///
  /// Each wave contains resources whose dependencies all sit in earlier waves. Within a wave,
  /// resources keep their topological order.
  pub fn execution_waves(&self) -> Vec<Vec<LogicalId>> {
    // Kahn's algorithm, one level at a time
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in self.graph.node_indices() {
      in_degree.insert(idx, self.sorted_neighbors(idx, Direction::Incoming).len());
    }

    let position: HashMap<&LogicalId, usize> = self.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut waves = Vec::new();
    let mut ready: Vec<NodeIndex> = in_degree.iter().filter(|&(_, &d)| d == 0).map(|(&idx, _)| idx).collect();

    while !ready.is_empty() {
      ready.sort_by_key(|idx| position[&self.graph[*idx]]);

      let mut next = Vec::new();
      for &idx in &ready {
        for dependent in self.sorted_neighbors(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
            if *deg == 0 {
              next.push(dependent);
            }
          }
        }
      }

      waves.push(ready.iter().map(|&idx| self.graph[idx].clone()).collect());
      ready = next;
    }

    waves
  }

  /// Direct dependencies of a resource.
  pub fn dependencies(&self, id: &LogicalId) -> Vec<LogicalId> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };
    self
      .sorted_neighbors(idx, Direction::Incoming)
      .into_iter()
      .map(|dep| self.graph[dep].clone())
      .collect()
  }

  /// Every resource reachable forward from `id`, in topological order.
  pub fn dependents_of(&self, id: &LogicalId) -> Vec<LogicalId> {
    self.reachable(id, |_| true)
  }

  /// Resources that transitively embed `id`'s physical identity, in topological order.
  ///
  /// Only `Physical` edges are followed: a dependent that merely renders a name is unaffected
  /// when the dependency receives a new physical id.
  pub fn physical_dependents_of(&self, id: &LogicalId) -> Vec<LogicalId> {
    self.reachable(id, |mode| mode == RefMode::Physical)
  }

  fn reachable(&self, id: &LogicalId, follow: impl Fn(RefMode) -> bool) -> Vec<LogicalId> {
    let Some(&start) = self.nodes.get(id) else {
      return Vec::new();
    };

    let mut seen: HashSet<NodeIndex> = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(idx) = queue.pop_front() {
      for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
        if follow(*edge.weight()) && seen.insert(edge.target()) {
          queue.push_back(edge.target());
        }
      }
    }

    self
      .order
      .iter()
      .filter(|id| self.nodes.get(*id).is_some_and(|idx| seen.contains(idx)))
      .cloned()
      .collect()
  }

  pub fn contains(&self, id: &LogicalId) -> bool {
    self.nodes.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }
}
