/// Directed acyclic dependency graph over tasks.
///
/// Edges are stored as `(dependent, dependency)` pairs: the dependent is
/// blocked until the dependency is done. Adjacency lists preserve insertion
/// order, and task iteration follows the order tasks were first seen, so
/// every query is deterministic.
use crate::task::TaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Per-task dependency view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependencyView {
    pub task_id: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub is_blocked: bool,
    /// Dependency ids whose task is not done.
    pub blocked_by: Vec<String>,
}

/// Cycle detection result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub has_cycles: bool,
    pub cycles: Vec<Vec<String>>,
}

/// Whole-graph summary metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetrics {
    pub total_tasks: usize,
    pub total_dependencies: usize,
    pub root_tasks: usize,
    pub leaf_tasks: usize,
    pub max_depth: usize,
    pub average_dependencies: f64,
    pub has_cycles: bool,
    pub strongly_connected_components: usize,
}

/// The dependency graph: forward and reverse adjacency plus task status
/// metadata used to answer "is this dependency satisfied?".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Known task ids in first-seen order.
    order: Vec<String>,

    /// dependent -> dependencies, insertion order.
    dependencies: HashMap<String, Vec<String>>,

    /// dependency -> dependents, insertion order.
    dependents: HashMap<String, Vec<String>>,

    /// Status metadata for satisfaction checks.
    statuses: HashMap<String, TaskStatus>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from edge pairs and task metadata.
    pub fn from_parts<E, T>(edges: E, tasks: T) -> Self
    where
        E: IntoIterator<Item = (String, String)>,
        T: IntoIterator<Item = (String, TaskStatus)>,
    {
        let mut graph = DependencyGraph::new();
        for (id, status) in tasks {
            graph.ensure_task(&id);
            graph.statuses.insert(id, status);
        }
        for (dependent, dependency) in edges {
            let _ = graph.add_edge(&dependent, &dependency);
        }
        graph
    }

    /// Register a task id without any edges.
    pub fn ensure_task(&mut self, id: &str) {
        if !self.dependencies.contains_key(id) {
            self.order.push(id.to_string());
            self.dependencies.insert(id.to_string(), Vec::new());
            self.dependents.insert(id.to_string(), Vec::new());
        }
    }

    /// Record or update a task's status metadata.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) {
        self.ensure_task(id);
        self.statuses.insert(id.to_string(), status);
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.statuses.get(id).copied()
    }

    pub fn contains_task(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    /// Known task ids in first-seen order.
    pub fn tasks(&self) -> &[String] {
        &self.order
    }

    pub fn has_edge(&self, dependent: &str, dependency: &str) -> bool {
        self.dependencies
            .get(dependent)
            .map(|deps| deps.iter().any(|d| d == dependency))
            .unwrap_or(false)
    }

    /// Add an edge; returns false when it was already present. Self-edges
    /// are never added.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        if dependent == dependency || self.has_edge(dependent, dependency) {
            return false;
        }
        self.ensure_task(dependent);
        self.ensure_task(dependency);
        self.dependencies
            .get_mut(dependent)
            .expect("dependent registered")
            .push(dependency.to_string());
        self.dependents
            .get_mut(dependency)
            .expect("dependency registered")
            .push(dependent.to_string());
        true
    }

    /// Remove an edge; returns false when it was not present.
    pub fn remove_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        if !self.has_edge(dependent, dependency) {
            return false;
        }
        if let Some(deps) = self.dependencies.get_mut(dependent) {
            deps.retain(|d| d != dependency);
        }
        if let Some(deps) = self.dependents.get_mut(dependency) {
            deps.retain(|d| d != dependent);
        }
        true
    }

    /// Rename a task id everywhere (adjacency, order, statuses). Used when
    /// temporary ids are mapped to persisted ones.
    pub fn rename_task(&mut self, old: &str, new: &str) {
        if old == new || !self.contains_task(old) {
            return;
        }
        for id in &mut self.order {
            if id == old {
                *id = new.to_string();
            }
        }
        if let Some(deps) = self.dependencies.remove(old) {
            self.dependencies.insert(new.to_string(), deps);
        }
        if let Some(deps) = self.dependents.remove(old) {
            self.dependents.insert(new.to_string(), deps);
        }
        for deps in self.dependencies.values_mut() {
            for id in deps.iter_mut() {
                if id == old {
                    *id = new.to_string();
                }
            }
        }
        for deps in self.dependents.values_mut() {
            for id in deps.iter_mut() {
                if id == old {
                    *id = new.to_string();
                }
            }
        }
        if let Some(status) = self.statuses.remove(old) {
            self.statuses.insert(new.to_string(), status);
        }
    }

    /// All `(dependent, dependency)` pairs in deterministic order.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for id in &self.order {
            if let Some(deps) = self.dependencies.get(id) {
                for dep in deps {
                    out.push((id.clone(), dep.clone()));
                }
            }
        }
        out
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(|deps| deps.len()).sum()
    }

    /// Direct dependencies of a task, insertion order.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Direct dependents of a task, insertion order.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// True when the dependency's task is done.
    fn is_satisfied(&self, id: &str) -> bool {
        self.statuses.get(id) == Some(&TaskStatus::Done)
    }

    /// Dependency ids whose task is not done.
    pub fn blocked_by(&self, id: &str) -> Vec<String> {
        self.dependencies_of(id)
            .iter()
            .filter(|dep| !self.is_satisfied(dep))
            .cloned()
            .collect()
    }

    /// True when at least one dependency is incomplete.
    pub fn is_blocked(&self, id: &str) -> bool {
        self.dependencies_of(id)
            .iter()
            .any(|dep| !self.is_satisfied(dep))
    }

    /// Combined per-task view.
    pub fn task_view(&self, id: &str) -> Option<TaskDependencyView> {
        if !self.contains_task(id) {
            return None;
        }
        let blocked_by = self.blocked_by(id);
        Some(TaskDependencyView {
            task_id: id.to_string(),
            dependencies: self.dependencies_of(id).to_vec(),
            dependents: self.dependents_of(id).to_vec(),
            is_blocked: !blocked_by.is_empty(),
            blocked_by,
        })
    }

    /// Tasks with at least one incomplete dependency.
    pub fn blocked_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.is_blocked(id))
            .cloned()
            .collect()
    }

    /// Unstarted tasks that are not blocked. A task without status metadata
    /// counts as unstarted.
    pub fn executable_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                matches!(
                    self.statuses.get(id.as_str()),
                    None | Some(TaskStatus::Pending)
                ) && !self.is_blocked(id)
            })
            .cloned()
            .collect()
    }

    /// Non-destructive check: would adding `(dependent, dependency)` close
    /// a cycle? True when the dependency already (transitively) depends on
    /// the dependent.
    pub fn would_create_cycle(&self, dependent: &str, dependency: &str) -> bool {
        if dependent == dependency {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![dependency.to_string()];
        while let Some(current) = stack.pop() {
            if current == dependent {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            for next in self.dependencies_of(&current) {
                if !visited.contains(next) {
                    stack.push(next.clone());
                }
            }
        }
        false
    }

    /// The cycle that adding `(dependent, dependency)` would close, as a
    /// path `dependent -> dependency -> ... -> dependent`, if any.
    pub fn cycle_path(&self, dependent: &str, dependency: &str) -> Option<Vec<String>> {
        if dependent == dependency {
            return Some(vec![dependent.to_string(), dependent.to_string()]);
        }
        let chain = self.shortest_chain(dependency, dependent)?;
        let mut cycle = Vec::with_capacity(chain.len() + 1);
        cycle.push(dependent.to_string());
        cycle.extend(chain);
        Some(cycle)
    }

    /// Detect all cycles via DFS with a recursion stack; each cycle is the
    /// slice of the current path from the re-entered node.
    pub fn find_cycles(&self) -> CycleReport {
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for id in &self.order {
            if !visited.contains(id) {
                self.find_cycles_dfs(id, &mut visited, &mut rec_stack, &mut path, &mut cycles);
            }
        }

        CycleReport {
            has_cycles: !cycles.is_empty(),
            cycles,
        }
    }

    fn find_cycles_dfs(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(id.to_string());
        rec_stack.insert(id.to_string());
        path.push(id.to_string());

        for next in self.dependencies_of(id) {
            if !visited.contains(next) {
                self.find_cycles_dfs(next, visited, rec_stack, path, cycles);
            } else if rec_stack.contains(next) {
                if let Some(start) = path.iter().position(|n| n == next) {
                    cycles.push(path[start..].to_vec());
                }
            }
        }

        path.pop();
        rec_stack.remove(id);
    }

    /// Kahn's algorithm over the whole graph. Every dependency precedes its
    /// dependents in the result. Errors on a cyclic graph.
    pub fn topological_order(&self) -> Result<Vec<String>, CycleReport> {
        self.kahn(&self.order.iter().cloned().collect::<Vec<_>>())
    }

    /// Kahn's algorithm over the sub-graph induced by `ids`.
    pub fn topological_order_for(&self, ids: &[String]) -> Result<Vec<String>, CycleReport> {
        let members: Vec<String> = ids
            .iter()
            .filter(|id| self.contains_task(id))
            .cloned()
            .collect();
        self.kahn(&members)
    }

    fn kahn(&self, members: &[String]) -> Result<Vec<String>, CycleReport> {
        let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in members {
            let degree = self
                .dependencies_of(id)
                .iter()
                .filter(|dep| member_set.contains(dep.as_str()))
                .count();
            in_degree.insert(id.as_str(), degree);
        }

        let mut queue: VecDeque<&str> = members
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .map(String::as_str)
            .collect();
        let mut result = Vec::with_capacity(members.len());

        while let Some(id) = queue.pop_front() {
            result.push(id.to_string());
            for dependent in self.dependents_of(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if result.len() != members.len() {
            return Err(self.find_cycles());
        }
        Ok(result)
    }

    /// Depth-first walk downstream (over dependents) from `start`.
    pub fn walk_depth_first(&self, start: &str, visitor: &mut dyn FnMut(&str, usize)) -> bool {
        if !self.contains_task(start) {
            return false;
        }
        let mut visited = HashSet::new();
        self.dfs(start, 0, &mut visited, visitor);
        true
    }

    fn dfs(
        &self,
        id: &str,
        depth: usize,
        visited: &mut HashSet<String>,
        visitor: &mut dyn FnMut(&str, usize),
    ) {
        if !visited.insert(id.to_string()) {
            return;
        }
        visitor(id, depth);
        for next in self.dependents_of(id) {
            self.dfs(next, depth + 1, visited, visitor);
        }
    }

    /// Breadth-first walk downstream (over dependents) from `start`.
    pub fn walk_breadth_first(&self, start: &str, visitor: &mut dyn FnMut(&str, usize)) -> bool {
        if !self.contains_task(start) {
            return false;
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start.to_string(), 0usize));
        while let Some((id, depth)) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            visitor(&id, depth);
            for next in self.dependents_of(&id) {
                if !visited.contains(next) {
                    queue.push_back((next.clone(), depth + 1));
                }
            }
        }
        true
    }

    /// Shortest path from `from` to `to` following dependency edges
    /// (dependent towards its dependencies), inclusive of both endpoints.
    pub fn find_shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        self.shortest_chain(from, to)
    }

    fn shortest_chain(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.contains_task(from) || !self.contains_task(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut predecessor: HashMap<String, String> = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(from.to_string());
        let mut visited = HashSet::new();
        visited.insert(from.to_string());

        while let Some(current) = queue.pop_front() {
            for next in self.dependencies_of(&current) {
                if visited.insert(next.clone()) {
                    predecessor.insert(next.clone(), current.clone());
                    if next == to {
                        let mut path = vec![to.to_string()];
                        let mut cursor = to.to_string();
                        while let Some(prev) = predecessor.get(&cursor) {
                            path.push(prev.clone());
                            cursor = prev.clone();
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(next.clone());
                }
            }
        }
        None
    }

    /// Summary metrics for the whole graph.
    pub fn metrics(&self) -> GraphMetrics {
        let total_tasks = self.order.len();
        let total_dependencies = self.edge_count();
        let root_tasks = self
            .order
            .iter()
            .filter(|id| self.dependencies_of(id).is_empty())
            .count();
        let leaf_tasks = self
            .order
            .iter()
            .filter(|id| self.dependents_of(id).is_empty())
            .count();
        let has_cycles = self.find_cycles().has_cycles;
        let max_depth = if has_cycles { 0 } else { self.longest_chain() };
        let average_dependencies = if total_tasks == 0 {
            0.0
        } else {
            total_dependencies as f64 / total_tasks as f64
        };

        GraphMetrics {
            total_tasks,
            total_dependencies,
            root_tasks,
            leaf_tasks,
            max_depth,
            average_dependencies,
            has_cycles,
            strongly_connected_components: self.scc_count(),
        }
    }

    /// Longest dependency chain length (edges) via DP over a topological
    /// order. Zero for an empty or cyclic graph.
    fn longest_chain(&self) -> usize {
        let Ok(sorted) = self.topological_order() else {
            return 0;
        };
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut max = 0;
        for id in &sorted {
            let d = self
                .dependencies_of(id)
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            max = max.max(d);
            depth.insert(id.as_str(), d);
        }
        max
    }

    /// Number of strongly connected components (Tarjan). Equals the task
    /// count on an acyclic graph.
    fn scc_count(&self) -> usize {
        struct State<'a> {
            graph: &'a DependencyGraph,
            index: usize,
            indices: HashMap<&'a str, usize>,
            low: HashMap<&'a str, usize>,
            on_stack: HashSet<&'a str>,
            stack: Vec<&'a str>,
            components: usize,
        }

        fn strongconnect<'a>(state: &mut State<'a>, v: &'a str) {
            state.indices.insert(v, state.index);
            state.low.insert(v, state.index);
            state.index += 1;
            state.stack.push(v);
            state.on_stack.insert(v);

            let successors: Vec<&'a str> = state
                .graph
                .dependencies
                .get(v)
                .map(|deps| deps.iter().map(String::as_str).collect())
                .unwrap_or_default();
            for w in successors {
                if !state.indices.contains_key(w) {
                    strongconnect(state, w);
                    let low_w = state.low[w];
                    let low_v = state.low[v];
                    state.low.insert(v, low_v.min(low_w));
                } else if state.on_stack.contains(w) {
                    let idx_w = state.indices[w];
                    let low_v = state.low[v];
                    state.low.insert(v, low_v.min(idx_w));
                }
            }

            if state.low[v] == state.indices[v] {
                state.components += 1;
                while let Some(w) = state.stack.pop() {
                    state.on_stack.remove(w);
                    if w == v {
                        break;
                    }
                }
            }
        }

        let mut state = State {
            graph: self,
            index: 0,
            indices: HashMap::new(),
            low: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            components: 0,
        };
        for id in &self.order {
            if !state.indices.contains_key(id.as_str()) {
                strongconnect(&mut state, id.as_str());
            }
        }
        state.components
    }
}
