//! In-memory mirror of the dependency table.
//!
//! Built once at startup from the full edge list and updated incrementally
//! after each successful repository write. Stored as two adjacency maps so
//! both directions are O(1) to reach.

use std::collections::{HashMap, HashSet};

use foreman_db::models::TaskDependency;

/// Directed dependency DAG: forward edges point from a task to what it
/// depends on.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    forward: HashMap<String, HashSet<String>>,
    reverse: HashMap<String, HashSet<String>>,
    depth_cache: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from every persisted edge.
    pub fn from_edges(edges: &[TaskDependency]) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_edge(&edge.task_id, &edge.depends_on_task_id);
        }
        graph
    }

    /// Would adding `task -> dep` close a cycle?
    ///
    /// True iff `task == dep` or a forward path already leads from `dep`
    /// back to `task`.
    pub fn would_create_cycle(&self, task: &str, dep: &str) -> bool {
        if task == dep {
            return true;
        }

        let mut stack = vec![dep];
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == task {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = self.forward.get(current) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
        false
    }

    /// Longest forward path length from `task`, memoized until the next
    /// mutation.
    pub fn max_depth(&mut self, task: &str) -> usize {
        if let Some(depth) = self.depth_cache.get(task) {
            return *depth;
        }
        let mut visiting = HashSet::new();
        let depth = self.depth_of(task, &mut visiting);
        self.depth_cache.insert(task.to_string(), depth);
        depth
    }

    /// Recursive longest-path walk. `visiting` guards against cycles in
    /// corrupt data; validated edges can never form one.
    fn depth_of(&mut self, task: &str, visiting: &mut HashSet<String>) -> usize {
        if let Some(depth) = self.depth_cache.get(task) {
            return *depth;
        }
        if !visiting.insert(task.to_string()) {
            return 0;
        }

        let deps: Vec<String> = self
            .forward
            .get(task)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut depth = 0;
        for dep in deps {
            depth = depth.max(1 + self.depth_of(&dep, visiting));
        }

        visiting.remove(task);
        self.depth_cache.insert(task.to_string(), depth);
        depth
    }

    pub fn add_edge(&mut self, task: &str, dep: &str) {
        self.forward
            .entry(task.to_string())
            .or_default()
            .insert(dep.to_string());
        self.reverse
            .entry(dep.to_string())
            .or_default()
            .insert(task.to_string());
        self.depth_cache.clear();
    }

    pub fn remove_edge(&mut self, task: &str, dep: &str) {
        if let Some(set) = self.forward.get_mut(task) {
            set.remove(dep);
            if set.is_empty() {
                self.forward.remove(task);
            }
        }
        if let Some(set) = self.reverse.get_mut(dep) {
            set.remove(task);
            if set.is_empty() {
                self.reverse.remove(dep);
            }
        }
        self.depth_cache.clear();
    }

    /// Strip every edge incident to `task`, in both directions.
    pub fn remove_task(&mut self, task: &str) {
        if let Some(deps) = self.forward.remove(task) {
            for dep in deps {
                if let Some(set) = self.reverse.get_mut(&dep) {
                    set.remove(task);
                    if set.is_empty() {
                        self.reverse.remove(&dep);
                    }
                }
            }
        }
        if let Some(dependents) = self.reverse.remove(task) {
            for dependent in dependents {
                if let Some(set) = self.forward.get_mut(&dependent) {
                    set.remove(task);
                    if set.is_empty() {
                        self.forward.remove(&dependent);
                    }
                }
            }
        }
        self.depth_cache.clear();
    }

    /// Total edge count.
    pub fn size(&self) -> usize {
        self.forward.values().map(HashSet::len).sum()
    }

    /// Direct dependents of `task` (reverse edges).
    pub fn dependents_of(&self, task: &str) -> Vec<String> {
        self.reverse
            .get(task)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
