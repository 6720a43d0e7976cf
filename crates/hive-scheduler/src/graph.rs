//! Dependency graph, topological order and parallel grouping.

use std::collections::{btree_set, BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::decompose::{Objective, SubtaskSpec};
use crate::SchedulerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub description: String,
    pub required_capabilities: BTreeSet<String>,
    pub priority: u8,
    pub dependencies: BTreeSet<String>,
    /// Tasks that list this one as a dependency.
    pub dependents: BTreeSet<String>,
}

/// Task nodes keyed by id, remembering the order the subtasks were given in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    nodes: BTreeMap<String, TaskNode>,
    insertion: Vec<String>,
}

impl TaskGraph {
    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in the order they were supplied.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.insertion.iter().filter_map(|id| self.nodes.get(id))
    }
}

/// Build the node map, deriving `dependents`.
///
/// Rejects duplicate ids and dependencies on ids that are not in the list.
/// A task depending on itself is reported as a circular dependency. Longer
/// cycles are detected by [`topological_sort`].
pub fn build_dependency_graph(subtasks: &[SubtaskSpec]) -> Result<TaskGraph, SchedulerError> {
    let mut graph = TaskGraph::default();
    for spec in subtasks {
        if graph.nodes.contains_key(&spec.id) {
            return Err(SchedulerError::DuplicateTask(spec.id.clone()));
        }
        graph.insertion.push(spec.id.clone());
        graph.nodes.insert(
            spec.id.clone(),
            TaskNode {
                id: spec.id.clone(),
                description: spec.description.clone(),
                required_capabilities: spec.required_capabilities.clone(),
                priority: spec.priority,
                dependencies: spec.dependencies.clone(),
                dependents: BTreeSet::new(),
            },
        );
    }

    for spec in subtasks {
        for dep in &spec.dependencies {
            if dep == &spec.id {
                return Err(SchedulerError::CircularDependency {
                    task_id: spec.id.clone(),
                });
            }
            let Some(node) = graph.nodes.get_mut(dep) else {
                return Err(SchedulerError::UnknownDependency {
                    task_id: spec.id.clone(),
                    dependency: dep.clone(),
                });
            };
            node.dependents.insert(spec.id.clone());
        }
    }
    Ok(graph)
}

/// Depth-first linearization: every id appears after all of its dependencies.
///
/// Roots are visited in insertion order so the result is deterministic.
pub fn topological_sort(graph: &TaskGraph) -> Result<Vec<String>, SchedulerError> {
    let mut visiting: HashSet<&str> = HashSet::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(graph.len());
    // Each frame is a node on the current path plus its unvisited dependencies.
    let mut stack: Vec<(&str, btree_set::Iter<'_, String>)> = Vec::new();

    for root in &graph.insertion {
        if visited.contains(root.as_str()) {
            continue;
        }
        stack.push(enter(graph, root, &mut visiting)?);
        while let Some((id, deps)) = stack.last_mut() {
            let id: &str = *id;
            match deps.next() {
                Some(dep) if visited.contains(dep.as_str()) => {}
                Some(dep) => {
                    let frame = enter(graph, dep, &mut visiting)?;
                    stack.push(frame);
                }
                None => {
                    stack.pop();
                    visiting.remove(id);
                    visited.insert(id);
                    order.push(id.to_string());
                }
            }
        }
    }
    Ok(order)
}

/// Mark `id` as on the current path, failing if it already is.
fn enter<'g>(
    graph: &'g TaskGraph,
    id: &'g str,
    visiting: &mut HashSet<&'g str>,
) -> Result<(&'g str, btree_set::Iter<'g, String>), SchedulerError> {
    if !visiting.insert(id) {
        return Err(SchedulerError::CircularDependency {
            task_id: id.to_string(),
        });
    }
    let node = graph
        .nodes
        .get(id)
        .ok_or_else(|| SchedulerError::UnknownDependency {
            task_id: id.to_string(),
            dependency: id.to_string(),
        })?;
    Ok((id, node.dependencies.iter()))
}

/// Transitive dependencies of every task. `order` must be topological.
fn ancestors(order: &[String], graph: &TaskGraph) -> HashMap<String, HashSet<String>> {
    let mut ancestors: HashMap<String, HashSet<String>> = HashMap::with_capacity(order.len());
    for id in order {
        let mut set = HashSet::new();
        if let Some(node) = graph.get(id) {
            for dep in &node.dependencies {
                set.insert(dep.clone());
                if let Some(upstream) = ancestors.get(dep) {
                    set.extend(upstream.iter().cloned());
                }
            }
        }
        ancestors.insert(id.clone(), set);
    }
    ancestors
}

/// Partition `order` into groups of mutually independent tasks.
///
/// Each ungrouped id seeds a new group; later ungrouped ids join it when
/// they are neither an ancestor nor a descendant of any member. Groups come
/// out in an order where no task depends on a task of a later group.
pub fn group_parallel_tasks(order: &[String], graph: &TaskGraph) -> Vec<Vec<String>> {
    let ancestors = ancestors(order, graph);
    let related = |a: &str, b: &str| {
        ancestors.get(a).is_some_and(|s| s.contains(b)) || ancestors.get(b).is_some_and(|s| s.contains(a))
    };

    let mut grouped: HashSet<&str> = HashSet::with_capacity(order.len());
    let mut groups = Vec::new();
    for (i, seed) in order.iter().enumerate() {
        if grouped.contains(seed.as_str()) {
            continue;
        }
        grouped.insert(seed.as_str());
        let mut group = vec![seed.clone()];
        for candidate in &order[i + 1..] {
            if grouped.contains(candidate.as_str()) {
                continue;
            }
            if group.iter().all(|member| !related(member, candidate)) {
                grouped.insert(candidate.as_str());
                group.push(candidate.clone());
            }
        }
        groups.push(group);
    }
    groups
}

/// A validated, ordered and grouped plan for one objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub objective: Objective,
    pub graph: TaskGraph,
    pub order: Vec<String>,
    pub groups: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn build(objective: Objective, subtasks: &[SubtaskSpec]) -> Result<Self, SchedulerError> {
        let graph = build_dependency_graph(subtasks)?;
        let order = topological_sort(&graph)?;
        let groups = group_parallel_tasks(&order, &graph);
        let plan_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            plan_id = %plan_id,
            tasks = order.len(),
            groups = groups.len(),
            "execution plan built"
        );
        Ok(Self {
            plan_id,
            objective,
            graph,
            order,
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Vec<SubtaskSpec> {
        vec![
            SubtaskSpec::new("a", "root"),
            SubtaskSpec::new("b", "left").after(["a"]),
            SubtaskSpec::new("c", "right").after(["a"]),
            SubtaskSpec::new("d", "join").after(["b", "c"]),
        ]
    }

    #[test]
    fn test_dependents_are_derived() {
        let graph = build_dependency_graph(&diamond()).unwrap();
        let a = graph.get("a").unwrap();
        assert_eq!(a.dependents, BTreeSet::from(["b".to_string(), "c".to_string()]));
        assert!(graph.get("d").unwrap().dependents.is_empty());
    }

    #[test]
    fn test_diamond_groups() {
        let graph = build_dependency_graph(&diamond()).unwrap();
        let order = topological_sort(&graph).unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        let groups = group_parallel_tasks(&order, &graph);
        assert_eq!(groups, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_self_dependency_is_circular() {
        let result = build_dependency_graph(&[SubtaskSpec::new("loop", "x").after(["loop"])]);
        assert!(matches!(result, Err(SchedulerError::CircularDependency { task_id }) if task_id == "loop"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = build_dependency_graph(&[SubtaskSpec::new("a", "x").after(["ghost"])]);
        assert!(matches!(
            result,
            Err(SchedulerError::UnknownDependency { task_id, dependency }) if task_id == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = build_dependency_graph(&[SubtaskSpec::new("a", "x"), SubtaskSpec::new("a", "y")]);
        assert!(matches!(result, Err(SchedulerError::DuplicateTask(id)) if id == "a"));
    }

    #[test]
    fn test_transitive_relation_keeps_chain_apart() {
        // x -> y -> z: x and z share no direct edge but must not share a group.
        let subtasks = vec![
            SubtaskSpec::new("x", ""),
            SubtaskSpec::new("y", "").after(["x"]),
            SubtaskSpec::new("z", "").after(["y"]),
        ];
        let graph = build_dependency_graph(&subtasks).unwrap();
        let order = topological_sort(&graph).unwrap();
        assert_eq!(group_parallel_tasks(&order, &graph).len(), 3);
    }
}
