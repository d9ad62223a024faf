// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! DAG builder for step dependencies
//!
//! Builds and validates the dependency graph of a pipeline definition,
//! ensuring a valid submission order and detecting cycles.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{PipestepError, PipestepResult};
use crate::pipeline::PipelineSpec;

/// Builder for step dependency DAGs
pub struct DagBuilder {
    graph: DiGraph<usize, ()>,
    label_to_index: BTreeMap<String, NodeIndex>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            label_to_index: BTreeMap::new(),
        }
    }

    /// Build a DAG from a definition
    pub fn build(spec: &PipelineSpec) -> PipestepResult<Self> {
        let mut builder = Self::new();

        for (idx, step) in spec.steps.iter().enumerate() {
            if builder.label_to_index.contains_key(&step.label) {
                return Err(PipestepError::DuplicateStep {
                    step: step.label.clone(),
                });
            }
            let node = builder.graph.add_node(idx);
            builder.label_to_index.insert(step.label.clone(), node);
        }

        for step in &spec.steps {
            let step_node = builder.label_to_index[&step.label];

            for dep_label in step.dependencies.values() {
                let dep_node = builder.label_to_index.get(dep_label).ok_or_else(|| {
                    PipestepError::UnresolvedDependency {
                        step: step.label.clone(),
                        dependency: dep_label.clone(),
                    }
                })?;

                if !builder.graph.contains_edge(*dep_node, step_node) {
                    builder.graph.add_edge(*dep_node, step_node, ());
                }
            }
        }

        builder.topological_order()?;
        Ok(builder)
    }

    fn label(&self, node: NodeIndex) -> &str {
        self.label_to_index
            .iter()
            .find(|(_, idx)| **idx == node)
            .map(|(label, _)| label.as_str())
            .unwrap_or_default()
    }

    /// Steps on a cycle through `start`
    fn find_cycle(&self, start: NodeIndex) -> Vec<String> {
        fn walk(
            dag: &DagBuilder,
            node: NodeIndex,
            start: NodeIndex,
            path: &mut Vec<NodeIndex>,
            seen: &mut HashSet<NodeIndex>,
        ) -> bool {
            for next in dag.graph.neighbors(node) {
                if next == start {
                    return true;
                }
                if seen.insert(next) {
                    path.push(next);
                    if walk(dag, next, start, path, seen) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut path = vec![start];
        walk(self, start, start, &mut path, &mut HashSet::new());
        path.push(start);
        path.into_iter().map(|n| self.label(n).to_string()).collect()
    }

    /// Step indices in submission order
    pub fn topological_order(&self) -> PipestepResult<Vec<usize>> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|cycle| PipestepError::DependencyCycle {
                steps: self.find_cycle(cycle.node_id()),
            })
    }

    /// Step labels in submission order
    pub fn topological_order_labels(&self) -> PipestepResult<Vec<String>> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.label(n).to_string()).collect())
            .map_err(|cycle| PipestepError::DependencyCycle {
                steps: self.find_cycle(cycle.node_id()),
            })
    }

    /// Steps that must be submitted before `label`
    pub fn dependencies(&self, label: &str) -> Option<Vec<String>> {
        let node = self.label_to_index.get(label)?;
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Incoming)
            .map(|n| self.label(n).to_string())
            .collect();
        deps.sort();
        Some(deps)
    }

    /// Steps waiting on `label`
    pub fn dependents(&self, label: &str) -> Option<Vec<String>> {
        let node = self.label_to_index.get(label)?;
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Outgoing)
            .map(|n| self.label(n).to_string())
            .collect();
        deps.sort();
        Some(deps)
    }

    /// Whether `a` depends (directly or transitively) on `b`
    pub fn depends_on(&self, a: &str, b: &str) -> bool {
        let (Some(node_a), Some(node_b)) = (self.label_to_index.get(a), self.label_to_index.get(b))
        else {
            return false;
        };
        petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.label(from), self.label(to)))
            .collect();
        edges.sort();
        edges
    }

    /// Mermaid diagram of the DAG
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for label in self.label_to_index.keys() {
            out.push_str(&format!("    {}[{}]\n", label, label));
        }
        for (from, to) in self.edges() {
            out.push_str(&format!("    {} --> {}\n", from, to));
        }
        out
    }

    /// DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.edges() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }
        for (label, node) in &self.label_to_index {
            if self.graph.neighbors_undirected(*node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", label));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Numbered submission order with kinds and dependencies
    pub fn to_text(&self, spec: &PipelineSpec) -> PipestepResult<String> {
        let order = self.topological_order()?;
        let targets = spec.effective_targets();
        let mut out = String::new();

        for (i, idx) in order.iter().enumerate() {
            let step = &spec.steps[*idx];
            let deps = self.dependencies(&step.label).unwrap_or_default();

            out.push_str(&format!("{}. {} ({})", i + 1, step.label, step.kind));
            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }
            if targets.contains(&step.label) {
                out.push_str(" *");
            }
            out.push('\n');
        }

        Ok(out)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepSpec;

    fn make_spec(steps: Vec<(&str, Vec<&str>)>) -> PipelineSpec {
        PipelineSpec {
            version: "1".into(),
            name: "test".into(),
            description: None,
            steps: steps
                .into_iter()
                .map(|(label, deps)| StepSpec {
                    label: label.into(),
                    kind: "shell".into(),
                    description: None,
                    dependencies: deps
                        .into_iter()
                        .map(|d| (format!("in_{}", d), d.to_string()))
                        .collect(),
                    resources: Default::default(),
                    params: serde_yaml::Value::Null,
                })
                .collect(),
            targets: vec![],
        }
    }

    #[test]
    fn test_linear_dag() {
        let spec = make_spec(vec![("c", vec!["b"]), ("b", vec!["a"]), ("a", vec![])]);

        let dag = DagBuilder::build(&spec).unwrap();
        assert_eq!(dag.topological_order_labels().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_dag() {
        let spec = make_spec(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["a"]),
            ("d", vec!["b", "c"]),
        ]);

        let dag = DagBuilder::build(&spec).unwrap();
        let order = dag.topological_order_labels().unwrap();

        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert_eq!(dag.dependencies("d").unwrap(), vec!["b", "c"]);
        assert_eq!(dag.dependents("a").unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_cycle_detection() {
        let spec = make_spec(vec![("a", vec!["b"]), ("b", vec!["a"])]);

        match DagBuilder::build(&spec) {
            Err(PipestepError::DependencyCycle { steps }) => {
                assert_eq!(steps.len(), 3);
                assert_eq!(steps.first(), steps.last());
            }
            other => panic!("Expected DependencyCycle, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unresolved_dependency() {
        let spec = make_spec(vec![("a", vec!["nonexistent"])]);

        assert!(matches!(
            DagBuilder::build(&spec),
            Err(PipestepError::UnresolvedDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_label() {
        let spec = make_spec(vec![("a", vec![]), ("a", vec![])]);

        assert!(matches!(
            DagBuilder::build(&spec),
            Err(PipestepError::DuplicateStep { .. })
        ));
    }

    #[test]
    fn test_depends_on_check() {
        let spec = make_spec(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])]);
        let dag = DagBuilder::build(&spec).unwrap();

        assert!(dag.depends_on("c", "a"));
        assert!(dag.depends_on("b", "a"));
        assert!(!dag.depends_on("a", "c"));
    }

    #[test]
    fn test_renderings() {
        let spec = make_spec(vec![("a", vec![]), ("b", vec!["a"]), ("lonely", vec![])]);
        let dag = DagBuilder::build(&spec).unwrap();

        assert!(dag.to_mermaid().contains("a --> b"));
        let dot = dag.to_dot();
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("\"lonely\";"));

        let text = dag.to_text(&spec).unwrap();
        assert!(text.contains("b (shell) [depends: a] *"));
    }
}
