//! Dependency-level scheduling for `dag` mode

use super::{ExecutionContext, StrategyExecutor};
use crate::error::{Result, StrategyError};
use crate::strategy::Step;
use futures::future::join_all;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Group steps into levels with Kahn's algorithm.
///
/// Every step is a node; an edge runs from each dependency to its dependent.
/// Level `n` holds the steps whose dependencies all sit in earlier levels,
/// in declared order. Fails with a circular dependency error if the graph
/// cannot be drained.
pub fn dependency_levels(steps: &[Step]) -> Result<Vec<Vec<String>>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let nodes: HashMap<&str, NodeIndex> = steps
        .iter()
        .map(|step| (step.name.as_str(), graph.add_node(step.name.as_str())))
        .collect();

    for step in steps {
        for dependency in &step.depends_on {
            match nodes.get(dependency.as_str()) {
                Some(&from) => {
                    graph.add_edge(from, nodes[step.name.as_str()], ());
                }
                None => warn!(
                    "Step '{}' depends on unknown step '{}', ignoring",
                    step.name, dependency
                ),
            }
        }
    }

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();

    let mut levels = Vec::new();
    let mut frontier: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|node| in_degree[node.index()] == 0)
        .collect();
    let mut drained = 0;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &node in &frontier {
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[dependent.index()] -= 1;
                if in_degree[dependent.index()] == 0 {
                    next.push(dependent);
                }
            }
        }
        drained += frontier.len();
        next.sort();
        next.dedup();
        levels.push(frontier.iter().map(|&node| graph[node].to_string()).collect());
        frontier = next;
    }

    if drained < graph.node_count() {
        let steps = graph
            .node_indices()
            .filter(|node| in_degree[node.index()] > 0)
            .map(|node| graph[node].to_string())
            .collect();
        return Err(StrategyError::CircularDependency {
            operation: "dag".to_string(),
            steps,
        });
    }

    Ok(levels)
}

impl StrategyExecutor {
    /// Run levels in order; steps within a level run concurrently on forks
    /// of the context, merged back in declared order
    pub(crate) async fn execute_dag(&self, context: &mut ExecutionContext) -> Result<()> {
        let levels = dependency_levels(&self.strategy.steps)?;
        info!(
            "Executing {} steps in {} dependency levels",
            self.strategy.steps.len(),
            levels.len()
        );

        for (depth, level) in levels.iter().enumerate() {
            debug!("Level {}: {}", depth, level.join(", "));
            let steps: Vec<&Step> = level
                .iter()
                .filter_map(|name| self.strategy.step(name))
                .collect();

            let forks: Vec<(&Step, ExecutionContext)> =
                steps.into_iter().map(|step| (step, context.fork())).collect();
            let tasks = forks.into_iter().map(|(step, mut fork)| async move {
                let outcome = self.run_step(step, &mut fork).await;
                (fork, outcome)
            });
            let finished = join_all(tasks).await;

            let mut first_error = None;
            for (fork, outcome) in finished {
                context.merge(fork);
                if let Err(e) = outcome {
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends_on: &[&str]) -> Step {
        let mut step = Step::new(name, "noop");
        step.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
        step
    }

    #[test]
    fn test_diamond_levels() {
        let steps = vec![
            step("A", &[]),
            step("B", &["A"]),
            step("C", &["A"]),
            step("D", &["B", "C"]),
        ];
        let levels = dependency_levels(&steps).unwrap();
        assert_eq!(levels, vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
    }

    #[test]
    fn test_independent_steps_share_a_level() {
        let steps = vec![step("x", &[]), step("y", &[]), step("z", &["y"])];
        let levels = dependency_levels(&steps).unwrap();
        assert_eq!(levels, vec![vec!["x", "y"], vec!["z"]]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let steps = vec![step("A", &["B"]), step("B", &["A"]), step("C", &[])];
        match dependency_levels(&steps) {
            Err(StrategyError::CircularDependency { operation, steps }) => {
                assert_eq!(operation, "dag");
                assert_eq!(steps, vec!["A", "B"]);
            }
            other => panic!("expected circular dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_strategy_has_no_levels() {
        assert!(dependency_levels(&[]).unwrap().is_empty());
    }
}
