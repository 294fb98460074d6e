//! # Dependency Graph
//!
//! Validates a workflow definition and groups its steps into execution levels
//! by repeatedly extracting every step whose dependencies are all resolved.
//! Level `n + 1` only contains steps with at least one dependency in level `n`
//! or earlier, so running levels in order with a barrier between them never
//! starts a step before its dependencies are terminal.

use super::errors::{WorkflowError, WorkflowResult};
use super::types::WorkflowDefinition;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    levels: Vec<Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting empty, duplicate, dangling and cyclic definitions
    pub fn build(definition: &WorkflowDefinition) -> WorkflowResult<Self> {
        let workflow_id = definition.id.as_str();
        if definition.steps.is_empty() {
            return Err(WorkflowError::EmptyWorkflow {
                workflow_id: workflow_id.to_string(),
            });
        }

        let mut known = HashSet::with_capacity(definition.steps.len());
        for step in &definition.steps {
            if !known.insert(step.id.as_str()) {
                return Err(WorkflowError::DuplicateStep {
                    workflow_id: workflow_id.to_string(),
                    step_id: step.id.clone(),
                });
            }
        }

        let mut remaining: HashMap<&str, usize> = HashMap::with_capacity(definition.steps.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &definition.steps {
            for dependency in &step.depends_on {
                if !known.contains(dependency.as_str()) {
                    return Err(WorkflowError::unknown_dependency(
                        workflow_id,
                        &step.id,
                        dependency,
                    ));
                }
                if dependency == &step.id {
                    return Err(WorkflowError::cyclic(workflow_id, vec![step.id.clone()]));
                }
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(step.id.clone());
            }
            if let Some(input) = step.required_inputs.difference(&step.depends_on).next() {
                return Err(WorkflowError::InvalidRequiredInput {
                    workflow_id: workflow_id.to_string(),
                    step_id: step.id.clone(),
                    input: input.clone(),
                });
            }
            remaining.insert(step.id.as_str(), step.depends_on.len());
        }

        // Kahn's algorithm, one frontier per level, definition order within a level
        let mut levels = Vec::new();
        let mut frontier: Vec<&str> = definition
            .steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        let mut placed = 0;

        while !frontier.is_empty() {
            placed += frontier.len();
            let mut ready = HashSet::new();
            for step_id in &frontier {
                for dependent in dependents.get(*step_id).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(dependent.as_str());
                        }
                    }
                }
            }
            levels.push(frontier.iter().map(|s| s.to_string()).collect());
            frontier = definition
                .steps
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| ready.contains(id))
                .collect();
        }

        if placed < definition.steps.len() {
            let mut cyclic: Vec<String> = remaining
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            cyclic.sort();
            return Err(WorkflowError::cyclic(workflow_id, cyclic));
        }

        Ok(Self { levels, dependents })
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn step_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn level_of(&self, step_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|id| id == step_id))
    }

    /// Steps that depend on `step_id` directly
    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every step reachable from `step_id` along dependency edges
    pub fn transitive_dependents(&self, step_id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if found.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::types::{ErrorStrategy, WorkflowStep};

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new("diamond", ErrorStrategy::Continue)
            .with_step(WorkflowStep::new("a", "w"))
            .with_step(WorkflowStep::new("b", "w").depends_on(["a"]))
            .with_step(WorkflowStep::new("c", "w").depends_on(["a"]))
            .with_step(WorkflowStep::new("d", "w").depends_on(["b", "c"]))
    }

    #[test]
    fn test_diamond_levels() {
        let graph = DependencyGraph::build(&diamond()).unwrap();
        assert_eq!(
            graph.levels(),
            &[
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()]
            ]
        );
        assert_eq!(graph.level_of("d"), Some(2));
        assert_eq!(graph.step_count(), 4);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::build(&diamond()).unwrap();
        let from_c: Vec<_> = graph.transitive_dependents("c").into_iter().collect();
        assert_eq!(from_c, vec!["d"]);
        assert_eq!(graph.transitive_dependents("a").len(), 3);
        assert!(graph.transitive_dependents("d").is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let definition = WorkflowDefinition::new("loop", ErrorStrategy::Continue)
            .with_step(WorkflowStep::new("start", "w"))
            .with_step(WorkflowStep::new("x", "w").depends_on(["start", "z"]))
            .with_step(WorkflowStep::new("y", "w").depends_on(["x"]))
            .with_step(WorkflowStep::new("z", "w").depends_on(["y"]));

        let error = DependencyGraph::build(&definition).unwrap_err();
        assert_eq!(
            error,
            WorkflowError::cyclic("loop", vec!["x".into(), "y".into(), "z".into()])
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let definition = WorkflowDefinition::new("self", ErrorStrategy::Continue)
            .with_step(WorkflowStep::new("a", "w").depends_on(["a"]));
        assert!(DependencyGraph::build(&definition).unwrap_err().is_cyclic());
    }

    #[test]
    fn test_invalid_definitions() {
        let empty = WorkflowDefinition::new("empty", ErrorStrategy::Continue);
        assert!(matches!(
            DependencyGraph::build(&empty),
            Err(WorkflowError::EmptyWorkflow { .. })
        ));

        let dangling = WorkflowDefinition::new("dangling", ErrorStrategy::Continue)
            .with_step(WorkflowStep::new("a", "w").depends_on(["ghost"]));
        assert!(matches!(
            DependencyGraph::build(&dangling),
            Err(WorkflowError::UnknownDependency { .. })
        ));

        let duplicate = WorkflowDefinition::new("dup", ErrorStrategy::Continue)
            .with_step(WorkflowStep::new("a", "w"))
            .with_step(WorkflowStep::new("a", "w"));
        assert!(matches!(
            DependencyGraph::build(&duplicate),
            Err(WorkflowError::DuplicateStep { .. })
        ));

        let mut bad_input = WorkflowStep::new("b", "w").depends_on(["a"]);
        bad_input.required_inputs.insert("c".to_string());
        let invalid = WorkflowDefinition::new("inputs", ErrorStrategy::Continue)
            .with_step(WorkflowStep::new("a", "w"))
            .with_step(bad_input);
        assert!(matches!(
            DependencyGraph::build(&invalid),
            Err(WorkflowError::InvalidRequiredInput { .. })
        ));
    }
}
