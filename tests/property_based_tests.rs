mod common;

use common::strategies::*;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tasker_flow::error::ErrorKind;
use tasker_flow::orchestration::{DependencyGraph, ErrorStrategy, WorkflowDefinition, WorkflowStep};
use tasker_flow::resilience::{Classify, RetryExecutor, RetryPolicy};

#[derive(Debug, thiserror::Error)]
#[error("flaky dependency")]
struct Flaky;

impl Classify for Flaky {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

fn chain_with_back_edge(length: usize) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("ring", ErrorStrategy::Continue);
    for i in 0..length {
        let previous = (i + length - 1) % length;
        definition = definition.with_step(WorkflowStep::new(format!("s{i}"), "w").depends_on([format!("s{previous}")]));
    }
    definition
}

proptest! {
    /// Property: every generated DAG levels cleanly, dependencies strictly earlier
    #[test]
    fn dag_levels_respect_dependencies(definition in workflow_dag_strategy()) {
        let graph = DependencyGraph::build(&definition).unwrap();
        prop_assert_eq!(graph.step_count(), definition.steps.len());

        let level_of: HashMap<&str, usize> = graph
            .levels()
            .iter()
            .enumerate()
            .flat_map(|(level, ids)| ids.iter().map(move |id| (id.as_str(), level)))
            .collect();
        prop_assert_eq!(level_of.len(), definition.steps.len());

        for step in &definition.steps {
            let level = level_of[step.id.as_str()];
            let deepest_dependency = step.depends_on.iter().map(|d| level_of[d.as_str()]).max();
            match deepest_dependency {
                // Roots sit on level 0, everything else right after its deepest dependency
                None => prop_assert_eq!(level, 0),
                Some(deepest) => prop_assert_eq!(level, deepest + 1),
            }
        }
    }

    /// Property: transitive dependents never include the step itself in a DAG
    #[test]
    fn transitive_dependents_exclude_origin(definition in workflow_dag_strategy()) {
        let graph = DependencyGraph::build(&definition).unwrap();
        for step in &definition.steps {
            let dependents = graph.transitive_dependents(&step.id);
            prop_assert!(!dependents.contains(&step.id));
            for dependent in &dependents {
                prop_assert!(graph.level_of(dependent) > graph.level_of(&step.id));
            }
        }
    }

    /// Property: a ring of any length is rejected and every member is reported
    #[test]
    fn rings_are_rejected(length in 1usize..20) {
        let error = DependencyGraph::build(&chain_with_back_edge(length)).unwrap_err();
        prop_assert!(error.is_cyclic());
        if let tasker_flow::orchestration::WorkflowError::CyclicWorkflow { steps, .. } = error {
            prop_assert_eq!(steps.len(), length);
        }
    }

    /// Property: backoff starts at zero, never exceeds the cap and never shrinks
    #[test]
    fn backoff_is_bounded_and_monotonic(policy in retry_policy_strategy()) {
        // Delays go through f64 seconds, so allow sub-microsecond rounding
        let slack = Duration::from_micros(1);
        prop_assert_eq!(policy.base_delay_for_attempt(1), Duration::ZERO);
        let first_retry = policy.base_delay_for_attempt(2);
        prop_assert!(first_retry + slack >= policy.base_delay && first_retry <= policy.base_delay + slack);

        let mut previous = Duration::ZERO;
        for attempt in 2..40 {
            let delay = policy.base_delay_for_attempt(attempt);
            prop_assert!(delay <= policy.max_delay + slack);
            prop_assert!(delay + slack >= previous);
            previous = delay;

            let jittered = policy.delay_for_attempt(attempt);
            prop_assert!(jittered <= delay + slack);
            prop_assert!(jittered + slack >= delay / 2);
        }
    }

    /// Property: transient failures are retried exactly up to the attempt budget
    #[test]
    fn retry_attempts_match_budget(failures in 0u32..8, max_attempts in 1u32..6) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let policy = RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let result = runtime.block_on(RetryExecutor::new("proptest").execute_with_retry(&policy, |_attempt| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if call <= failures { Err(Flaky) } else { Ok(call) } }
        }));

        let expected_calls = (failures + 1).min(max_attempts);
        prop_assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
        match result {
            Ok(call) => {
                prop_assert!(failures < max_attempts);
                prop_assert_eq!(call, failures + 1);
            }
            Err(error) => {
                prop_assert!(failures >= max_attempts);
                prop_assert_eq!(error.attempts(), max_attempts);
            }
        }
    }
}
