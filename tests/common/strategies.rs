use proptest::prelude::*;
use std::time::Duration;
use tasker_flow::orchestration::{ErrorStrategy, WorkflowDefinition, WorkflowStep};
use tasker_flow::resilience::RetryPolicy;

/// Random DAG: step `i` may only depend on steps with a lower index
pub fn workflow_dag_strategy() -> impl Strategy<Value = WorkflowDefinition> {
    (1usize..12)
        .prop_flat_map(|size| {
            let edges = (0..size)
                .map(|i| prop::collection::vec(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>();
            (Just(size), edges)
        })
        .prop_map(|(size, edges)| {
            let mut definition = WorkflowDefinition::new("generated", ErrorStrategy::Continue);
            for (i, dependencies) in edges.into_iter().enumerate().take(size) {
                let dependencies: Vec<String> = dependencies
                    .into_iter()
                    .filter(|d| *d < i)
                    .map(|d| format!("step_{d}"))
                    .collect();
                definition = definition
                    .with_step(WorkflowStep::new(format!("step_{i}"), "worker").depends_on(dependencies));
            }
            definition
        })
}

/// Valid retry policies with jitter toggled randomly
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..10, 1u64..500, 1u64..60_000, 1.0f64..4.0, any::<bool>()).prop_map(
        |(max_attempts, base_ms, extra_ms, multiplier, jitter)| {
            RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_delays(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(base_ms + extra_ms),
                )
                .with_multiplier(multiplier)
                .with_jitter(jitter)
        },
    )
}
