use crate::exclusions::ExclusionGraph;
use crate::experiment::Experiment;
use std::collections::HashMap;

/// Rounds a fraction to four decimal places.
pub fn round_fraction(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn outranks(candidate: Option<u32>, current: Option<u32>) -> bool {
    matches!((candidate, current), (Some(candidate), Some(current)) if candidate < current)
}

/// Computes the target sampling percentage of every experiment in the
/// closure.
///
/// Experiments are visited in priority order. The first one keeps its own
/// sampling percentage. Every other experiment gets its own sampling
/// percentage scaled by the share of traffic left over by the mutually
/// exclusive experiments with a strictly lower priority value. Targets are
/// rounded to four decimals before they feed into later experiments.
///
/// Returns the related experiments in priority order with
/// `target_sampling_percent` set.
pub fn calculate_targets(graph: &ExclusionGraph) -> Vec<Experiment> {
    let ordered = graph.related();
    let mut targets: HashMap<String, f64> = HashMap::with_capacity(ordered.len());
    let mut calculated = Vec::with_capacity(ordered.len());

    for (position, mut experiment) in ordered.into_iter().enumerate() {
        let target = if position == 0 {
            round_fraction(experiment.sampling_percent)
        } else {
            let reserved: f64 = graph
                .exclusions_of(&experiment.label)
                .into_iter()
                .filter(|other| outranks(other.priority, experiment.priority))
                .filter_map(|other| targets.get(&other.label))
                .sum();
            round_fraction(experiment.sampling_percent * (1.0 - reserved))
        };

        tracing::trace!(label = %experiment.label, target, "target sampling percent");
        targets.insert(experiment.label.clone(), target);
        experiment.target_sampling_percent = Some(target);
        calculated.push(experiment);
    }

    calculated
}
