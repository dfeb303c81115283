//! Mutual-exclusion closure
//!
//! Mutual exclusion is a symmetric relation, but the service only answers
//! "which experiments exclude this one", so the full set of related
//! experiments has to be discovered by traversal. The traversal is an
//! explicit worklist: every discovered label is fetched exactly once, the
//! fetches run concurrently, and the closure is complete when the worklist
//! is empty.

use crate::experiment::{sort_by_priority, Experiment, PriorityTable};
use crate::reporting::ErrorReporter;
use crate::service::{ExperimentService, ServiceError};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Undirected graph of mutually exclusive experiments, keyed by label.
#[derive(Debug, Clone)]
pub struct ExclusionGraph {
    graph: UnGraph<Experiment, ()>,
    label_to_index: HashMap<String, NodeIndex>,
    /// Exclusion lists exactly as fetched, per label
    fetched: BTreeMap<String, Vec<Experiment>>,
}

impl ExclusionGraph {
    /// Creates a graph containing only the primary experiment.
    pub fn new(primary: Experiment) -> Self {
        let mut graph = ExclusionGraph {
            graph: UnGraph::new_undirected(),
            label_to_index: HashMap::new(),
            fetched: BTreeMap::new(),
        };
        graph.add_experiment(primary);
        graph
    }

    /// Adds an experiment unless one with the same label is already present.
    ///
    /// Returns the node index and whether the experiment was inserted.
    pub fn add_experiment(&mut self, experiment: Experiment) -> (NodeIndex, bool) {
        if let Some(&index) = self.label_to_index.get(&experiment.label) {
            return (index, false);
        }
        let label = experiment.label.clone();
        let index = self.graph.add_node(experiment);
        self.label_to_index.insert(label, index);
        (index, true)
    }

    /// Records the fetched exclusion list of `label`, adding any experiments
    /// not seen before and an edge to each of them.
    pub fn record_exclusions(&mut self, label: &str, exclusive: &[Experiment]) {
        if let Some(&from) = self.label_to_index.get(label) {
            for experiment in exclusive {
                let (to, inserted) = self.add_experiment(experiment.clone());
                if inserted {
                    tracing::debug!(label = %experiment.label, "adding to related experiments");
                }
                if from != to {
                    self.graph.update_edge(from, to, ());
                }
            }
        }
        self.fetched.insert(label.to_string(), exclusive.to_vec());
    }

    /// Number of experiments in the closure.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of distinct exclusion pairs.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Gets an experiment by label.
    pub fn get(&self, label: &str) -> Option<&Experiment> {
        self.label_to_index
            .get(label)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Experiments mutually exclusive with `label`.
    pub fn exclusions_of(&self, label: &str) -> Vec<&Experiment> {
        match self.label_to_index.get(label) {
            Some(&index) => self
                .graph
                .neighbors(index)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All experiments of the closure ordered by priority.
    ///
    /// Ties keep discovery order; experiments without a priority go last.
    pub fn related(&self) -> Vec<Experiment> {
        let mut related: Vec<Experiment> = self
            .graph
            .node_indices()
            .filter_map(|index| self.graph.node_weight(index).cloned())
            .collect();
        sort_by_priority(&mut related);
        related
    }

    /// Exclusion lists as fetched, keyed by label.
    pub fn fetched_exclusions(&self) -> &BTreeMap<String, Vec<Experiment>> {
        &self.fetched
    }
}

async fn fetch_exclusions(
    service: &dyn ExperimentService,
    experiment: Experiment,
) -> (Experiment, Result<Vec<Experiment>, ServiceError>) {
    tracing::debug!(label = %experiment.label, "getting mutual exclusions");
    let result = service.mutual_exclusions(&experiment.id).await;
    (experiment, result)
}

/// Resolves the transitive closure of experiments mutually exclusive with
/// `primary`.
///
/// Every experiment that is discovered gets its priority resolved from
/// `priorities` before it is added to the graph. Each label is fetched at
/// most once, so cyclic exclusions terminate. The first failed fetch aborts
/// the traversal and drops the fetches still in flight.
pub async fn resolve_closure(
    service: &dyn ExperimentService,
    priorities: &PriorityTable,
    reporter: &dyn ErrorReporter,
    primary: Experiment,
) -> Result<ExclusionGraph, ServiceError> {
    let mut graph = ExclusionGraph::new(primary.clone());
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(primary.label.clone());

    let mut pending = FuturesUnordered::new();
    pending.push(fetch_exclusions(service, primary));

    while let Some((experiment, result)) = pending.next().await {
        let mut exclusive = result?;
        for next in exclusive.iter_mut() {
            priorities.resolve(next, reporter);
        }

        graph.record_exclusions(&experiment.label, &exclusive);

        for next in exclusive {
            if visited.insert(next.label.clone()) {
                pending.push(fetch_exclusions(service, next));
            }
        }
    }

    tracing::debug!(
        experiments = graph.len(),
        exclusions = graph.edge_count(),
        "processed all mutual exclusions"
    );

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::PriorityRecord;
    use crate::reporting::NoticeLog;
    use crate::service::{Endpoint, InMemoryExperimentService};

    fn experiment(id: &str, label: &str, sampling: f64) -> Experiment {
        Experiment::new(id, label, sampling)
    }

    fn table(records: &[(&str, u32)]) -> PriorityTable {
        PriorityTable::new(
            records
                .iter()
                .map(|(label, priority)| PriorityRecord::new(*label, *priority))
                .collect(),
        )
    }

    #[test]
    fn test_graph_deduplicates_by_label() {
        let mut graph = ExclusionGraph::new(experiment("a", "A", 0.1).with_priority(1));
        let b = experiment("b", "B", 0.2).with_priority(2);
        graph.record_exclusions("A", &[b.clone(), b.clone()]);
        graph.record_exclusions("B", &[experiment("a", "A", 0.1)]);

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.exclusions_of("A")[0].label, "B");
        assert_eq!(graph.exclusions_of("B")[0].label, "A");
        // The first instance of a label is kept
        assert_eq!(graph.get("A").unwrap().priority, Some(1));
    }

    #[test]
    fn test_related_sorted_by_priority() {
        let mut graph = ExclusionGraph::new(experiment("c", "C", 0.1).with_priority(3));
        graph.record_exclusions(
            "C",
            &[
                experiment("a", "A", 0.1).with_priority(1),
                experiment("x", "X", 0.1),
                experiment("b", "B", 0.1).with_priority(2),
            ],
        );
        let labels: Vec<String> = graph.related().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["A", "B", "C", "X"]);
    }

    #[tokio::test]
    async fn test_resolve_closure_single_experiment() {
        let service = InMemoryExperimentService::new();
        let log = NoticeLog::new();
        let priorities = table(&[("solo", 1)]);
        let primary = experiment("s", "solo", 0.3).with_priority(1);

        let graph = resolve_closure(&service, &priorities, &log, primary).await.unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.exclusions_of("solo").is_empty());
        assert_eq!(service.call_count(Endpoint::MutualExclusions, "s"), 1);
    }

    #[tokio::test]
    async fn test_resolve_closure_terminates_on_cycle() {
        let mut service = InMemoryExperimentService::new();
        let a = experiment("a", "A", 0.5);
        let b = experiment("b", "B", 0.4);
        let c = experiment("c", "C", 0.3);
        service.add_mutual_exclusion(&a, &b);
        service.add_mutual_exclusion(&b, &c);
        service.add_mutual_exclusion(&c, &a);

        let log = NoticeLog::new();
        let priorities = table(&[("A", 1), ("B", 2), ("C", 3)]);
        let graph = resolve_closure(&service, &priorities, &log, a.clone().with_priority(1))
            .await
            .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 3);
        for id in ["a", "b", "c"] {
            assert_eq!(service.call_count(Endpoint::MutualExclusions, id), 1);
        }
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_closure_reaches_transitive_experiments() {
        let mut service = InMemoryExperimentService::new();
        let a = experiment("a", "A", 0.5);
        let b = experiment("b", "B", 0.4);
        let c = experiment("c", "C", 0.3);
        service.add_mutual_exclusion(&a, &b);
        service.add_mutual_exclusion(&b, &c);

        let log = NoticeLog::new();
        let priorities = table(&[("A", 2), ("B", 3), ("C", 1)]);
        let graph = resolve_closure(&service, &priorities, &log, a.with_priority(2))
            .await
            .unwrap();

        let labels: Vec<String> = graph.related().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["C", "A", "B"]);
        assert!(graph.exclusions_of("A").iter().all(|e| e.label != "C"));
        assert_eq!(graph.fetched_exclusions().len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_closure_reports_unknown_priority() {
        let mut service = InMemoryExperimentService::new();
        let a = experiment("a", "A", 0.5);
        let b = experiment("b", "B", 0.4);
        service.add_mutual_exclusion(&a, &b);

        let log = NoticeLog::new();
        let priorities = table(&[("A", 1)]);
        let graph = resolve_closure(&service, &priorities, &log, a.with_priority(1))
            .await
            .unwrap();

        assert_eq!(graph.get("B").unwrap().priority, None);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_closure_fetch_failure() {
        let mut service = InMemoryExperimentService::new();
        service.fail(Endpoint::MutualExclusions);
        let log = NoticeLog::new();

        let result = resolve_closure(
            &service,
            &PriorityTable::default(),
            &log,
            experiment("a", "A", 0.5),
        )
        .await;
        assert!(matches!(result, Err(ServiceError::ApiError { status: 500, .. })));
    }
}
