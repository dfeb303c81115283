use crate::reporting::ErrorReporter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier assigned to an experiment by the experiment service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        ExperimentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An experiment as returned by the experiment service.
///
/// `sampling_percent` is the experiment's own allocation and is never
/// rewritten; the effective allocation after mutual exclusions is kept in
/// `target_sampling_percent`, which stays `None` until the priority of the
/// experiment has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: ExperimentId,
    /// Display name, unique within an application
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(default)]
    pub sampling_percent: f64,
    /// Priority tier; lower value means higher precedence
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub target_sampling_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Experiment {
    /// Creates an experiment with no priority and no target allocation.
    pub fn new(id: impl Into<String>, label: impl Into<String>, sampling_percent: f64) -> Self {
        Experiment {
            id: ExperimentId::new(id),
            label: label.into(),
            application_name: None,
            sampling_percent,
            priority: None,
            target_sampling_percent: None,
            state: None,
        }
    }

    /// Builder-style helper used when the priority is already known.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Maps an experiment label to its priority tier within an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRecord {
    pub label: String,
    pub priority: u32,
}

impl PriorityRecord {
    pub fn new(label: impl Into<String>, priority: u32) -> Self {
        PriorityRecord {
            label: label.into(),
            priority,
        }
    }
}

/// Priorities loaded for one application, joined to experiments by label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityTable {
    records: Vec<PriorityRecord>,
    by_label: HashMap<String, u32>,
}

impl PriorityTable {
    pub fn new(records: Vec<PriorityRecord>) -> Self {
        let mut by_label = HashMap::with_capacity(records.len());
        for record in &records {
            // First record wins when the service repeats a label
            by_label.entry(record.label.clone()).or_insert(record.priority);
        }
        PriorityTable { records, by_label }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Looks up the priority of an experiment label.
    pub fn priority_of(&self, label: &str) -> Option<u32> {
        self.by_label.get(label).copied()
    }

    /// Resolves the priority of `experiment` from this table.
    ///
    /// On a match the priority is set. Experiments that sample any traffic
    /// also get their target allocation reset to zero pending calculation. When the label is missing a page-level error
    /// is reported and `false` is returned; the experiment keeps whatever
    /// priority it arrived with.
    pub fn resolve(&self, experiment: &mut Experiment, reporter: &dyn ErrorReporter) -> bool {
        match self.priority_of(&experiment.label) {
            Some(priority) => {
                experiment.priority = Some(priority);
                if experiment.sampling_percent != 0.0 {
                    experiment.target_sampling_percent = Some(0.0);
                }
                true
            }
            None => {
                tracing::warn!(label = %experiment.label, "no priority found for experiment");
                reporter.page_error(
                    "Problem Getting Experiments",
                    &format!(
                        "There was a problem retrieving the priorities for the experiment with label, {}",
                        experiment.label
                    ),
                );
                false
            }
        }
    }
}

/// Sorts experiments alphabetically by label, ignoring case.
pub fn sort_by_label(experiments: &mut [Experiment]) {
    experiments.sort_by_cached_key(|experiment| experiment.label.to_lowercase());
}

/// Sorts experiments by ascending priority value.
///
/// The sort is stable and experiments without a resolved priority go last.
pub fn sort_by_priority(experiments: &mut [Experiment]) {
    experiments.sort_by_key(|experiment| (experiment.priority.is_none(), experiment.priority));
}
