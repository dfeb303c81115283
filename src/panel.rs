//! Traffic analysis panel
//!
//! A panel loads the experiments of one application, and for a selected
//! experiment builds the traffic table, resolves the mutual-exclusion
//! closure and adds the target sampling percentages.
//!
//! State is a plain value (`PanelState`) held in a watch channel. Every
//! continuation after a fetch performs one atomic transition: it checks
//! that its epoch is still current, validates the phase change, and
//! replaces the state. Responses that belong to a superseded application
//! load or experiment selection are discarded.

use crate::application::{ApplicationName, ApplicationNameError};
use crate::exclusions::resolve_closure;
use crate::experiment::{sort_by_label, Experiment, PriorityTable};
use crate::preferences::PreferenceStore;
use crate::reporting::ErrorReporter;
use crate::service::{ExperimentService, ServiceError};
use crate::table::TrafficTable;
use crate::targets::calculate_targets;
use crate::traffic::DateRange;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const APPLICATIONS_FAILED: &str = "The list of applications could not be retrieved.";
pub const PRIORITIES_FAILED: &str = "The list of priorities could not be retrieved.";
pub const EXPERIMENTS_FAILED: &str = "The list of experiments could not be retrieved.";
pub const TRAFFIC_FAILED: &str = "The traffic data could not be retrieved.";
pub const EXCLUSIONS_FAILED: &str = "The mutual exclusions could not be retrieved.";

/// Phase of the current selection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelPhase {
    /// Nothing in flight
    Idle,
    /// Waiting for the traffic of the selected experiment
    LoadingSkeleton,
    /// Waiting for the mutual-exclusion closure
    ResolvingExclusions,
    /// Target percentages are in the table
    Calculated,
    /// The panel was closed; no further transitions
    Closed,
}

impl PanelPhase {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: PanelPhase) -> bool {
        use PanelPhase::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) | (_, Idle) | (_, LoadingSkeleton) => true,
            (LoadingSkeleton, ResolvingExclusions) => true,
            (ResolvingExclusions, Calculated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PanelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self {
            PanelPhase::Idle => "idle",
            PanelPhase::LoadingSkeleton => "loading_skeleton",
            PanelPhase::ResolvingExclusions => "resolving_exclusions",
            PanelPhase::Calculated => "calculated",
            PanelPhase::Closed => "closed",
        };
        write!(f, "{repr}")
    }
}

/// Snapshot of everything a panel shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelState {
    /// Application names the user can pick from
    pub applications: Vec<String>,
    pub selected_application: Option<ApplicationName>,
    /// Application whose experiments are loaded (or loading)
    pub current_application: Option<ApplicationName>,
    /// Experiments of the current application, sorted by label
    pub experiments: Vec<Experiment>,
    #[serde(skip)]
    pub priorities: PriorityTable,
    pub selected_experiment: Option<String>,
    pub range: DateRange,
    /// Closure of the selected experiment, in priority order
    pub related_experiments: Vec<Experiment>,
    /// Exclusion lists fetched during the last closure, keyed by label
    pub mutual_exclusions: BTreeMap<String, Vec<Experiment>>,
    pub table: Option<TrafficTable>,
    pub phase: PanelPhase,
    pub application_epoch: u64,
    pub selection_epoch: u64,
}

impl PanelState {
    fn new(range: DateRange) -> Self {
        PanelState {
            applications: Vec::new(),
            selected_application: None,
            current_application: None,
            experiments: Vec::new(),
            priorities: PriorityTable::default(),
            selected_experiment: None,
            range,
            related_experiments: Vec::new(),
            mutual_exclusions: BTreeMap::new(),
            table: None,
            phase: PanelPhase::Idle,
            application_epoch: 0,
            selection_epoch: 0,
        }
    }

    /// Labels of the loaded experiments, in display order.
    pub fn experiment_names(&self) -> Vec<String> {
        self.experiments
            .iter()
            .map(|experiment| experiment.label.clone())
            .collect()
    }

    fn transition(&mut self, next: PanelPhase) -> Result<(), PanelError> {
        if !self.phase.can_transition_to(next) {
            return Err(PanelError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Clears everything derived from the current application and starts
    /// new epochs so that in-flight responses are discarded.
    fn reset(&mut self) -> Result<(), PanelError> {
        self.transition(PanelPhase::Idle)?;
        self.application_epoch += 1;
        self.selection_epoch += 1;
        self.current_application = None;
        self.priorities = PriorityTable::default();
        self.experiments.clear();
        self.selected_experiment = None;
        self.related_experiments.clear();
        self.mutual_exclusions.clear();
        self.table = None;
        Ok(())
    }
}

/// Epochs captured when a load or selection cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cycle {
    application_epoch: u64,
    selection_epoch: Option<u64>,
}

impl Cycle {
    fn is_current(&self, state: &PanelState) -> bool {
        state.phase != PanelPhase::Closed
            && state.application_epoch == self.application_epoch
            && self
                .selection_epoch
                .map_or(true, |epoch| epoch == state.selection_epoch)
    }
}

/// Errors returned by panel operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelError {
    /// The application name is not valid
    InvalidApplication(ApplicationNameError),
    /// No experiment is selected
    NoExperimentSelected,
    /// The label does not belong to the loaded experiments
    UnknownExperiment(String),
    /// Start is after end
    InvalidDateRange,
    /// A remote fetch failed; `context` names what could not be retrieved
    Fetch {
        context: &'static str,
        source: ServiceError,
    },
    /// A newer load or selection started while this one was in flight
    Superseded,
    /// The phase change is not allowed by the state machine
    InvalidTransition { from: PanelPhase, to: PanelPhase },
    /// The panel was closed
    Closed,
}

impl fmt::Display for PanelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelError::InvalidApplication(err) => write!(f, "Invalid application: {}", err),
            PanelError::NoExperimentSelected => write!(f, "No experiment selected"),
            PanelError::UnknownExperiment(label) => write!(f, "Unknown experiment: {}", label),
            PanelError::InvalidDateRange => write!(f, "Start date must not be after end date"),
            PanelError::Fetch { context, source } => write!(f, "{} ({})", context, source),
            PanelError::Superseded => write!(f, "Superseded by a newer request"),
            PanelError::InvalidTransition { from, to } => {
                write!(f, "Invalid panel transition from {} to {}", from, to)
            }
            PanelError::Closed => write!(f, "Panel is closed"),
        }
    }
}

impl std::error::Error for PanelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PanelError::InvalidApplication(err) => Some(err),
            PanelError::Fetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ApplicationNameError> for PanelError {
    fn from(err: ApplicationNameError) -> Self {
        PanelError::InvalidApplication(err)
    }
}

/// Traffic analysis panel over an experiment service.
pub struct TrafficAnalysisPanel {
    service: Arc<dyn ExperimentService>,
    reporter: Arc<dyn ErrorReporter>,
    preferences: Arc<dyn PreferenceStore>,
    state: watch::Sender<PanelState>,
}

impl TrafficAnalysisPanel {
    /// Creates an idle panel with the default date window. Nothing is fetched.
    pub fn new(
        service: Arc<dyn ExperimentService>,
        reporter: Arc<dyn ErrorReporter>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self::with_range(service, reporter, preferences, DateRange::default_window())
    }

    /// Creates an idle panel with an explicit date window.
    pub fn with_range(
        service: Arc<dyn ExperimentService>,
        reporter: Arc<dyn ErrorReporter>,
        preferences: Arc<dyn PreferenceStore>,
        range: DateRange,
    ) -> Self {
        let (state, _) = watch::channel(PanelState::new(range));
        TrafficAnalysisPanel {
            service,
            reporter,
            preferences,
            state,
        }
    }

    /// Creates a panel and performs the initial load.
    ///
    /// With exactly one accessible application it is selected and its
    /// experiments are loaded; otherwise the remembered default application
    /// is loaded, if there is one. Failures are reported, not returned.
    pub async fn open(
        service: Arc<dyn ExperimentService>,
        reporter: Arc<dyn ErrorReporter>,
        preferences: Arc<dyn PreferenceStore>,
        range: DateRange,
    ) -> Self {
        let panel = Self::with_range(service, reporter, preferences, range);
        panel.initialise().await;
        panel
    }

    async fn initialise(&self) {
        let applications = match self.service.applications().await {
            Ok(applications) => applications,
            Err(err) => {
                self.reporter.global_error(&err, APPLICATIONS_FAILED);
                Vec::new()
            }
        };
        self.state
            .send_modify(|state| state.applications = applications.clone());

        let outcome = if let [only] = applications.as_slice() {
            info!(application = %only, "auto-selecting the only accessible application");
            self.select_application(only).await
        } else {
            match self.preferences.default_application() {
                Ok(Some(name)) => self.use_remembered_application(&name).await,
                Ok(None) => Ok(()),
                Err(err) => {
                    warn!(error = %err, "could not read the default application");
                    Ok(())
                }
            }
        };

        if let Err(err) = outcome {
            debug!(error = %err, "initial load did not complete");
        }
    }

    async fn use_remembered_application(&self, name: &str) -> Result<(), PanelError> {
        let application = ApplicationName::new(name)?;
        self.update(|state| {
            state.selected_application = Some(application);
            Ok(())
        })?;
        self.load_experiments(false).await
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> PanelState {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes; every transition publishes a new value.
    pub fn subscribe(&self) -> watch::Receiver<PanelState> {
        self.state.subscribe()
    }

    /// Labels of the loaded experiments, sorted case-insensitively.
    pub fn experiment_names(&self) -> Vec<String> {
        self.state.borrow().experiment_names()
    }

    /// Selects an application, remembers it as the default and loads its
    /// experiments. A blank name clears the selection.
    pub async fn select_application(&self, name: &str) -> Result<(), PanelError> {
        let application = if name.trim().is_empty() {
            None
        } else {
            Some(ApplicationName::new(name)?)
        };

        if let Some(application) = &application {
            if let Err(err) = self.preferences.set_default_application(application.as_str()) {
                warn!(error = %err, "could not remember the default application");
            }
        }

        self.update(|state| {
            state.selected_application = application;
            Ok(())
        })?;
        self.load_experiments(false).await
    }

    /// Loads priorities and experiments for the selected application.
    ///
    /// Does nothing if that application is already loaded and `force` is
    /// false. Without a selected application the derived state is reset.
    /// All derived state is reset before the first fetch is issued.
    pub async fn load_experiments(&self, force: bool) -> Result<(), PanelError> {
        let mut start: Result<Option<(ApplicationName, Cycle)>, PanelError> = Ok(None);
        self.state.send_if_modified(|state| {
            if state.phase == PanelPhase::Closed {
                start = Err(PanelError::Closed);
                return false;
            }
            match state.selected_application.clone() {
                Some(application)
                    if !force && state.current_application.as_ref() == Some(&application) =>
                {
                    false
                }
                selected => {
                    if let Err(err) = state.reset() {
                        start = Err(err);
                        return false;
                    }
                    if let Some(application) = selected {
                        state.current_application = Some(application.clone());
                        start = Ok(Some((
                            application,
                            Cycle {
                                application_epoch: state.application_epoch,
                                selection_epoch: None,
                            },
                        )));
                    }
                    true
                }
            }
        });

        let (application, cycle) = match start? {
            Some(started) => started,
            None => return Ok(()),
        };
        info!(application = %application, force, "loading experiments");

        let priorities = self.service.priorities(&application).await;
        self.ensure_current(cycle)?;
        let priorities = priorities.map_err(|err| self.fail_load(cycle, PRIORITIES_FAILED, err))?;
        self.apply(cycle, |state| {
            state.priorities = PriorityTable::new(priorities);
            Ok(())
        })?;

        let experiments = self.service.experiments(&application).await;
        self.ensure_current(cycle)?;
        let mut experiments =
            experiments.map_err(|err| self.fail_load(cycle, EXPERIMENTS_FAILED, err))?;
        sort_by_label(&mut experiments);

        debug!(application = %application, count = experiments.len(), "experiments loaded");
        self.apply(cycle, |state| {
            state.experiments = experiments;
            Ok(())
        })
    }

    /// Changes the date window used by the next selection or refresh.
    pub fn set_range(&self, range: DateRange) -> Result<(), PanelError> {
        if !range.is_valid() {
            return Err(PanelError::InvalidDateRange);
        }
        self.update(|state| {
            state.range = range;
            Ok(())
        })
    }

    /// Builds the traffic table for a loaded experiment.
    ///
    /// The skeleton is published as soon as the traffic arrives; the target
    /// row is added once the mutual-exclusion closure is complete. On a
    /// fetch failure the phase returns to idle and the table keeps what it
    /// had so far.
    pub async fn select_experiment(
        &self,
        label: &str,
        range: DateRange,
    ) -> Result<TrafficTable, PanelError> {
        if !range.is_valid() {
            return Err(PanelError::InvalidDateRange);
        }

        let reporter = &*self.reporter;
        let mut start: Result<(Experiment, PriorityTable, Cycle), PanelError> =
            Err(PanelError::UnknownExperiment(label.to_string()));
        self.state.send_if_modified(|state| {
            if state.phase == PanelPhase::Closed {
                start = Err(PanelError::Closed);
                return false;
            }
            let Some(found) = state.experiments.iter().find(|e| e.label == label) else {
                return false;
            };

            let mut next = state.clone();
            let mut primary = found.clone();
            if let Err(err) = next.transition(PanelPhase::LoadingSkeleton) {
                start = Err(err);
                return false;
            }
            next.priorities.resolve(&mut primary, reporter);
            next.selection_epoch += 1;
            next.selected_experiment = Some(label.to_string());
            next.range = range;
            next.related_experiments = vec![primary.clone()];
            next.mutual_exclusions.clear();
            next.table = None;

            start = Ok((
                primary,
                next.priorities.clone(),
                Cycle {
                    application_epoch: next.application_epoch,
                    selection_epoch: Some(next.selection_epoch),
                },
            ));
            *state = next;
            true
        });
        let (primary, priorities, cycle) = start?;
        info!(experiment = %primary.label, start = %range.start, end = %range.end, "selected experiment");

        let traffic = self.service.traffic(&primary.id, &range).await;
        self.ensure_current(cycle)?;
        let traffic = traffic.map_err(|err| self.fail_selection(cycle, TRAFFIC_FAILED, err))?;

        let skeleton = TrafficTable::skeleton(&traffic);
        self.apply(cycle, |state| {
            state.table = Some(skeleton.clone());
            state.transition(PanelPhase::ResolvingExclusions)
        })?;

        let closure = resolve_closure(&*self.service, &priorities, reporter, primary).await;
        self.ensure_current(cycle)?;
        let graph = closure.map_err(|err| self.fail_selection(cycle, EXCLUSIONS_FAILED, err))?;

        let related = calculate_targets(&graph);
        let table = skeleton.with_targets(&related);
        let mutual_exclusions = graph.fetched_exclusions().clone();
        self.apply(cycle, |state| {
            state.related_experiments = related;
            state.mutual_exclusions = mutual_exclusions;
            state.table = Some(table.clone());
            state.transition(PanelPhase::Calculated)
        })?;

        info!(experiments = graph.len(), "target sampling percentages calculated");
        Ok(table)
    }

    /// Re-runs the current selection with the current date window.
    pub async fn refresh(&self) -> Result<TrafficTable, PanelError> {
        let (label, range) = {
            let state = self.state.borrow();
            (state.selected_experiment.clone(), state.range)
        };
        let label = label.ok_or(PanelError::NoExperimentSelected)?;
        self.select_experiment(&label, range).await
    }

    /// Closes the panel. In-flight work is discarded and nothing is persisted.
    pub fn close(&self) {
        self.state.send_modify(|state| {
            if state.phase != PanelPhase::Closed {
                let range = state.range;
                let epochs = (state.application_epoch + 1, state.selection_epoch + 1);
                *state = PanelState::new(range);
                state.application_epoch = epochs.0;
                state.selection_epoch = epochs.1;
                state.phase = PanelPhase::Closed;
            }
        });
        debug!("panel closed");
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().phase == PanelPhase::Closed
    }

    fn ensure_current(&self, cycle: Cycle) -> Result<(), PanelError> {
        if cycle.is_current(&self.state.borrow()) {
            Ok(())
        } else {
            debug!("discarding a superseded response");
            Err(PanelError::Superseded)
        }
    }

    /// Applies `change` to a copy of the state and publishes it if `cycle`
    /// is still current and the change succeeds.
    fn apply<F>(&self, cycle: Cycle, change: F) -> Result<(), PanelError>
    where
        F: FnOnce(&mut PanelState) -> Result<(), PanelError>,
    {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if !cycle.is_current(state) {
                outcome = Err(PanelError::Superseded);
                return false;
            }
            let mut next = state.clone();
            match change(&mut next) {
                Ok(()) => {
                    *state = next;
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome
    }

    /// Applies `change` outside of any load or selection cycle.
    fn update<F>(&self, change: F) -> Result<(), PanelError>
    where
        F: FnOnce(&mut PanelState) -> Result<(), PanelError>,
    {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.phase == PanelPhase::Closed {
                outcome = Err(PanelError::Closed);
                return false;
            }
            let mut next = state.clone();
            match change(&mut next) {
                Ok(()) => {
                    *state = next;
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome
    }

    fn report_failure(&self, context: &'static str, err: ServiceError) -> PanelError {
        self.reporter.global_error(&err, context);
        PanelError::Fetch {
            context,
            source: err,
        }
    }

    /// Forgets the application being loaded so that selecting it again
    /// retries the fetch.
    fn fail_load(&self, cycle: Cycle, context: &'static str, err: ServiceError) -> PanelError {
        let error = self.report_failure(context, err);
        if let Err(apply_err) = self.apply(cycle, |state| {
            state.current_application = None;
            Ok(())
        }) {
            debug!(error = %apply_err, "load was superseded while failing");
        }
        error
    }

    fn fail_selection(&self, cycle: Cycle, context: &'static str, err: ServiceError) -> PanelError {
        let error = self.report_failure(context, err);
        if let Err(transition_err) = self.apply(cycle, |state| state.transition(PanelPhase::Idle)) {
            debug!(error = %transition_err, "selection was superseded while failing");
        }
        error
    }
}

impl fmt::Debug for TrafficAnalysisPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TrafficAnalysisPanel")
            .field("phase", &state.phase)
            .field("current_application", &state.current_application)
            .field("selected_experiment", &state.selected_experiment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::InMemoryPreferenceStore;
    use crate::reporting::{NoticeKind, NoticeLog};
    use crate::application::ApplicationName;
    use crate::experiment::{ExperimentId, PriorityRecord};
    use crate::service::{Endpoint, InMemoryExperimentService};
    use crate::table::TARGET_ROW;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use crate::traffic::{parse_date_time, AssignmentRatio, TrafficResult};

    fn range() -> DateRange {
        DateRange::new(
            parse_date_time("2024-01-02T00:00:00-0800").unwrap(),
            parse_date_time("2024-01-04T10:00:00-0800").unwrap(),
        )
    }

    fn traffic(labels: &[&str], priorities: &[u32], sampling: &[f64]) -> TrafficResult {
        TrafficResult {
            experiments: labels.iter().map(|l| l.to_string()).collect(),
            priorities: priorities.to_vec(),
            sampling_percentages: sampling.to_vec(),
            assignment_ratios: vec![AssignmentRatio {
                date: "2024-01-02".to_string(),
                values: sampling.to_vec(),
            }],
        }
    }

    /// QBO: checkout (p1, 0.5) excludes banner (p2, 0.4). CTG: one experiment.
    fn service() -> InMemoryExperimentService {
        let mut service = InMemoryExperimentService::new();
        service.add_application("QBO");
        service.add_application("CTG");
        let checkout = Experiment::new("c", "checkout", 0.5);
        let banner = Experiment::new("b", "banner", 0.4);
        service.add_experiment("QBO", checkout.clone(), 1);
        service.add_experiment("QBO", banner.clone(), 2);
        service.add_experiment("QBO", Experiment::new("a", "Alpha", 0.1), 3);
        service.add_mutual_exclusion(&checkout, &banner);
        service.set_traffic(&banner.id, traffic(&["checkout", "banner"], &[1, 2], &[0.5, 0.4]));
        service.set_traffic(&checkout.id, traffic(&["checkout", "banner"], &[1, 2], &[0.5, 0.4]));
        service.add_experiment("CTG", Experiment::new("t", "tax", 0.25), 1);
        service.set_traffic(&ExperimentId::new("t"), traffic(&["tax"], &[1], &[0.25]));
        service
    }

    fn panel_with(
        service: InMemoryExperimentService,
    ) -> (TrafficAnalysisPanel, Arc<InMemoryExperimentService>, Arc<NoticeLog>) {
        let service = Arc::new(service);
        let log = Arc::new(NoticeLog::new());
        let panel = TrafficAnalysisPanel::with_range(
            service.clone(),
            log.clone(),
            Arc::new(InMemoryPreferenceStore::new()),
            range(),
        );
        (panel, service, log)
    }

    #[test]
    fn test_phase_transitions() {
        use PanelPhase::*;
        assert!(Idle.can_transition_to(LoadingSkeleton));
        assert!(LoadingSkeleton.can_transition_to(ResolvingExclusions));
        assert!(ResolvingExclusions.can_transition_to(Calculated));
        assert!(Calculated.can_transition_to(LoadingSkeleton));
        assert!(Calculated.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Calculated));
        assert!(!Idle.can_transition_to(ResolvingExclusions));
        assert!(!Closed.can_transition_to(Idle));
    }

    #[tokio::test]
    async fn test_load_experiments_sorts_case_insensitively() {
        let (panel, _, log) = panel_with(service());
        panel.select_application("QBO").await.unwrap();

        assert_eq!(panel.experiment_names(), vec!["Alpha", "banner", "checkout"]);
        let state = panel.snapshot();
        assert_eq!(state.current_application.unwrap().as_str(), "QBO");
        assert_eq!(state.priorities.len(), 3);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_load_same_application_is_noop_unless_forced() {
        let (panel, service, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();
        panel.load_experiments(false).await.unwrap();
        assert_eq!(service.call_count(Endpoint::Priorities, "QBO"), 1);

        panel.load_experiments(true).await.unwrap();
        assert_eq!(service.call_count(Endpoint::Priorities, "QBO"), 2);
        assert_eq!(panel.experiment_names().len(), 3);
    }

    #[tokio::test]
    async fn test_blank_application_resets() {
        let (panel, _, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();
        panel.select_application("").await.unwrap();

        let state = panel.snapshot();
        assert!(state.experiments.is_empty());
        assert!(state.current_application.is_none());
        assert!(state.selected_application.is_none());
    }

    #[tokio::test]
    async fn test_priorities_failure_reports_named_list() {
        let mut failing = service();
        failing.fail(Endpoint::Priorities);
        let (panel, service, log) = panel_with(failing);

        let result = panel.select_application("QBO").await;
        assert!(matches!(
            result,
            Err(PanelError::Fetch { context: PRIORITIES_FAILED, .. })
        ));
        assert_eq!(log.notices()[0].title, PRIORITIES_FAILED);
        assert_eq!(service.call_count(Endpoint::Experiments, "QBO"), 0);
        let state = panel.snapshot();
        assert!(state.experiments.is_empty());
        assert!(state.current_application.is_none());

        // Selecting the same application again retries
        let _ = panel.select_application("QBO").await;
        assert_eq!(service.call_count(Endpoint::Priorities, "QBO"), 2);
    }

    #[tokio::test]
    async fn test_experiments_failure_reports_named_list() {
        let mut failing = service();
        failing.fail(Endpoint::Experiments);
        let (panel, _, log) = panel_with(failing);

        let result = panel.select_application("QBO").await;
        assert!(result.is_err());
        assert_eq!(log.notices()[0].title, EXPERIMENTS_FAILED);
    }

    #[tokio::test]
    async fn test_select_experiment_builds_table_with_targets() {
        let (panel, _, log) = panel_with(service());
        panel.select_application("QBO").await.unwrap();

        let table = panel.select_experiment("banner", range()).await.unwrap();
        assert_eq!(table.rows[0], vec!["Priority", "1", "2"]);
        assert_eq!(table.rows[1], vec!["Target %", "50.00%", "20.00%"]);
        assert_eq!(table.rows[2], vec!["Experiment %", "50.00%", "40.00%"]);

        let state = panel.snapshot();
        assert_eq!(state.phase, PanelPhase::Calculated);
        let related: Vec<&str> = state
            .related_experiments
            .iter()
            .map(|e| e.label.as_str())
            .collect();
        assert_eq!(related, vec!["checkout", "banner"]);
        assert_eq!(state.related_experiments[1].target_sampling_percent, Some(0.2));
        assert_eq!(state.mutual_exclusions.len(), 2);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_select_unknown_experiment() {
        let (panel, service, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();

        let result = panel.select_experiment("missing", range()).await;
        assert_eq!(result.unwrap_err(), PanelError::UnknownExperiment("missing".to_string()));
        assert!(service
            .calls()
            .iter()
            .all(|call| call.endpoint != Endpoint::Traffic));
    }

    #[tokio::test]
    async fn test_select_with_invalid_range() {
        let (panel, _, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();
        let backwards = DateRange::new(range().end, range().start);
        assert_eq!(
            panel.select_experiment("banner", backwards).await.unwrap_err(),
            PanelError::InvalidDateRange
        );
        assert_eq!(panel.set_range(backwards).unwrap_err(), PanelError::InvalidDateRange);
    }

    #[tokio::test]
    async fn test_traffic_failure_returns_to_idle() {
        let mut failing = service();
        failing.fail(Endpoint::Traffic);
        let (panel, _, log) = panel_with(failing);
        panel.select_application("QBO").await.unwrap();

        let result = panel.select_experiment("banner", range()).await;
        assert!(matches!(result, Err(PanelError::Fetch { context: TRAFFIC_FAILED, .. })));
        let state = panel.snapshot();
        assert_eq!(state.phase, PanelPhase::Idle);
        assert!(state.table.is_none());
        assert_eq!(log.notices()[0].kind, NoticeKind::Global);
    }

    #[tokio::test]
    async fn test_exclusion_failure_keeps_skeleton() {
        let mut failing = service();
        failing.fail(Endpoint::MutualExclusions);
        let (panel, _, log) = panel_with(failing);
        panel.select_application("QBO").await.unwrap();

        let result = panel.select_experiment("banner", range()).await;
        assert!(matches!(
            result,
            Err(PanelError::Fetch { context: EXCLUSIONS_FAILED, .. })
        ));
        let state = panel.snapshot();
        assert_eq!(state.phase, PanelPhase::Idle);
        let table = state.table.unwrap();
        assert!(!table.has_targets());
        assert_eq!(table.rows.len(), 3);
        assert_eq!(log.notices()[0].title, EXCLUSIONS_FAILED);
    }

    #[tokio::test]
    async fn test_refresh_reruns_selection() {
        let (panel, service, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();
        assert_eq!(panel.refresh().await.unwrap_err(), PanelError::NoExperimentSelected);

        panel.select_experiment("checkout", range()).await.unwrap();
        let table = panel.refresh().await.unwrap();
        assert!(table.has_targets());
        assert_eq!(service.call_count(Endpoint::Traffic, "c"), 2);
        assert_eq!(table.row(TARGET_ROW).unwrap()[0], "50.00%");
    }

    #[tokio::test]
    async fn test_application_change_resets_selection() {
        let (panel, _, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();
        panel.select_experiment("banner", range()).await.unwrap();

        panel.select_application("CTG").await.unwrap();
        let state = panel.snapshot();
        assert_eq!(state.experiment_names(), vec!["tax"]);
        assert!(state.related_experiments.is_empty());
        assert!(state.mutual_exclusions.is_empty());
        assert!(state.table.is_none());
        assert!(state.selected_experiment.is_none());
        assert_eq!(state.phase, PanelPhase::Idle);
    }

    #[tokio::test]
    async fn test_close_discards_state() {
        let (panel, _, _) = panel_with(service());
        panel.select_application("QBO").await.unwrap();
        panel.close();

        assert!(panel.is_closed());
        assert!(panel.snapshot().experiments.is_empty());
        assert_eq!(panel.load_experiments(true).await.unwrap_err(), PanelError::Closed);
        assert_eq!(
            panel.select_experiment("banner", range()).await.unwrap_err(),
            PanelError::Closed
        );
    }

    #[tokio::test]
    async fn test_open_auto_selects_single_application() {
        let mut single = InMemoryExperimentService::new();
        single.add_application("CTG");
        single.add_experiment("CTG", Experiment::new("t", "tax", 0.25), 1);
        let preferences = Arc::new(InMemoryPreferenceStore::new());

        let panel = TrafficAnalysisPanel::open(
            Arc::new(single),
            Arc::new(NoticeLog::new()),
            preferences.clone(),
            range(),
        )
        .await;

        assert_eq!(panel.experiment_names(), vec!["tax"]);
        assert_eq!(
            preferences.default_application().unwrap(),
            Some("CTG".to_string())
        );
    }

    #[tokio::test]
    async fn test_open_loads_remembered_application() {
        let panel = TrafficAnalysisPanel::open(
            Arc::new(service()),
            Arc::new(NoticeLog::new()),
            Arc::new(InMemoryPreferenceStore::with_default_application("QBO")),
            range(),
        )
        .await;

        let state = panel.snapshot();
        assert_eq!(state.applications, vec!["QBO", "CTG"]);
        assert_eq!(state.current_application.unwrap().as_str(), "QBO");
        assert_eq!(state.experiments.len(), 3);
    }

    #[tokio::test]
    async fn test_open_reports_application_list_failure() {
        let mut failing = service();
        failing.fail(Endpoint::Applications);
        let log = Arc::new(NoticeLog::new());

        let panel = TrafficAnalysisPanel::open(
            Arc::new(failing),
            log.clone(),
            Arc::new(InMemoryPreferenceStore::new()),
            range(),
        )
        .await;

        assert!(panel.snapshot().applications.is_empty());
        assert_eq!(log.notices()[0].title, APPLICATIONS_FAILED);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let (panel, _, _) = panel_with(service());
        let mut updates = panel.subscribe();
        panel.select_application("QBO").await.unwrap();

        assert!(updates.has_changed().unwrap());
        let state = updates.borrow_and_update().clone();
        assert_eq!(state.experiments.len(), 3);
        assert!(!updates.has_changed().unwrap());
    }

    /// Holds calls to one endpoint and key until the gate is opened.
    struct GatedService {
        inner: InMemoryExperimentService,
        endpoint: Endpoint,
        key: String,
        gate: Semaphore,
    }

    impl GatedService {
        fn new(inner: InMemoryExperimentService, endpoint: Endpoint, key: &str) -> Self {
            GatedService {
                inner,
                endpoint,
                key: key.to_string(),
                gate: Semaphore::new(0),
            }
        }

        async fn wait(&self, endpoint: Endpoint, key: &str) -> Result<(), ServiceError> {
            if endpoint == self.endpoint && key == self.key {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|err| ServiceError::NetworkError(err.to_string()))?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExperimentService for GatedService {
        async fn applications(&self) -> Result<Vec<String>, ServiceError> {
            self.inner.applications().await
        }

        async fn priorities(
            &self,
            application: &ApplicationName,
        ) -> Result<Vec<PriorityRecord>, ServiceError> {
            self.wait(Endpoint::Priorities, application.as_str()).await?;
            self.inner.priorities(application).await
        }

        async fn experiments(
            &self,
            application: &ApplicationName,
        ) -> Result<Vec<Experiment>, ServiceError> {
            self.inner.experiments(application).await
        }

        async fn mutual_exclusions(
            &self,
            experiment_id: &ExperimentId,
        ) -> Result<Vec<Experiment>, ServiceError> {
            self.inner.mutual_exclusions(experiment_id).await
        }

        async fn traffic(
            &self,
            experiment_id: &ExperimentId,
            range: &DateRange,
        ) -> Result<TrafficResult, ServiceError> {
            self.wait(Endpoint::Traffic, experiment_id.as_str()).await?;
            self.inner.traffic(experiment_id, range).await
        }
    }

    fn gated_panel(endpoint: Endpoint, key: &str) -> (TrafficAnalysisPanel, Arc<GatedService>) {
        let service = Arc::new(GatedService::new(service(), endpoint, key));
        let panel = TrafficAnalysisPanel::with_range(
            service.clone(),
            Arc::new(NoticeLog::new()),
            Arc::new(InMemoryPreferenceStore::new()),
            range(),
        );
        (panel, service)
    }

    #[tokio::test]
    async fn test_state_is_reset_before_fetch_and_stale_load_is_discarded() {
        let (panel, service) = gated_panel(Endpoint::Priorities, "QBO");
        panel.select_application("CTG").await.unwrap();
        assert_eq!(panel.experiment_names(), vec!["tax"]);

        let (slow, ()) = tokio::join!(panel.select_application("QBO"), async {
            tokio::task::yield_now().await;

            // The QBO load is waiting for priorities; CTG data is already gone
            let pending = panel.snapshot();
            assert!(pending.experiments.is_empty());
            assert_eq!(pending.current_application.unwrap().as_str(), "QBO");

            panel.select_application("CTG").await.unwrap();
            service.gate.add_permits(1);
        });

        assert_eq!(slow.unwrap_err(), PanelError::Superseded);
        let state = panel.snapshot();
        assert_eq!(state.current_application.as_ref().unwrap().as_str(), "CTG");
        assert_eq!(state.experiment_names(), vec!["tax"]);
    }

    #[tokio::test]
    async fn test_stale_selection_is_discarded() {
        let (panel, service) = gated_panel(Endpoint::Traffic, "b");
        panel.select_application("QBO").await.unwrap();

        let (slow, ()) = tokio::join!(panel.select_experiment("banner", range()), async {
            tokio::task::yield_now().await;
            assert_eq!(panel.snapshot().phase, PanelPhase::LoadingSkeleton);

            panel.select_experiment("checkout", range()).await.unwrap();
            service.gate.add_permits(1);
        });

        assert_eq!(slow.unwrap_err(), PanelError::Superseded);
        let state = panel.snapshot();
        assert_eq!(state.selected_experiment.as_deref(), Some("checkout"));
        assert_eq!(state.phase, PanelPhase::Calculated);
        assert_eq!(state.related_experiments[0].label, "checkout");
    }
}
