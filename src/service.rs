use crate::application::ApplicationName;
use crate::experiment::{Experiment, ExperimentId, PriorityRecord};
use crate::traffic::{DateRange, TrafficResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Trait for the remote experiment service.
///
/// The panel only talks to experiments, priorities, mutual exclusions and
/// traffic through this trait, so it can be driven by the REST client in
/// production and by an in-memory service in tests.
#[async_trait]
pub trait ExperimentService: Send + Sync {
    /// Lists the application names the caller has access to.
    async fn applications(&self) -> Result<Vec<String>, ServiceError>;

    /// Retrieves the priority of every prioritized experiment of an application.
    async fn priorities(
        &self,
        application: &ApplicationName,
    ) -> Result<Vec<PriorityRecord>, ServiceError>;

    /// Retrieves the experiments of an application.
    async fn experiments(
        &self,
        application: &ApplicationName,
    ) -> Result<Vec<Experiment>, ServiceError>;

    /// Retrieves the experiments that are mutually exclusive with `experiment_id`.
    async fn mutual_exclusions(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<Experiment>, ServiceError>;

    /// Retrieves traffic statistics for an experiment over a date range.
    async fn traffic(
        &self,
        experiment_id: &ExperimentId,
        range: &DateRange,
    ) -> Result<TrafficResult, ServiceError>;
}

/// Errors that can occur when calling the experiment service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// HTTP client creation failed
    ClientCreation(String),
    /// The configured base URL cannot be used
    InvalidUrl(String),
    /// Network error occurred
    NetworkError(String),
    /// The service answered with a non-success status
    ApiError { status: u16, message: String },
    /// Failed to parse response data
    ParseError(String),
    /// The requested resource does not exist
    NotFound(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::ClientCreation(msg) => write!(f, "Client creation error: {}", msg),
            ServiceError::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),
            ServiceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ServiceError::ApiError { status, message } => {
                write!(f, "API error: HTTP {}: {}", status, message)
            }
            ServiceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ServiceError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Service operations, used to record calls and inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Applications,
    Priorities,
    Experiments,
    MutualExclusions,
    Traffic,
}

/// A call made against the in-memory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    pub endpoint: Endpoint,
    /// Application name or experiment id the call was made for
    pub key: String,
}

/// In-memory experiment service for testing.
///
/// Mutual exclusions are stored per experiment id and added symmetrically.
/// Every call is recorded so tests can assert on fan-out.
#[derive(Debug, Default)]
pub struct InMemoryExperimentService {
    applications: Vec<String>,
    priorities: HashMap<String, Vec<PriorityRecord>>,
    experiments: HashMap<String, Vec<Experiment>>,
    exclusions: HashMap<ExperimentId, Vec<Experiment>>,
    traffic: HashMap<ExperimentId, TrafficResult>,
    failing: HashSet<Endpoint>,
    calls: Mutex<Vec<ServiceCall>>,
}

impl InMemoryExperimentService {
    /// Creates a new empty in-memory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an accessible application.
    pub fn add_application(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.priorities.entry(name.clone()).or_default();
        self.experiments.entry(name.clone()).or_default();
        self.applications.push(name);
    }

    /// Adds an experiment to an application and records its priority.
    ///
    /// The stored experiment carries no priority, like the service payload.
    pub fn add_experiment(&mut self, application: &str, experiment: Experiment, priority: u32) {
        self.priorities
            .entry(application.to_string())
            .or_default()
            .push(PriorityRecord::new(experiment.label.clone(), priority));
        self.add_unprioritized_experiment(application, experiment);
    }

    /// Adds an experiment without a priority record.
    pub fn add_unprioritized_experiment(&mut self, application: &str, mut experiment: Experiment) {
        experiment.priority = None;
        experiment.target_sampling_percent = None;
        experiment.application_name = Some(application.to_string());
        self.experiments
            .entry(application.to_string())
            .or_default()
            .push(experiment);
    }

    /// Declares two experiments mutually exclusive.
    pub fn add_mutual_exclusion(&mut self, a: &Experiment, b: &Experiment) {
        let strip = |experiment: &Experiment| {
            let mut experiment = experiment.clone();
            experiment.priority = None;
            experiment.target_sampling_percent = None;
            experiment
        };
        self.exclusions
            .entry(a.id.clone())
            .or_default()
            .push(strip(b));
        self.exclusions
            .entry(b.id.clone())
            .or_default()
            .push(strip(a));
    }

    /// Sets the traffic result returned for an experiment.
    pub fn set_traffic(&mut self, experiment_id: &ExperimentId, result: TrafficResult) {
        self.traffic.insert(experiment_id.clone(), result);
    }

    /// Makes every call to `endpoint` fail with an HTTP 500.
    pub fn fail(&mut self, endpoint: Endpoint) {
        self.failing.insert(endpoint);
    }

    /// Returns all calls made so far, in order.
    pub fn calls(&self) -> Vec<ServiceCall> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of calls made to `endpoint` for `key`.
    pub fn call_count(&self, endpoint: Endpoint, key: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.endpoint == endpoint && call.key == key)
            .count()
    }

    fn record(&self, endpoint: Endpoint, key: &str) -> Result<(), ServiceError> {
        let call = ServiceCall {
            endpoint,
            key: key.to_string(),
        };
        match self.calls.lock() {
            Ok(mut guard) => guard.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }

        if self.failing.contains(&endpoint) {
            return Err(ServiceError::ApiError {
                status: 500,
                message: "Internal Server Error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentService for InMemoryExperimentService {
    async fn applications(&self) -> Result<Vec<String>, ServiceError> {
        self.record(Endpoint::Applications, "")?;
        Ok(self.applications.clone())
    }

    async fn priorities(
        &self,
        application: &ApplicationName,
    ) -> Result<Vec<PriorityRecord>, ServiceError> {
        self.record(Endpoint::Priorities, application.as_str())?;
        self.priorities
            .get(application.as_str())
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("application {}", application)))
    }

    async fn experiments(
        &self,
        application: &ApplicationName,
    ) -> Result<Vec<Experiment>, ServiceError> {
        self.record(Endpoint::Experiments, application.as_str())?;
        self.experiments
            .get(application.as_str())
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("application {}", application)))
    }

    async fn mutual_exclusions(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<Experiment>, ServiceError> {
        self.record(Endpoint::MutualExclusions, experiment_id.as_str())?;
        Ok(self
            .exclusions
            .get(experiment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn traffic(
        &self,
        experiment_id: &ExperimentId,
        range: &DateRange,
    ) -> Result<TrafficResult, ServiceError> {
        self.record(Endpoint::Traffic, experiment_id.as_str())?;
        if !range.is_valid() {
            return Err(ServiceError::ApiError {
                status: 400,
                message: "start date is after end date".to_string(),
            });
        }
        self.traffic
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("traffic for experiment {}", experiment_id)))
    }
}
