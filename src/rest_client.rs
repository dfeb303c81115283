use crate::application::ApplicationName;
use crate::experiment::{Experiment, ExperimentId, PriorityRecord};
use crate::service::{ExperimentService, ServiceError};
use crate::traffic::{DateRange, TrafficResult};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the REST experiment service client
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the API, e.g. `http://localhost:8080/api/v1`
    pub base_url: String,
    /// Basic-auth user (no authentication when `None`)
    pub username: Option<String>,
    /// Basic-auth password
    pub password: Option<String>,
    /// Request timeout in seconds (default: 30)
    pub timeout_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "http://localhost:8080/api/v1".to_string(),
            username: None,
            password: None,
            timeout_seconds: 30,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            ..ClientConfig::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Experiment service backed by the experimentation platform's REST API.
#[derive(Debug)]
pub struct RestExperimentService {
    client: Client,
    base_url: Url,
    config: ClientConfig,
}

impl RestExperimentService {
    /// Creates a new client with default configuration.
    pub fn new() -> Result<Self, ServiceError> {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a new client with custom configuration.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidUrl` if the base URL cannot carry path
    /// segments, or `ServiceError::ClientCreation` if the HTTP client fails
    /// to build.
    pub fn with_config(config: ClientConfig) -> Result<Self, ServiceError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ServiceError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::InvalidUrl(config.base_url.clone()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ServiceError::ClientCreation(e.to_string()))?;

        Ok(RestExperimentService {
            client,
            base_url,
            config,
        })
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds an endpoint URL below the base URL; each segment is
    /// percent-encoded, including any `/` it contains.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ServiceError::InvalidUrl(self.config.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ServiceError> {
        tracing::debug!(url = %url, "GET");

        let mut request = self.client.get(url.clone()).header(ACCEPT, "application/json");
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(url.path().to_string()));
        }
        if !status.is_success() {
            return Err(ServiceError::ApiError {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::ParseError(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| ServiceError::ParseError(e.to_string()))
    }
}

// Response envelopes. The platform wraps most lists in an object, but some
// deployments return bare arrays, so both shapes are accepted.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApplicationEntry {
    Named {
        #[serde(rename = "applicationName")]
        application_name: String,
    },
    Plain(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriorityList {
    Wrapped {
        #[serde(rename = "prioritizedExperiments")]
        prioritized_experiments: Vec<PriorityRecord>,
    },
    Bare(Vec<PriorityRecord>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExperimentList {
    Wrapped { experiments: Vec<Experiment> },
    Bare(Vec<Experiment>),
}

impl From<ApplicationEntry> for String {
    fn from(entry: ApplicationEntry) -> Self {
        match entry {
            ApplicationEntry::Named { application_name } => application_name,
            ApplicationEntry::Plain(name) => name,
        }
    }
}

impl From<PriorityList> for Vec<PriorityRecord> {
    fn from(list: PriorityList) -> Self {
        match list {
            PriorityList::Wrapped {
                prioritized_experiments,
            } => prioritized_experiments,
            PriorityList::Bare(records) => records,
        }
    }
}

impl From<ExperimentList> for Vec<Experiment> {
    fn from(list: ExperimentList) -> Self {
        match list {
            ExperimentList::Wrapped { experiments } => experiments,
            ExperimentList::Bare(experiments) => experiments,
        }
    }
}

#[async_trait]
impl ExperimentService for RestExperimentService {
    async fn applications(&self) -> Result<Vec<String>, ServiceError> {
        let url = self.endpoint(&["applications"])?;
        let entries: Vec<ApplicationEntry> = self.get_json(url).await?;
        Ok(entries.into_iter().map(String::from).collect())
    }

    async fn priorities(
        &self,
        application: &ApplicationName,
    ) -> Result<Vec<PriorityRecord>, ServiceError> {
        let url = self.endpoint(&["applications", application.as_str(), "priorities"])?;
        let list: PriorityList = self.get_json(url).await?;
        Ok(list.into())
    }

    async fn experiments(
        &self,
        application: &ApplicationName,
    ) -> Result<Vec<Experiment>, ServiceError> {
        let url = self.endpoint(&["applications", application.as_str(), "experiments"])?;
        let list: ExperimentList = self.get_json(url).await?;
        Ok(list.into())
    }

    async fn mutual_exclusions(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<Experiment>, ServiceError> {
        let mut url = self.endpoint(&["experiments", experiment_id.as_str(), "exclusions"])?;
        url.query_pairs_mut()
            .append_pair("showAll", "true")
            .append_pair("exclusive", "true");
        let list: ExperimentList = self.get_json(url).await?;
        Ok(list.into())
    }

    async fn traffic(
        &self,
        experiment_id: &ExperimentId,
        range: &DateRange,
    ) -> Result<TrafficResult, ServiceError> {
        let (start, end) = range.api_dates();
        let url = self.endpoint(&[
            "analytics",
            "experiments",
            experiment_id.as_str(),
            "assignments",
            "traffic",
            start.as_str(),
            end.as_str(),
        ])?;
        self.get_json(url).await
    }
}
