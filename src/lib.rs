pub mod application;
pub mod experiment;
pub mod traffic;
pub mod reporting;
pub mod service;
pub mod rest_client;
pub mod exclusions;
pub mod targets;
pub mod table;
pub mod preferences;
pub mod panel;
pub mod server;


pub use application::{ApplicationName, ApplicationNameError};
pub use experiment::{Experiment, ExperimentId, PriorityRecord, PriorityTable};
pub use traffic::{AssignmentRatio, DateRange, TrafficResult};
pub use reporting::{ErrorReporter, Notice, NoticeKind, NoticeLog};
pub use service::{Endpoint, ExperimentService, InMemoryExperimentService, ServiceError};
pub use rest_client::{ClientConfig, RestExperimentService};
pub use exclusions::{resolve_closure, ExclusionGraph};
pub use targets::calculate_targets;
pub use table::TrafficTable;
pub use preferences::{InMemoryPreferenceStore, PreferenceError, PreferenceStore, SqlitePreferenceStore};
pub use panel::{PanelError, PanelPhase, PanelState, TrafficAnalysisPanel};
pub use server::{run_server, ApiError, AppState, ServerConfig};
