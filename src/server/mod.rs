//! REST API server with Server-Sent Events support
//!
//! Each session owns one traffic analysis panel. Clients drive the panel
//! through JSON endpoints and follow its state over an SSE stream.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, PanelSession, MAX_SESSIONS};

use crate::preferences::SqlitePreferenceStore;
use crate::rest_client::{ClientConfig, RestExperimentService};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server host address (default: "127.0.0.1")
    pub host: String,
    /// Server port (default: 3000)
    pub port: u16,
    /// Path to the SQLite preferences database
    pub preferences_path: String,
    /// Experiment service client settings
    pub client: ClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
            preferences_path: "preferences.db".to_string(),
            client: ClientConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration
    pub fn new(
        host: impl Into<String>,
        port: u16,
        preferences_path: impl Into<String>,
        client: ClientConfig,
    ) -> Self {
        ServerConfig {
            host: host.into(),
            port,
            preferences_path: preferences_path.into(),
            client,
        }
    }

    /// Address the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Runs the API server
///
/// Log output is controlled with `RUST_LOG` and defaults to `info`.
///
/// # Returns
/// Returns an error if the server fails to start or encounters a fatal error
///
/// # Example
/// ```rust,no_run
/// use traffic_analysis::server::{run_server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::default();
///     run_server(config).await?;
///     Ok(())
/// }
/// ```
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let service = RestExperimentService::with_config(config.client.clone())?;
    let preferences = SqlitePreferenceStore::new(&config.preferences_path)?;
    tracing::info!(
        base_url = %config.client.base_url,
        preferences = %config.preferences_path,
        "experiment service configured"
    );

    let state = Arc::new(AppState::new(Arc::new(service), Arc::new(preferences)));
    let app = routes::create_router(state);

    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "127.0.0.1:3000");
        assert_eq!(config.client.base_url, "http://localhost:8080/api/v1");
    }
}
