//! Traffic Analysis API Server Binary
//!
//! Run with: `cargo run --bin traffic-analysis-server`

use traffic_analysis::rest_client::ClientConfig;
use traffic_analysis::{run_server, ServerConfig};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing is initialized in run_server(); RUST_LOG controls the level:
    //   RUST_LOG=traffic_analysis=debug cargo run --bin traffic-analysis-server

    let defaults = ServerConfig::default();
    let host = env_or("HOST", &defaults.host);
    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(defaults.port);
    let preferences_path = env_or("PREFERENCES_DB", &defaults.preferences_path);

    let mut client = ClientConfig::new(env_or("WASABI_URL", &defaults.client.base_url));
    if let (Ok(user), Ok(password)) = (std::env::var("WASABI_USER"), std::env::var("WASABI_PASSWORD")) {
        client = client.with_credentials(user, password);
    }
    if let Some(timeout) = std::env::var("REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        client.timeout_seconds = timeout;
    }

    let config = ServerConfig::new(host, port, preferences_path, client);

    println!("Starting Traffic Analysis API Server...");
    println!("   Address: http://{}", config.address());
    println!("   Experiment service: {}", config.client.base_url);
    println!("   Preferences: {}", config.preferences_path);
    println!();
    println!("Available endpoints:");
    println!("  GET    /health                        - Health check");
    println!("  POST   /sessions                      - Open a panel session");
    println!("  GET    /sessions/:id                  - Session state");
    println!("  DELETE /sessions/:id                  - Close a session");
    println!("  PUT    /sessions/:id/application      - Select application");
    println!("  POST   /sessions/:id/reload           - Reload experiments");
    println!("  POST   /sessions/:id/selection        - Select experiment");
    println!("  POST   /sessions/:id/refresh          - Refresh traffic table");
    println!("  DELETE /sessions/:id/notices          - Acknowledge notices");
    println!("  GET    /sessions/:id/table.csv        - Export table as CSV");
    println!("  GET    /sessions/:id/stream           - SSE stream");
    println!();

    run_server(config).await?;

    Ok(())
}
