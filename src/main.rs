use qrgate::{config::ServiceConfig, init_service, observability::init_tracing};
use std::env;
use std::process;

#[tokio::main]
async fn main() {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/qrgate.yaml".to_string());

    // Load configuration (file is optional, QRGATE__* variables override it)
    let config = match ServiceConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: qrgate [config_file]");
            process::exit(1);
        }
    };

    init_tracing(&config.logging);

    if let Err(e) = init_service(config).await {
        eprintln!("qrgate error: {}", e);
        process::exit(1);
    }
}
