use log::{error, info};
use tokio::sync::watch;

pub fn format_map_key(prefix: &str, name: &str) -> String {
    format!("{}:{}", prefix, name)
}

/// Wait for Ctrl-C, then tell every background loop to stop
pub async fn forward_ctrl_c(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
    let _ = shutdown.send(true);
}
