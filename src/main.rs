use anyhow::Context;
use tracing::{info, warn};

use emr_integration::activity_log;
use emr_integration::config::{Config, EnvSecretSource};
use emr_integration::emr::{self, EmrIntegrationService};
use emr_integration::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = activity_log::init_logging() {
        activity_log::init_console_logging();
        warn!("File logging unavailable, using console only: {}", e);
    }

    let config = Config::load().context("Failed to load gateway config")?;
    let service = EmrIntegrationService::from_config(&config, &EnvSecretSource)
        .context("Failed to configure EMR integration")?;
    let service = emr::init_service(service)?;

    let systems = service.systems();
    if systems.is_empty() {
        warn!("No EMR systems configured; every request will be rejected");
    }
    activity_log::log_app_start(env!("CARGO_PKG_VERSION"), &systems);

    server::serve(config.listen_addr, service).await?;
    info!("EMR gateway stopped");
    Ok(())
}
