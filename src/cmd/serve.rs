//! HTTP server and worker pool (`buildforge serve`).

use anyhow::Result;
use buildforge::config::Config;
use buildforge::runtime::Services;

pub async fn cmd_serve(config: Config) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    let services = Services::open(config)?;
    let keys = services.db.call(|db| db.list_provider_keys(None)).await?;
    if keys.is_empty() {
        tracing::warn!("No provider keys configured; builds will be refused until one is added");
    }
    buildforge::server::start_server(services).await
}
