//! Hub server binary.

use boardsync_hub::config::HubConfig;
use boardsync_hub::server::Hub;
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = HubConfig::from_env();
    info!("starting board sync hub on {}", config.bind_addr);

    let hub = Hub::connect(config).await;
    hub.run().await
}
