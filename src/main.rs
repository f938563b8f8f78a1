use std::path::PathBuf;

use gofw::config::ConfigManager;
use gofw::server::ServerSupervisor;

const DEFAULT_CONFIG_PATH: &str = "gofw.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let config_manager = ConfigManager::new(config_path.clone());
    let config = config_manager.load_or_default().await?;
    log::info!("{} {} configuration loaded from {}", gofw::NAME, gofw::VERSION, config_path.display());

    let supervisor = ServerSupervisor::new();
    supervisor.start(config).await?;
    if let Some(addr) = supervisor.local_addr() {
        log::info!("proxy listening on {}", addr);
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    supervisor.stop().await;

    Ok(())
}
