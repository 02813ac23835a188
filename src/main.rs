//! Tint 网关入口
//!
//! 加载配置、初始化日志、启动 WebSocket 网关，Ctrl-C 退出。

use std::path::PathBuf;

use anyhow::Context;
use tint::config::load_config;
use tint::gateway::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    tint::observability::init(&config.log.level);

    let hub = Hub::new(config);
    let addr = hub
        .start()
        .await
        .map_err(anyhow::Error::msg)
        .context("Failed to start gateway")?;

    tracing::info!(%addr, "tint gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    hub.stop();

    Ok(())
}
