use anyhow::Result;
use flare_notify::logging::with_bootstrap_logging;
use flare_notify::{init_logging, load_config};
use flare_notify_worker::ApplicationBootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("NOTIFY_CONFIG").ok();
    // 配置决定日志格式，加载配置期间的告警先输出到 stderr
    let app_config = with_bootstrap_logging(|| load_config(config_path.as_deref()));
    init_logging(Some(&app_config.logging));

    ApplicationBootstrap::run(app_config).await
}
