//! 应用启动器 - 负责依赖注入和服务启动

use std::sync::Arc;

use anyhow::Result;
use flare_notify::NotifyAppConfig;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::NotifyWorkerConfig;
use crate::interface::metrics_http;
use crate::service::wire::{ApplicationContext, initialize};

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(app_config: &'static NotifyAppConfig) -> Result<()> {
        let context = Self::create_context(app_config).await?;
        Self::start_consumer(context).await
    }

    /// 创建应用上下文
    pub async fn create_context(app_config: &NotifyAppConfig) -> Result<ApplicationContext> {
        let worker_config = Arc::new(NotifyWorkerConfig::from_app_config(app_config)?);
        initialize(worker_config).await
    }

    /// 启动消费者与指标端点，收到停机信号后排空在途消息再退出
    pub async fn start_consumer(context: ApplicationContext) -> Result<()> {
        info!("Starting Notify Worker");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let metrics_task = match context.config.metrics_addr {
            Some(addr) => {
                let listener = metrics_http::bind(addr).await?;
                Some(tokio::spawn(metrics_http::serve(
                    listener,
                    shutdown_rx.clone(),
                )))
            }
            None => {
                info!("metrics endpoint disabled");
                None
            }
        };

        let signal_task = tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        let result = context.consumer.run(shutdown_rx).await;
        signal_task.abort();
        if let Some(task) = metrics_task {
            task.abort();
        }

        info!("Notify Worker stopped");
        result
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
