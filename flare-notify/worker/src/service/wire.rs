//! Wire 风格的依赖注入模块
//!
//! 按依赖顺序构建存储、推送渠道、领域服务与消费者。

use std::sync::Arc;

use anyhow::Result;
use flare_notify::metrics::NotifyWorkerMetrics;
use tracing::info;

use crate::application::handlers::{NotifyCommandHandler, NotifyQueryHandler};
use crate::config::{NotifyWorkerConfig, PushProviderKind, StoreBackend};
use crate::domain::repository::{
    DeviceTokenRepository, DlqPublisher, NotificationRepository, PushProvider,
};
use crate::domain::service::{
    DeviceRegistry, NotificationFanoutService, NotificationLedger, PushDispatcher,
};
use crate::infrastructure::dlq_publisher::KafkaDlqPublisher;
use crate::infrastructure::kafka::{build_consumer, build_producer};
use crate::infrastructure::persistence::{
    InMemoryDeviceTokenStore, InMemoryNotificationStore, MongoDeviceTokenStore,
    MongoNotificationStore, PostgresDeviceTokenStore, PostgresNotificationStore, mongo_store,
    postgres_store,
};
use crate::infrastructure::push::{FcmPushProvider, NoopPushProvider};
use crate::interface::consumers::{NotifyWorkerConsumer, RecordProcessor};

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub config: Arc<NotifyWorkerConfig>,
    pub consumer: Arc<NotifyWorkerConsumer>,
    pub query_handler: Arc<NotifyQueryHandler>,
}

pub type StorePair = (
    Arc<dyn DeviceTokenRepository>,
    Arc<dyn NotificationRepository>,
);

/// 按配置构建设备与通知存储
pub async fn build_stores(backend: &StoreBackend) -> Result<StorePair> {
    match backend {
        StoreBackend::Mongo { url, database } => {
            let database = mongo_store::connect(url, database).await?;
            let devices = MongoDeviceTokenStore::new(&database).await?;
            let notifications = MongoNotificationStore::new(&database).await?;
            Ok((Arc::new(devices), Arc::new(notifications)))
        }
        StoreBackend::Postgres {
            url,
            max_connections,
            min_connections,
        } => {
            let pool = postgres_store::connect(url, *max_connections, *min_connections).await?;
            postgres_store::init_schema(&pool).await?;
            let pool = Arc::new(pool);
            Ok((
                Arc::new(PostgresDeviceTokenStore::new(pool.clone())),
                Arc::new(PostgresNotificationStore::new(pool)),
            ))
        }
        StoreBackend::Memory => {
            info!("using in-memory stores, data is not persisted");
            Ok((
                Arc::new(InMemoryDeviceTokenStore::new()),
                Arc::new(InMemoryNotificationStore::new()),
            ))
        }
    }
}

pub fn build_push_provider(kind: &PushProviderKind) -> Result<Arc<dyn PushProvider>> {
    Ok(match kind {
        PushProviderKind::Fcm(settings) => Arc::new(FcmPushProvider::new(settings.clone())?),
        PushProviderKind::Noop => NoopPushProvider::shared(),
    })
}

/// 构建领域服务，返回 (扇出服务, 设备注册表, 通知账本)
pub fn build_fanout_service(
    config: &NotifyWorkerConfig,
    stores: StorePair,
    provider: Arc<dyn PushProvider>,
    metrics: Arc<NotifyWorkerMetrics>,
) -> (
    Arc<NotificationFanoutService>,
    Arc<DeviceRegistry>,
    Arc<NotificationLedger>,
) {
    let (devices, notifications) = stores;
    let registry = Arc::new(DeviceRegistry::new(devices, config.device_ownership));
    let ledger = Arc::new(NotificationLedger::new(notifications));
    let dispatcher = Arc::new(PushDispatcher::new(provider));
    let fanout = Arc::new(NotificationFanoutService::new(
        registry.clone(),
        ledger.clone(),
        dispatcher,
        metrics,
    ));
    (fanout, registry, ledger)
}

/// 构建应用上下文
pub async fn initialize(config: Arc<NotifyWorkerConfig>) -> Result<ApplicationContext> {
    let metrics = Arc::new(NotifyWorkerMetrics::new());

    let stores = build_stores(&config.store_backend).await?;
    let provider = build_push_provider(&config.push_provider)?;
    info!(provider = provider.name(), "push provider ready");

    let (fanout, registry, ledger) =
        build_fanout_service(&config, stores, provider, metrics.clone());
    let command_handler = Arc::new(NotifyCommandHandler::new(fanout, registry));
    let query_handler = Arc::new(NotifyQueryHandler::new(ledger));

    let dlq_publisher: Arc<dyn DlqPublisher> =
        KafkaDlqPublisher::new(build_producer(&config)?, config.dlq_topic.clone());
    let processor = Arc::new(RecordProcessor::new(
        command_handler,
        dlq_publisher,
        metrics.clone(),
    ));

    let consumer = Arc::new(NotifyWorkerConsumer::new(
        config.clone(),
        build_consumer(&config)?,
        processor,
        metrics,
    )?);

    info!(
        service = %consumer.config().service_name,
        bootstrap = %consumer.config().kafka_bootstrap,
        group = %consumer.config().consumer_group,
        dlq_topic = %consumer.config().dlq_topic,
        "Notify Worker initialized"
    );

    Ok(ApplicationContext {
        config,
        consumer,
        query_handler,
    })
}
