//! Flare Notify 公共库
//!
//! 提供统一的配置加载、错误码、日志初始化与指标收集功能

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{
    ConfigManager, FcmProviderConfig, KafkaClusterConfig, LoggingConfig, MongoInstanceConfig,
    NotifyAppConfig, NotifyWorkerServiceConfig, PostgresInstanceConfig, ServiceRuntimeConfig,
    load_config,
};
pub use error::ErrorCode;
pub use logging::init_logging;
