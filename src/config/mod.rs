//! Flare Notify 配置模块
//!
//! 该模块提供了完整的应用程序配置管理功能，包括：
//! - 配置文件（单文件或目录）加载和解析
//! - 环境特定配置覆盖
//! - 通知服务及基础设施（Kafka / MongoDB / PostgreSQL）配置定义

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<NotifyAppConfig> = OnceLock::new();

/// Kafka 集群配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KafkaClusterConfig {
    /// Kafka 服务器地址列表
    pub bootstrap_servers: String,
    /// 客户端标识
    #[serde(default)]
    pub client_id: Option<String>,
    /// 超时时间（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 其他选项，原样透传给 librdkafka
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// PostgreSQL 数据库实例配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PostgresInstanceConfig {
    /// 数据库连接 URL
    pub url: String,
    /// 最大连接数
    #[serde(default)]
    pub max_connections: Option<u32>,
    /// 最小连接数
    #[serde(default)]
    pub min_connections: Option<u32>,
}

/// MongoDB 实例配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MongoInstanceConfig {
    /// MongoDB 连接 URL
    pub url: String,
    /// 数据库名称
    #[serde(default)]
    pub database: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 默认日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// 服务运行时配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceRuntimeConfig {
    /// 服务名称
    #[serde(default)]
    pub service_name: Option<String>,
}

/// FCM 推送渠道配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FcmProviderConfig {
    /// FCM 项目 ID
    #[serde(default)]
    pub project_id: Option<String>,
    /// 服务账号凭据文件路径（令牌自动刷新）
    #[serde(default)]
    pub credentials_file: Option<String>,
    /// 静态 OAuth2 访问令牌，不会刷新，仅用于调试
    #[serde(default)]
    pub access_token: Option<String>,
    /// API 端点（默认 https://fcm.googleapis.com）
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 单次请求超时（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// 通知扇出 Worker 服务配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyWorkerServiceConfig {
    /// 运行时配置
    #[serde(flatten)]
    pub runtime: ServiceRuntimeConfig,
    /// Kafka 配置名
    #[serde(default)]
    pub kafka: Option<String>,
    /// 消费者组
    #[serde(default)]
    pub consumer_group: Option<String>,
    /// 通知事件主题
    #[serde(default)]
    pub event_topic: Option<String>,
    /// 死信队列主题
    #[serde(default)]
    pub dlq_topic: Option<String>,
    /// 同时处理中的最大消息数
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// offset 提交间隔（毫秒）
    #[serde(default)]
    pub commit_interval_ms: Option<u64>,
    /// Prometheus 指标监听地址，如 0.0.0.0:9464；为空则不开启
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// 存储后端：mongo | postgres | memory
    #[serde(default)]
    pub store_backend: Option<String>,
    /// MongoDB 配置名
    #[serde(default)]
    pub mongodb: Option<String>,
    /// PostgreSQL 配置名
    #[serde(default)]
    pub postgres: Option<String>,
    /// 推送渠道：fcm | noop
    #[serde(default)]
    pub push_provider: Option<String>,
    /// FCM 渠道配置
    #[serde(default)]
    pub fcm: Option<FcmProviderConfig>,
    /// 设备归属策略：reassign | reject
    #[serde(default)]
    pub device_ownership: Option<String>,
    /// 停机时等待在途批次的最长时间（秒）
    #[serde(default)]
    pub shutdown_grace_seconds: Option<u64>,
}

/// 服务配置集合
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServicesConfig {
    /// 通知扇出 Worker 配置
    #[serde(default)]
    pub notify_worker: Option<NotifyWorkerServiceConfig>,
}

/// Flare Notify 应用配置主结构体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyAppConfig {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Kafka 配置映射
    #[serde(default)]
    pub kafka: HashMap<String, KafkaClusterConfig>,
    /// PostgreSQL 配置映射
    #[serde(default)]
    pub postgres: HashMap<String, PostgresInstanceConfig>,
    /// MongoDB 配置映射
    #[serde(default)]
    pub mongodb: HashMap<String, MongoInstanceConfig>,
    /// 服务配置
    #[serde(default)]
    pub services: ServicesConfig,
}

impl NotifyAppConfig {
    /// 获取 Kafka 配置
    pub fn kafka_profile(&self, name: &str) -> Option<&KafkaClusterConfig> {
        self.kafka.get(name)
    }

    /// 获取 PostgreSQL 配置
    pub fn postgres_profile(&self, name: &str) -> Option<&PostgresInstanceConfig> {
        self.postgres.get(name)
    }

    /// 获取 MongoDB 配置
    pub fn mongodb_profile(&self, name: &str) -> Option<&MongoInstanceConfig> {
        self.mongodb.get(name)
    }

    /// 获取通知扇出 Worker 服务配置
    pub fn notify_worker_service(&self) -> NotifyWorkerServiceConfig {
        self.services.notify_worker.clone().unwrap_or_default()
    }
}

/// 加载应用配置
///
/// `path` 为空时依次尝试 `config` 目录和 `config.toml` 文件，
/// 全部失败则回退到默认配置。
pub fn load_config(path: Option<&str>) -> &'static NotifyAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    APP_CONFIG.get_or_init(|| load_with_fallback(&candidates))
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> NotifyAppConfig {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err:#}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    NotifyAppConfig::default()
}

/// 从源（文件或目录）加载配置，并叠加环境特定配置
pub fn load_config_from_source(path: &Path) -> Result<NotifyAppConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    let mut merged = if metadata.is_dir() {
        load_directory_value(path)?
    } else {
        load_toml_value(path)?
    };

    if let Err(e) = ConfigManager::apply_environment_overlay(&mut merged) {
        warn!("failed to load environment config: {e:#}");
    }

    merged
        .try_into()
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// 从目录加载配置：base.toml + shared/ + services/ + overrides/
fn load_directory_value(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置（按文件名排序）
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 深度合并：表逐键合并，其他值直接覆盖
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}
