use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use flare_notify::config::NotifyAppConfig;

use crate::domain::model::DeviceOwnershipPolicy;
use crate::infrastructure::push::fcm::FcmSettings;

const DEFAULT_EVENT_TOPIC: &str = "notification.events";
const DEFAULT_DLQ_TOPIC: &str = "notification.events.dlq";

/// 存储后端
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo {
        url: String,
        database: String,
    },
    Postgres {
        url: String,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    },
    Memory,
}

/// 推送渠道
#[derive(Debug, Clone)]
pub enum PushProviderKind {
    Fcm(FcmSettings),
    Noop,
}

#[derive(Debug, Clone)]
pub struct NotifyWorkerConfig {
    pub service_name: String,
    pub kafka_bootstrap: String,
    pub kafka_client_id: String,
    pub kafka_timeout_ms: u64,
    pub kafka_options: HashMap<String, String>,
    pub consumer_group: String,
    pub event_topic: String,
    pub dlq_topic: String,
    pub max_in_flight: usize,
    pub commit_interval: Duration,
    pub metrics_addr: Option<SocketAddr>,
    pub store_backend: StoreBackend,
    pub push_provider: PushProviderKind,
    pub device_ownership: DeviceOwnershipPolicy,
    pub shutdown_grace: Duration,
}

impl NotifyWorkerConfig {
    pub fn from_app_config(app: &NotifyAppConfig) -> Result<Self> {
        Self::from_app_config_with_env(app, |key| env::var(key).ok())
    }

    /// 优先级：环境变量 > 服务配置 / profile > 默认值
    pub fn from_app_config_with_env<F>(app: &NotifyAppConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service = app.notify_worker_service();
        let service_name = service
            .runtime
            .service_name
            .clone()
            .unwrap_or_else(|| "flare-notify-worker".to_string());
        let kafka_name = service.kafka.as_deref().unwrap_or("notify");
        let kafka_profile = app.kafka_profile(kafka_name);

        let kafka_bootstrap = env("NOTIFY_WORKER_KAFKA_BOOTSTRAP")
            .or_else(|| kafka_profile.map(|cfg| cfg.bootstrap_servers.clone()))
            .unwrap_or_else(|| "localhost:9092".to_string());
        let kafka_client_id = kafka_profile
            .and_then(|cfg| cfg.client_id.clone())
            .unwrap_or_else(|| service_name.clone());
        let kafka_timeout_ms = kafka_profile
            .and_then(|cfg| cfg.timeout_ms)
            .unwrap_or(5000);
        let kafka_options = kafka_profile
            .map(|cfg| cfg.options.clone())
            .unwrap_or_default();

        let consumer_group = env("NOTIFY_WORKER_CONSUMER_GROUP")
            .or_else(|| service.consumer_group.clone())
            .unwrap_or_else(|| "notify-worker".to_string());

        let event_topic = env("NOTIFY_WORKER_EVENT_TOPIC")
            .or_else(|| service.event_topic.clone())
            .unwrap_or_else(|| DEFAULT_EVENT_TOPIC.to_string());

        let dlq_topic = env("NOTIFY_WORKER_DLQ_TOPIC")
            .or_else(|| service.dlq_topic.clone())
            .unwrap_or_else(|| DEFAULT_DLQ_TOPIC.to_string());

        let max_in_flight = parse_env(&env, "NOTIFY_WORKER_MAX_IN_FLIGHT")?
            .or(service.max_in_flight)
            .unwrap_or(100)
            .max(1);

        let commit_interval_ms = parse_env(&env, "NOTIFY_WORKER_COMMIT_INTERVAL_MS")?
            .or(service.commit_interval_ms)
            .unwrap_or(1000)
            .max(10);

        let metrics_addr = match parse_env::<_, SocketAddr>(&env, "NOTIFY_WORKER_METRICS_ADDR")? {
            Some(addr) => Some(addr),
            None => service
                .metrics_addr
                .as_deref()
                .filter(|raw| !raw.trim().is_empty())
                .map(|raw| {
                    raw.trim()
                        .parse::<SocketAddr>()
                        .map_err(|e| anyhow!("invalid metrics_addr {raw}: {e}"))
                })
                .transpose()?,
        };

        let backend_name = env("NOTIFY_WORKER_STORE_BACKEND")
            .or_else(|| service.store_backend.clone())
            .unwrap_or_else(|| "memory".to_string());
        let store_backend = match backend_name.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => {
                let profile_name = service.mongodb.as_deref().unwrap_or("notify");
                let profile = app.mongodb_profile(profile_name);
                let url = env("NOTIFY_WORKER_MONGO_URL")
                    .or_else(|| profile.map(|p| p.url.clone()))
                    .ok_or_else(|| anyhow!("mongo backend selected but no url configured"))?;
                let database = env("NOTIFY_WORKER_MONGO_DATABASE")
                    .or_else(|| profile.and_then(|p| p.database.clone()))
                    .unwrap_or_else(|| "flare_notify".to_string());
                StoreBackend::Mongo { url, database }
            }
            "postgres" | "postgresql" => {
                let profile_name = service.postgres.as_deref().unwrap_or("notify");
                let profile = app.postgres_profile(profile_name);
                let url = env("NOTIFY_WORKER_POSTGRES_URL")
                    .or_else(|| profile.map(|p| p.url.clone()))
                    .ok_or_else(|| anyhow!("postgres backend selected but no url configured"))?;
                StoreBackend::Postgres {
                    url,
                    max_connections: profile.and_then(|p| p.max_connections),
                    min_connections: profile.and_then(|p| p.min_connections),
                }
            }
            "memory" => StoreBackend::Memory,
            other => return Err(anyhow!("unknown store backend: {other}")),
        };

        let provider_name = env("NOTIFY_WORKER_PUSH_PROVIDER")
            .or_else(|| service.push_provider.clone())
            .unwrap_or_else(|| "noop".to_string());
        let push_provider = match provider_name.trim().to_ascii_lowercase().as_str() {
            "fcm" => {
                let fcm = service.fcm.clone().unwrap_or_default();
                let credentials_file = env("NOTIFY_WORKER_FCM_CREDENTIALS_FILE")
                    .or(fcm.credentials_file)
                    .filter(|v| !v.trim().is_empty());
                let access_token = env("NOTIFY_WORKER_FCM_ACCESS_TOKEN")
                    .or(fcm.access_token)
                    .filter(|v| !v.trim().is_empty());
                if credentials_file.is_none() && access_token.is_none() {
                    return Err(anyhow!(
                        "fcm provider selected but neither credentials_file nor access_token is configured"
                    ));
                }
                PushProviderKind::Fcm(FcmSettings {
                    project_id: env("NOTIFY_WORKER_FCM_PROJECT_ID").or(fcm.project_id),
                    credentials_file,
                    access_token,
                    endpoint: env("NOTIFY_WORKER_FCM_ENDPOINT").or(fcm.endpoint),
                    timeout_ms: fcm.timeout_ms,
                })
            }
            "noop" => PushProviderKind::Noop,
            other => return Err(anyhow!("unknown push provider: {other}")),
        };

        let device_ownership = env("NOTIFY_WORKER_DEVICE_OWNERSHIP")
            .or_else(|| service.device_ownership.clone())
            .map(|raw| DeviceOwnershipPolicy::from_str(&raw))
            .transpose()
            .map_err(|e| anyhow!(e))?
            .unwrap_or_default();

        let shutdown_grace_seconds = parse_env(&env, "NOTIFY_WORKER_SHUTDOWN_GRACE_SECONDS")?
            .or(service.shutdown_grace_seconds)
            .unwrap_or(30);

        Ok(Self {
            service_name,
            kafka_bootstrap,
            kafka_client_id,
            kafka_timeout_ms,
            kafka_options,
            consumer_group,
            event_topic,
            dlq_topic,
            max_in_flight,
            commit_interval: Duration::from_millis(commit_interval_ms),
            metrics_addr,
            store_backend,
            push_provider,
            device_ownership,
            shutdown_grace: Duration::from_secs(shutdown_grace_seconds),
        })
    }
}

fn parse_env<F, T>(env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid value for {key}: {e}"))
        })
        .transpose()
}
