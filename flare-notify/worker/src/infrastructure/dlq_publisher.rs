//! 死信队列发布器（基础设施层实现）

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::domain::model::DeadLetter;
use crate::domain::repository::DlqPublisher;

/// Kafka 死信队列发布器
pub struct KafkaDlqPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDlqPublisher {
    pub fn new(producer: FutureProducer, topic: String) -> Arc<Self> {
        Arc::new(Self { producer, topic })
    }
}

#[async_trait]
impl DlqPublisher for KafkaDlqPublisher {
    async fn publish_to_dlq(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_vec(letter).context("failed to serialize dead letter")?;

        let mut record = FutureRecord::to(&self.topic).payload(&payload);
        if let Some(key) = letter.key.as_deref() {
            record = record.key(key);
        }

        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok(_) => {
                info!(
                    source_partition = letter.source_partition,
                    source_offset = letter.source_offset,
                    error_code = %letter.error_code,
                    "event sent to DLQ"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    source_partition = letter.source_partition,
                    source_offset = letter.source_offset,
                    error = %e,
                    "failed to publish to DLQ"
                );
                Err(anyhow!("failed to publish to DLQ: {e}"))
            }
        }
    }
}

/// 只记录不发送；内存部署与测试使用
#[derive(Default)]
pub struct NoopDlqPublisher {
    published: Mutex<Vec<DeadLetter>>,
}

impl NoopDlqPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<DeadLetter> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl DlqPublisher for NoopDlqPublisher {
    async fn publish_to_dlq(&self, letter: &DeadLetter) -> Result<()> {
        info!(
            source_partition = letter.source_partition,
            source_offset = letter.source_offset,
            error = %letter.error,
            "noop DLQ publisher invoked"
        );
        self.published.lock().await.push(letter.clone());
        Ok(())
    }
}
