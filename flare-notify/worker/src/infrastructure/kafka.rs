//! Kafka 客户端构建

use anyhow::{Context, Result};
use rdkafka::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::FutureProducer;

use crate::config::NotifyWorkerConfig;

fn base_client_config(config: &NotifyWorkerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.kafka_bootstrap)
        .set("client.id", &config.kafka_client_id)
        .set("client.dns.lookup", "use_all_dns_ips")
        .set("metadata.max.age.ms", "300000");
    // profile 中的额外选项最后写入，可覆盖上面的默认值
    for (key, value) in &config.kafka_options {
        client.set(key, value);
    }
    client
}

/// 手动提交 offset 的消费者；处理完成后才提交
pub fn build_consumer(config: &NotifyWorkerConfig) -> Result<StreamConsumer> {
    let mut client = base_client_config(config);
    client
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false");
    client
        .create()
        .with_context(|| format!("failed to create kafka consumer for {}", config.kafka_bootstrap))
}

pub fn build_producer(config: &NotifyWorkerConfig) -> Result<FutureProducer> {
    let mut client = base_client_config(config);
    client
        .set("message.timeout.ms", config.kafka_timeout_ms.to_string())
        .set("acks", "all")
        .set("enable.idempotence", "true");
    client
        .create()
        .with_context(|| format!("failed to create kafka producer for {}", config.kafka_bootstrap))
}
