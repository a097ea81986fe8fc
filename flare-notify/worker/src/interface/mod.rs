//! 接口层（Kafka 消费运行时与指标端点）

pub mod consumers;
pub mod metrics_http;

pub use consumers::NotifyWorkerConsumer;
