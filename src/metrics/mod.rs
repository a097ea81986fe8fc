//! # Prometheus 指标收集模块
//!
//! 为通知扇出服务提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 通知扇出 Worker 指标
pub struct NotifyWorkerMetrics {
    /// 处理的事件总数（按结果：success / bad_input / store_unavailable / delivery_unavailable）
    pub events_processed_total: IntCounterVec,
    /// 各阶段失败次数（register / persist / load_tokens / dispatch）
    pub stage_failure_total: IntCounterVec,
    /// 单设备推送结果（delivered / failed / invalid_token）
    pub push_delivery_total: IntCounterVec,
    /// 部分失败的扇出次数
    pub partial_fanout_total: IntCounter,
    /// 设备被重新归属次数
    pub device_reassigned_total: IntCounter,
    /// 死信队列消息数
    pub dlq_messages_total: IntCounterVec,
    /// 分区回退重投递次数
    pub redelivery_total: IntCounter,
    /// 单事件处理耗时（秒）
    pub pipeline_duration_seconds: Histogram,
    /// 单次扇出的设备数
    pub fanout_tokens: Histogram,
    /// 正在处理中的消息数
    pub in_flight_records: IntGauge,
}

impl NotifyWorkerMetrics {
    pub fn new() -> Self {
        let events_processed_total = IntCounterVec::new(
            Opts::new(
                "notify_events_processed_total",
                "Total number of notification events processed",
            ),
            &["outcome"],
        )
        .expect("Failed to create notify_events_processed_total metric");

        let stage_failure_total = IntCounterVec::new(
            Opts::new(
                "notify_stage_failure_total",
                "Total number of pipeline stage failures",
            ),
            &["stage"],
        )
        .expect("Failed to create notify_stage_failure_total metric");

        let push_delivery_total = IntCounterVec::new(
            Opts::new(
                "notify_push_delivery_total",
                "Per-device push delivery results",
            ),
            &["result"],
        )
        .expect("Failed to create notify_push_delivery_total metric");

        let partial_fanout_total = IntCounter::new(
            "notify_partial_fanout_total",
            "Total number of fan-outs where some devices failed",
        )
        .expect("Failed to create notify_partial_fanout_total metric");

        let device_reassigned_total = IntCounter::new(
            "notify_device_reassigned_total",
            "Total number of devices moved to a different user",
        )
        .expect("Failed to create notify_device_reassigned_total metric");

        let dlq_messages_total = IntCounterVec::new(
            Opts::new(
                "notify_dlq_messages_total",
                "Total number of events sent to the dead letter queue",
            ),
            &["error_code"],
        )
        .expect("Failed to create notify_dlq_messages_total metric");

        let redelivery_total = IntCounter::new(
            "notify_redelivery_total",
            "Total number of partition rewinds for redelivery",
        )
        .expect("Failed to create notify_redelivery_total metric");

        let pipeline_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "notify_pipeline_duration_seconds",
                "Notification pipeline duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("Failed to create notify_pipeline_duration_seconds metric");

        let fanout_tokens = Histogram::with_opts(
            HistogramOpts::new(
                "notify_fanout_tokens",
                "Number of device tokens per fan-out",
            )
            .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0]),
        )
        .expect("Failed to create notify_fanout_tokens metric");

        let in_flight_records = IntGauge::new(
            "notify_in_flight_records",
            "Number of consumed records currently being processed",
        )
        .expect("Failed to create notify_in_flight_records metric");

        // 注册指标，忽略重复注册错误（测试中会多次创建）
        let _ = REGISTRY.register(Box::new(events_processed_total.clone()));
        let _ = REGISTRY.register(Box::new(stage_failure_total.clone()));
        let _ = REGISTRY.register(Box::new(push_delivery_total.clone()));
        let _ = REGISTRY.register(Box::new(partial_fanout_total.clone()));
        let _ = REGISTRY.register(Box::new(device_reassigned_total.clone()));
        let _ = REGISTRY.register(Box::new(dlq_messages_total.clone()));
        let _ = REGISTRY.register(Box::new(redelivery_total.clone()));
        let _ = REGISTRY.register(Box::new(pipeline_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(fanout_tokens.clone()));
        let _ = REGISTRY.register(Box::new(in_flight_records.clone()));

        Self {
            events_processed_total,
            stage_failure_total,
            push_delivery_total,
            partial_fanout_total,
            device_reassigned_total,
            dlq_messages_total,
            redelivery_total,
            pipeline_duration_seconds,
            fanout_tokens,
            in_flight_records,
        }
    }
}

impl Default for NotifyWorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let _metrics = NotifyWorkerMetrics::new();

        let text = gather_metrics();
        assert!(text.contains("notify_pipeline_duration_seconds"));
        assert!(text.contains("notify_redelivery_total"));
    }

    #[test]
    fn test_instances_have_independent_counters() {
        let a = NotifyWorkerMetrics::new();
        let b = NotifyWorkerMetrics::new();
        a.redelivery_total.inc();
        assert_eq!(a.redelivery_total.get(), 1);
        assert_eq!(b.redelivery_total.get(), 0);
    }
}
