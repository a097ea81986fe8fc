//! Kafka 消费者实现
//!
//! 接收与处理解耦：消息到达即派发为独立任务，在途数量受 `max_in_flight` 限制；
//! 任务完成后记入 [`OffsetTracker`]，按 `commit_interval` 周期提交连续已确认前缀。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flare_notify::metrics::NotifyWorkerMetrics;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::NotifyWorkerConfig;
use crate::interface::consumers::ack_plan::{
    AckPlan, Admission, Disposition, OffsetTracker, RecordOutcome,
};
use crate::interface::consumers::in_flight::{catch_panic, drain, record_joined};
use crate::interface::consumers::processor::{InboundRecord, RecordProcessor};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
/// 回退后重新消费的第一条消息延迟处理，避免存储故障时空转
const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

pub struct NotifyWorkerConsumer {
    config: Arc<NotifyWorkerConfig>,
    consumer: StreamConsumer,
    processor: Arc<RecordProcessor>,
    metrics: Arc<NotifyWorkerMetrics>,
}

impl NotifyWorkerConsumer {
    pub fn new(
        config: Arc<NotifyWorkerConfig>,
        consumer: StreamConsumer,
        processor: Arc<RecordProcessor>,
        metrics: Arc<NotifyWorkerMetrics>,
    ) -> Result<Self> {
        consumer
            .subscribe(&[&config.event_topic])
            .with_context(|| format!("failed to subscribe to {}", config.event_topic))?;

        info!(
            bootstrap = %config.kafka_bootstrap,
            group = %config.consumer_group,
            event_topic = %config.event_topic,
            "Successfully subscribed to Kafka topic"
        );

        Ok(Self {
            config,
            consumer,
            processor,
            metrics,
        })
    }

    pub fn config(&self) -> &NotifyWorkerConfig {
        &self.config
    }

    /// 消费主循环，直到收到停机信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            max_in_flight = self.config.max_in_flight as u64,
            "Starting notify worker consumer"
        );

        let mut tracker = OffsetTracker::default();
        let mut tasks: JoinSet<RecordOutcome> = JoinSet::new();
        // seek 失败的分区，下次提交时重试
        let mut pending_seeks: BTreeMap<i32, i64> = BTreeMap::new();
        let mut commit_tick = tokio::time::interval(self.config.commit_interval);
        commit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.consumer.recv(), if tasks.len() < self.config.max_in_flight => {
                    match received {
                        Ok(message) => self.dispatch(&message, &mut tracker, &mut tasks),
                        Err(e) => error!(error = %e, "Error receiving message"),
                    }
                }
                Some(joined) = tasks.join_next() => record_joined(joined, &mut tracker),
                _ = commit_tick.tick() => {
                    let plan = tracker.advance();
                    self.apply_plan(&plan, false, &mut pending_seeks);
                }
            }
            self.metrics.in_flight_records.set(tasks.len() as i64);
        }

        info!(
            in_flight = tasks.len() as u64,
            grace_secs = self.config.shutdown_grace.as_secs(),
            "shutdown requested, draining in-flight records"
        );
        let abandoned = drain(&mut tasks, &mut tracker, self.config.shutdown_grace).await;
        if abandoned > 0 {
            warn!(
                abandoned = abandoned as u64,
                "shutdown grace period elapsed, unfinished records will be redelivered"
            );
        }
        let plan = tracker.advance();
        self.apply_plan(&plan, true, &mut pending_seeks);
        self.metrics.in_flight_records.set(0);

        info!(
            uncommitted = tracker.uncommitted() as u64,
            "notify worker consumer stopped"
        );
        Ok(())
    }

    /// 登记 offset 并派发处理任务
    fn dispatch(
        &self,
        message: &BorrowedMessage<'_>,
        tracker: &mut OffsetTracker,
        tasks: &mut JoinSet<RecordOutcome>,
    ) {
        let partition = message.partition();
        let offset = message.offset();
        let (generation, redelivered) = match tracker.admit(partition, offset) {
            Admission::Accept {
                generation,
                redelivered,
            } => (generation, redelivered),
            Admission::Skip => {
                debug!(partition, offset, "skipping record fetched before rewind");
                return;
            }
        };

        let record = InboundRecord {
            topic: message.topic().to_string(),
            partition,
            offset,
            generation,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        };
        let processor = self.processor.clone();
        let fallback = RecordOutcome::new(partition, offset, generation, Disposition::Redeliver);

        tasks.spawn(catch_panic(
            async move {
                if redelivered {
                    tokio::time::sleep(REDELIVERY_BACKOFF).await;
                }
                processor.process(record).await
            },
            fallback,
        ));
    }

    fn apply_plan(&self, plan: &AckPlan, stopping: bool, pending_seeks: &mut BTreeMap<i32, i64>) {
        let topic = self.config.event_topic.as_str();

        let mut commits = TopicPartitionList::new();
        for (partition, next_offset) in plan.commits() {
            if let Err(e) =
                commits.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            {
                error!(partition, next_offset, error = %e, "failed to stage offset commit");
            }
        }
        if commits.count() > 0 {
            // 停机前的最后一次提交需要同步完成
            let mode = if stopping {
                CommitMode::Sync
            } else {
                CommitMode::Async
            };
            match self.consumer.commit(&commits, mode) {
                Ok(()) => debug!(partitions = commits.count() as u64, "offsets committed"),
                Err(e) => error!(error = %e, "failed to commit offsets"),
            }
        }

        for (partition, offset) in plan.rewinds() {
            self.metrics.redelivery_total.inc();
            pending_seeks.insert(partition, offset);
        }
        if stopping {
            // 未提交的 offset 会在下次启动时重新消费
            return;
        }

        let seeks = std::mem::take(pending_seeks);
        for (partition, offset) in seeks {
            match self
                .consumer
                .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
            {
                Ok(()) => warn!(partition, offset, "partition rewound for redelivery"),
                Err(e) => {
                    error!(partition, offset, error = %e, "failed to rewind partition, will retry");
                    pending_seeks.insert(partition, offset);
                }
            }
        }
    }
}
