//! 单条消息的处理与确认决策

use std::sync::Arc;

use flare_notify::metrics::NotifyWorkerMetrics;
use tracing::{Instrument, error, info_span, warn};

use crate::application::commands::ProcessNotificationCommand;
use crate::application::handlers::NotifyCommandHandler;
use crate::domain::model::DeadLetter;
use crate::domain::repository::DlqPublisher;
use crate::interface::consumers::ack_plan::{Disposition, FailureAction, RecordOutcome};

/// 从 Kafka 消息中分离出的记录，可跨任务移动
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// 接收时分区的回退代数
    pub generation: u64,
    pub payload: Vec<u8>,
}

pub struct RecordProcessor {
    command_handler: Arc<NotifyCommandHandler>,
    dlq_publisher: Arc<dyn DlqPublisher>,
    metrics: Arc<NotifyWorkerMetrics>,
}

impl RecordProcessor {
    pub fn new(
        command_handler: Arc<NotifyCommandHandler>,
        dlq_publisher: Arc<dyn DlqPublisher>,
        metrics: Arc<NotifyWorkerMetrics>,
    ) -> Self {
        Self {
            command_handler,
            dlq_publisher,
            metrics,
        }
    }

    /// 处理一条记录并给出确认结果
    ///
    /// 输入错误与推送不可用写入死信后确认；存储不可用或死信写入失败则重投递。
    pub async fn process(&self, record: InboundRecord) -> RecordOutcome {
        let span = info_span!(
            "notify_record",
            partition = record.partition,
            offset = record.offset
        );
        let disposition = self.settle(&record).instrument(span).await;
        RecordOutcome::new(
            record.partition,
            record.offset,
            record.generation,
            disposition,
        )
    }

    async fn settle(&self, record: &InboundRecord) -> Disposition {
        let command = ProcessNotificationCommand {
            payload: record.payload.clone(),
        };
        let err = match self.command_handler.handle_process_notification(command).await {
            Ok(_) => return Disposition::Ack,
            Err(err) => err,
        };

        match FailureAction::for_kind(err.kind) {
            FailureAction::Redeliver => {
                warn!(error = %err, "event will be redelivered");
                Disposition::Redeliver
            }
            FailureAction::DeadLetter => {
                let letter = DeadLetter::new(
                    &record.payload,
                    &err,
                    &record.topic,
                    record.partition,
                    record.offset,
                );
                match self.dlq_publisher.publish_to_dlq(&letter).await {
                    Ok(()) => {
                        self.metrics
                            .dlq_messages_total
                            .with_label_values(&[letter.error_code.as_str()])
                            .inc();
                        Disposition::Ack
                    }
                    Err(e) => {
                        error!(error = %e, cause = %err, "dead letter publish failed, event will be redelivered");
                        Disposition::Redeliver
                    }
                }
            }
        }
    }
}
