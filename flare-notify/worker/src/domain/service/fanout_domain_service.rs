//! 通知扇出领域服务 - 单条事件的完整处理流水线
//!
//! RECEIVED -> DEVICE_REGISTERED -> PERSISTED -> TOKENS_LOADED -> DISPATCHED -> DONE
//!
//! 第 2-4 步任何失败都会终止处理；已完成的步骤不回滚。
//! 第 5 步只有在推送调用本身无法发出时才失败，单设备失败只记录不抛出。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use flare_notify::metrics::NotifyWorkerMetrics;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::error::{ProcessingError, StoreError};
use crate::domain::model::{BatchResult, FanoutReport, FanoutStage, NotificationEvent, Registration};
use crate::domain::service::{DeviceRegistry, NotificationLedger, PushDispatcher};

pub struct NotificationFanoutService {
    registry: Arc<DeviceRegistry>,
    ledger: Arc<NotificationLedger>,
    dispatcher: Arc<PushDispatcher>,
    metrics: Arc<NotifyWorkerMetrics>,
}

impl NotificationFanoutService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ledger: Arc<NotificationLedger>,
        dispatcher: Arc<PushDispatcher>,
        metrics: Arc<NotifyWorkerMetrics>,
    ) -> Self {
        Self {
            registry,
            ledger,
            dispatcher,
            metrics,
        }
    }

    /// 处理队列中的原始消息体
    pub async fn process_payload(&self, payload: &[u8]) -> Result<FanoutReport, ProcessingError> {
        let start = Instant::now();
        let result = match NotificationEvent::decode(payload) {
            Ok(event) => self.run_pipeline(&event).await,
            Err(err) => {
                warn!(error = %err, "dropping malformed notification event");
                Err(err)
            }
        };
        self.observe(&result, start);
        result
    }

    /// 处理已解码的事件
    pub async fn process(&self, event: NotificationEvent) -> Result<FanoutReport, ProcessingError> {
        let start = Instant::now();
        let result = match event.validate() {
            Ok(()) => self.run_pipeline(&event).await,
            Err(err) => Err(err),
        };
        self.observe(&result, start);
        result
    }

    #[instrument(skip(self, event), fields(user_id = %event.user_id, device_id = %event.device_id))]
    async fn run_pipeline(
        &self,
        event: &NotificationEvent,
    ) -> Result<FanoutReport, ProcessingError> {
        let user_id = event.user_id.as_str();

        // 1. 注册 / 刷新来源设备（前置条件，失败即终止）
        let registration = self
            .registry
            .register_device(user_id, &event.device_id)
            .await
            .map_err(|e| self.store_failed(FanoutStage::Received, "register", e))?;
        if matches!(registration, Registration::Reassigned { .. }) {
            self.metrics.device_reassigned_total.inc();
        }
        debug!(stage = %FanoutStage::DeviceRegistered, "pipeline advanced");

        // 2. 落库通知
        let notification = self
            .ledger
            .append(user_id, &event.message, Utc::now())
            .await
            .map_err(|e| self.store_failed(FanoutStage::DeviceRegistered, "persist", e))?;
        debug!(
            stage = %FanoutStage::Persisted,
            notification_id = %notification.id,
            "pipeline advanced"
        );

        // 3. 加载用户全部设备；空列表不是错误
        let tokens = self
            .registry
            .tokens_for_user(user_id)
            .await
            .map_err(|e| self.store_failed(FanoutStage::Persisted, "load_tokens", e))?;
        self.metrics.fanout_tokens.observe(tokens.len() as f64);
        debug!(stage = %FanoutStage::TokensLoaded, tokens = tokens.len() as u64, "pipeline advanced");

        // 4. 批量推送；只有调用无法发出才算失败
        let batch = self
            .dispatcher
            .send_batch(tokens, &event.message)
            .await
            .map_err(|e| {
                self.metrics
                    .stage_failure_total
                    .with_label_values(&["dispatch"])
                    .inc();
                error!(
                    error = %e,
                    notification_id = %notification.id,
                    "push dispatch could not be issued; notification stays persisted"
                );
                ProcessingError::delivery_unavailable(e)
            })?;
        debug!(stage = %FanoutStage::Dispatched, "pipeline advanced");

        self.record_batch(user_id, &batch);

        info!(
            stage = %FanoutStage::Done,
            notification_id = %notification.id,
            delivered = batch.delivered_count() as u64,
            failed = batch.failed_count() as u64,
            "notification fan-out completed"
        );

        Ok(FanoutReport {
            user_id: event.user_id.clone(),
            device_id: event.device_id.clone(),
            registration,
            notification_id: notification.id,
            batch,
        })
    }

    fn store_failed(
        &self,
        stage: FanoutStage,
        stage_label: &str,
        err: StoreError,
    ) -> ProcessingError {
        self.metrics
            .stage_failure_total
            .with_label_values(&[stage_label])
            .inc();
        let err = ProcessingError::from_store(stage, err);
        error!(error = %err, step = stage_label, "notification pipeline aborted");
        err
    }

    /// 单设备结果计入指标；部分失败单独告警，不影响整体成功
    fn record_batch(&self, user_id: &str, batch: &BatchResult) {
        for outcome in batch.outcomes.values() {
            self.metrics
                .push_delivery_total
                .with_label_values(&[outcome.label()])
                .inc();
        }

        if batch.failed_count() > 0 {
            self.metrics.partial_fanout_total.inc();
            warn!(
                user_id,
                delivered = batch.delivered_count() as u64,
                failed = batch.failed_count() as u64,
                failed_tokens = ?batch.failed_tokens(),
                "some devices failed to receive the notification"
            );
        }
    }

    fn observe(&self, result: &Result<FanoutReport, ProcessingError>, start: Instant) {
        let outcome = match result {
            Ok(_) => "success",
            Err(err) => err.kind.as_str(),
        };
        self.metrics
            .events_processed_total
            .with_label_values(&[outcome])
            .inc();
        self.metrics
            .pipeline_duration_seconds
            .observe(start.elapsed().as_secs_f64());
    }
}
