//! 命令处理器（编排层）- 轻量级，只负责编排领域服务

use std::sync::Arc;

use tracing::instrument;

use crate::application::commands::{ProcessNotificationCommand, UnregisterDeviceCommand};
use crate::domain::error::ProcessingError;
use crate::domain::model::{FanoutReport, FanoutStage};
use crate::domain::service::{DeviceRegistry, NotificationFanoutService};

/// 通知命令处理器（编排层）
pub struct NotifyCommandHandler {
    fanout_service: Arc<NotificationFanoutService>,
    registry: Arc<DeviceRegistry>,
}

impl NotifyCommandHandler {
    pub fn new(
        fanout_service: Arc<NotificationFanoutService>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            fanout_service,
            registry,
        }
    }

    /// 处理一条通知事件
    pub async fn handle_process_notification(
        &self,
        command: ProcessNotificationCommand,
    ) -> Result<FanoutReport, ProcessingError> {
        self.fanout_service.process_payload(&command.payload).await
    }

    /// 处理设备注销命令；返回设备是否被删除
    #[instrument(skip(self), fields(user_id = %command.user_id, device_id = %command.device_id))]
    pub async fn handle_unregister_device(
        &self,
        command: UnregisterDeviceCommand,
    ) -> Result<bool, ProcessingError> {
        if command.user_id.trim().is_empty() || command.device_id.trim().is_empty() {
            return Err(ProcessingError::bad_input(
                "user_id and device_id are required",
            ));
        }
        self.registry
            .unregister_device(&command.user_id, &command.device_id)
            .await
            .map_err(|e| ProcessingError::from_store(FanoutStage::Received, e))
    }
}
