//! 查询处理器（编排层）

use std::sync::Arc;

use tracing::instrument;

use crate::application::queries::ListNotificationsQuery;
use crate::domain::error::ProcessingError;
use crate::domain::model::{FanoutStage, Notification};
use crate::domain::service::NotificationLedger;

/// 通知查询处理器
pub struct NotifyQueryHandler {
    ledger: Arc<NotificationLedger>,
}

impl NotifyQueryHandler {
    pub fn new(ledger: Arc<NotificationLedger>) -> Self {
        Self { ledger }
    }

    /// 查询用户通知历史，按创建时间升序
    #[instrument(skip(self), fields(user_id = %query.user_id))]
    pub async fn list_notifications(
        &self,
        query: ListNotificationsQuery,
    ) -> Result<Vec<Notification>, ProcessingError> {
        if query.user_id.trim().is_empty() {
            return Err(ProcessingError::bad_input("user_id is required"));
        }
        self.ledger
            .history_for_user(&query.user_id)
            .await
            .map_err(|e| ProcessingError::from_store(FanoutStage::Received, e))
    }
}
