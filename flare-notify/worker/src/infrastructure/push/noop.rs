use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::domain::error::DeliveryError;
use crate::domain::model::TokenOutcome;
use crate::domain::repository::PushProvider;

/// 不真正推送，所有设备视为送达
pub struct NoopPushProvider;

#[async_trait]
impl PushProvider for NoopPushProvider {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn send_multicast(
        &self,
        _message: &str,
        tokens: &[String],
    ) -> Result<HashMap<String, TokenOutcome>, DeliveryError> {
        info!(tokens = tokens.len() as u64, "noop push provider invoked");
        Ok(tokens
            .iter()
            .map(|token| (token.clone(), TokenOutcome::Delivered))
            .collect())
    }
}

impl NoopPushProvider {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self)
    }
}
