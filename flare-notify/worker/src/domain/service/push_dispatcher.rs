//! 推送分发器：把一条消息发往 N 个设备，并如实报告部分失败

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::domain::error::DeliveryError;
use crate::domain::model::{BatchResult, TokenOutcome};
use crate::domain::repository::PushProvider;

pub struct PushDispatcher {
    provider: Arc<dyn PushProvider>,
}

impl PushDispatcher {
    pub fn new(provider: Arc<dyn PushProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// 单设备推送；该设备的任何失败都作为错误返回
    pub async fn send_to_one(&self, device_id: &str, message: &str) -> Result<(), DeliveryError> {
        let tokens = vec![device_id.to_string()];
        let mut outcomes = self.provider.send_multicast(message, &tokens).await?;

        match outcomes.remove(device_id) {
            Some(TokenOutcome::Delivered) => Ok(()),
            Some(TokenOutcome::InvalidToken { reason }) => Err(DeliveryError::InvalidToken {
                token: device_id.to_string(),
                reason,
            }),
            Some(TokenOutcome::Failed { reason }) => Err(DeliveryError::Rejected(reason)),
            None => Err(DeliveryError::Rejected(format!(
                "provider {} returned no result for device",
                self.provider.name()
            ))),
        }
    }

    /// 批量推送
    ///
    /// 输入按集合去重；空集合不调用渠道。渠道漏报的设备记为失败，
    /// 保证每个输入设备都有一条结果。
    #[instrument(skip(self, device_ids, message), fields(provider = self.provider.name(), tokens = tracing::field::Empty))]
    pub async fn send_batch<I, S>(
        &self,
        device_ids: I,
        message: &str,
    ) -> Result<BatchResult, DeliveryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: BTreeSet<String> = device_ids.into_iter().map(Into::into).collect();
        tracing::Span::current().record("tokens", unique.len() as u64);

        if unique.is_empty() {
            debug!("no device tokens, skipping provider call");
            return Ok(BatchResult::default());
        }

        let tokens: Vec<String> = unique.into_iter().collect();
        let mut reported = self.provider.send_multicast(message, &tokens).await?;

        let mut batch = BatchResult::default();
        for token in tokens {
            let outcome = reported.remove(&token).unwrap_or_else(|| TokenOutcome::Failed {
                reason: "no result reported by provider".to_string(),
            });
            batch.outcomes.insert(token, outcome);
        }

        if !reported.is_empty() {
            warn!(
                extra = reported.len() as u64,
                "provider reported results for tokens that were not requested"
            );
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 记录调用参数，并让 `bad-` 前缀的令牌失败
    #[derive(Default)]
    struct ScriptedProvider {
        calls: Mutex<Vec<Vec<String>>>,
        unreachable: bool,
        drop_token: Option<String>,
    }

    #[async_trait]
    impl PushProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send_multicast(
            &self,
            _message: &str,
            tokens: &[String],
        ) -> Result<HashMap<String, TokenOutcome>, DeliveryError> {
            self.calls.lock().unwrap().push(tokens.to_vec());
            if self.unreachable {
                return Err(DeliveryError::Unavailable("connection refused".into()));
            }
            Ok(tokens
                .iter()
                .filter(|t| Some(*t) != self.drop_token.as_ref())
                .map(|t| {
                    let outcome = if t.starts_with("bad-") {
                        TokenOutcome::InvalidToken {
                            reason: "UNREGISTERED".into(),
                        }
                    } else {
                        TokenOutcome::Delivered
                    };
                    (t.clone(), outcome)
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_empty_batch_skips_provider() {
        let provider = Arc::new(ScriptedProvider::default());
        let dispatcher = PushDispatcher::new(provider.clone());

        let batch = dispatcher
            .send_batch(Vec::<String>::new(), "hello")
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_tokens_are_sent_once() {
        let provider = Arc::new(ScriptedProvider::default());
        let dispatcher = PushDispatcher::new(provider.clone());

        let batch = dispatcher
            .send_batch(vec!["d1", "d2", "d1"], "hello")
            .await
            .unwrap();

        assert_eq!(batch.total(), 2);
        assert_eq!(
            provider.calls.lock().unwrap().as_slice(),
            &[vec!["d1".to_string(), "d2".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_per_token() {
        let provider = Arc::new(ScriptedProvider {
            drop_token: Some("d3".into()),
            ..Default::default()
        });
        let dispatcher = PushDispatcher::new(provider);

        let batch = dispatcher
            .send_batch(vec!["d1", "bad-d2", "d3"], "hello")
            .await
            .unwrap();

        assert_eq!(batch.delivered_count(), 1);
        assert_eq!(batch.failed_tokens(), vec!["bad-d2", "d3"]);
        assert!(matches!(
            batch.outcomes.get("d3"),
            Some(TokenOutcome::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider_fails_whole_call() {
        let provider = Arc::new(ScriptedProvider {
            unreachable: true,
            ..Default::default()
        });
        let dispatcher = PushDispatcher::new(provider);

        let err = dispatcher.send_batch(vec!["d1"], "hello").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_send_to_one_surfaces_invalid_token() {
        let dispatcher = PushDispatcher::new(Arc::new(ScriptedProvider::default()));

        assert!(dispatcher.send_to_one("d1", "hi").await.is_ok());
        let err = dispatcher.send_to_one("bad-d9", "hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidToken { token, .. } if token == "bad-d9"));
    }
}
