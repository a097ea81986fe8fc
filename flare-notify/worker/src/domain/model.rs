use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flare_notify::ErrorCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ProcessingError;

/// 队列中的通知事件（仅存在于线上与处理过程中）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotificationEvent {
    #[serde(rename = "userID", default)]
    pub user_id: String,
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    #[serde(rename = "notification", default)]
    pub message: String,
}

impl NotificationEvent {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// 解析并校验 JSON 消息体
    pub fn decode(payload: &[u8]) -> Result<Self, ProcessingError> {
        let event: NotificationEvent = serde_json::from_slice(payload)
            .map_err(|e| ProcessingError::bad_input(format!("invalid event body: {e}")))?;
        event.validate()?;
        Ok(event)
    }

    /// 用户、设备与消息内容都必须非空，且不含 NUL（存储无法保存）
    pub fn validate(&self) -> Result<(), ProcessingError> {
        for (field, value) in [
            ("userID", &self.user_id),
            ("deviceID", &self.device_id),
            ("notification", &self.message),
        ] {
            if value.contains('\0') {
                return Err(ProcessingError::bad_input(format!(
                    "{field} contains a NUL character"
                )));
            }
        }
        if self.user_id.trim().is_empty() {
            return Err(ProcessingError::bad_input("userID is required"));
        }
        if self.device_id.trim().is_empty() {
            return Err(ProcessingError::bad_input("deviceID is required"));
        }
        if self.message.trim().is_empty() {
            return Err(ProcessingError::bad_input("notification is required"));
        }
        Ok(())
    }
}

/// 已落库的通知；创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: &str, message: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            created_at,
        }
    }
}

/// 设备令牌，`device_id` 全局唯一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: Uuid,
    pub user_id: String,
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
}

/// 设备注册结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// 首次出现
    Created,
    /// 同一用户再次出现，刷新 last_seen
    Refreshed,
    /// 设备从另一个用户转移过来
    Reassigned { previous_user_id: String },
}

/// 设备出现在另一个用户名下时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceOwnershipPolicy {
    /// 转移到新用户（记录告警与指标）
    #[default]
    Reassign,
    /// 拒绝，要求原用户先显式注销
    Reject,
}

impl FromStr for DeviceOwnershipPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reassign" => Ok(DeviceOwnershipPolicy::Reassign),
            "reject" => Ok(DeviceOwnershipPolicy::Reject),
            other => Err(format!("unknown device ownership policy: {other}")),
        }
    }
}

/// 扇出流水线的阶段，严格线性推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FanoutStage {
    Received,
    DeviceRegistered,
    Persisted,
    TokensLoaded,
    Dispatched,
    Done,
}

impl FanoutStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutStage::Received => "received",
            FanoutStage::DeviceRegistered => "device_registered",
            FanoutStage::Persisted => "persisted",
            FanoutStage::TokensLoaded => "tokens_loaded",
            FanoutStage::Dispatched => "dispatched",
            FanoutStage::Done => "done",
        }
    }
}

impl fmt::Display for FanoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个设备的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Delivered,
    /// 令牌无效或已注销
    InvalidToken { reason: String },
    Failed { reason: String },
}

impl TokenOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, TokenOutcome::Delivered)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TokenOutcome::Delivered => "delivered",
            TokenOutcome::InvalidToken { .. } => "invalid_token",
            TokenOutcome::Failed { .. } => "failed",
        }
    }
}

/// 批量推送结果：每个输入设备一条记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub outcomes: BTreeMap<String, TokenOutcome>,
}

impl BatchResult {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_delivered()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.total() - self.delivered_count()
    }

    pub fn failed_tokens(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_delivered())
            .map(|(token, _)| token.as_str())
            .collect()
    }
}

/// 单条事件成功处理后的报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub user_id: String,
    pub device_id: String,
    pub registration: Registration,
    pub notification_id: Uuid,
    pub batch: BatchResult,
}

/// 死信消息
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// 原始消息体（非 UTF-8 字节按有损方式转换）
    pub payload: String,
    #[serde(skip)]
    pub key: Option<String>,
    pub error_code: ErrorCode,
    pub error: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub timestamp: i64,
}

impl DeadLetter {
    pub fn new(
        payload: &[u8],
        error: &ProcessingError,
        source_topic: &str,
        source_partition: i32,
        source_offset: i64,
    ) -> Self {
        // 尽量用 userID 作为 key，使同一用户的死信落在同一分区
        let key = serde_json::from_slice::<NotificationEvent>(payload)
            .ok()
            .map(|event| event.user_id)
            .filter(|user_id| !user_id.is_empty());

        Self {
            payload: String::from_utf8_lossy(payload).into_owned(),
            key,
            error_code: error.error_code(),
            error: error.to_string(),
            source_topic: source_topic.to_string(),
            source_partition,
            source_offset,
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ProcessingErrorKind;

    #[test]
    fn test_decode_wire_event() {
        let body = br#"{"userID":"u1","deviceID":"d1","notification":"Grade 5"}"#;
        let event = NotificationEvent::decode(body).unwrap();
        assert_eq!(event, NotificationEvent::new("u1", "d1", "Grade 5"));
    }

    #[test]
    fn test_decode_missing_user_is_bad_input() {
        let body = br#"{"deviceID":"d1","notification":"Grade 5"}"#;
        let err = NotificationEvent::decode(body).unwrap_err();
        assert_eq!(err.kind, ProcessingErrorKind::BadInput);
        assert!(err.message.contains("userID"));
    }

    #[test]
    fn test_decode_blank_device_is_bad_input() {
        let body = br#"{"userID":"u1","deviceID":"  ","notification":"x"}"#;
        let err = NotificationEvent::decode(body).unwrap_err();
        assert_eq!(err.kind, ProcessingErrorKind::BadInput);
    }

    #[test]
    fn test_decode_nul_in_message_is_bad_input() {
        let body = br#"{"userID":"u1","deviceID":"d1","notification":"a\u0000b"}"#;
        let err = NotificationEvent::decode(body).unwrap_err();
        assert_eq!(err.kind, ProcessingErrorKind::BadInput);
        assert!(err.message.contains("NUL"));
    }

    #[test]
    fn test_decode_garbage_is_bad_input() {
        let err = NotificationEvent::decode(b"not json").unwrap_err();
        assert_eq!(err.kind, ProcessingErrorKind::BadInput);
        assert_eq!(err.stage, FanoutStage::Received);
    }

    #[test]
    fn test_ownership_policy_from_str() {
        assert_eq!(
            "Reject".parse::<DeviceOwnershipPolicy>().unwrap(),
            DeviceOwnershipPolicy::Reject
        );
        assert_eq!(
            "reassign".parse::<DeviceOwnershipPolicy>().unwrap(),
            DeviceOwnershipPolicy::Reassign
        );
        assert!("steal".parse::<DeviceOwnershipPolicy>().is_err());
    }

    #[test]
    fn test_batch_result_counts() {
        let mut batch = BatchResult::default();
        batch.outcomes.insert("a".into(), TokenOutcome::Delivered);
        batch.outcomes.insert(
            "b".into(),
            TokenOutcome::InvalidToken {
                reason: "UNREGISTERED".into(),
            },
        );
        batch.outcomes.insert(
            "c".into(),
            TokenOutcome::Failed {
                reason: "503".into(),
            },
        );

        assert_eq!(batch.total(), 3);
        assert_eq!(batch.delivered_count(), 1);
        assert_eq!(batch.failed_count(), 2);
        assert_eq!(batch.failed_tokens(), vec!["b", "c"]);
    }

    #[test]
    fn test_dead_letter_uses_user_as_key() {
        let body = br#"{"userID":"u9","deviceID":"","notification":"x"}"#;
        let err = NotificationEvent::decode(body).unwrap_err();
        let letter = DeadLetter::new(body, &err, "notification.events", 2, 41);

        assert_eq!(letter.key.as_deref(), Some("u9"));
        assert_eq!(letter.error_code, ErrorCode::InvalidParameter);
        assert_eq!(letter.source_partition, 2);
        assert_eq!(letter.source_offset, 41);

        let json = serde_json::to_value(&letter).unwrap();
        assert_eq!(json["error_code"], "INVALID_PARAMETER");
        assert!(json.get("key").is_none());
    }
}
