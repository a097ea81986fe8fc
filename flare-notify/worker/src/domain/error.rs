//! 领域错误
//!
//! 每个组件向调用方返回带类型的失败；编排器据此决定终止或继续。

use flare_notify::ErrorCode;
use thiserror::Error;

use super::model::FanoutStage;

/// 设备注册表 / 通知账本的存储错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// 存储拒绝了数据本身（约束、编码），重试不会成功
    #[error("store rejected data: {0}")]
    Rejected(String),
    #[error("device {device_id} is owned by another user")]
    OwnershipConflict { device_id: String },
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(err.to_string())
    }

    pub fn rejected(err: impl std::fmt::Display) -> Self {
        StoreError::Rejected(err.to_string())
    }
}

/// 推送渠道错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// 调用本身无法发出（渠道不可达、鉴权失败等）
    #[error("push provider unavailable: {0}")]
    Unavailable(String),
    /// 设备令牌无效或已注销
    #[error("device token {token} is invalid: {reason}")]
    InvalidToken { token: String, reason: String },
    /// 渠道已收到请求但拒绝投递
    #[error("push provider rejected delivery: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingErrorKind {
    /// 事件格式错误：丢弃（进入死信），不重试
    BadInput,
    /// 注册表 / 账本 I/O 失败：依赖消息重投递重试
    StoreUnavailable,
    /// 推送调用无法发出：通知已落库，可独立补推
    DeliveryUnavailable,
}

impl ProcessingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingErrorKind::BadInput => "bad_input",
            ProcessingErrorKind::StoreUnavailable => "store_unavailable",
            ProcessingErrorKind::DeliveryUnavailable => "delivery_unavailable",
        }
    }
}

/// 单条事件处理失败
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} at {}: {message}", kind.as_str(), stage.as_str())]
pub struct ProcessingError {
    pub kind: ProcessingErrorKind,
    /// 失败发生时所处的阶段
    pub stage: FanoutStage,
    pub message: String,
    /// 更精确的错误码（如设备归属冲突）
    pub code: ErrorCode,
}

impl ProcessingError {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessingErrorKind::BadInput,
            stage: FanoutStage::Received,
            message: message.into(),
            code: ErrorCode::InvalidParameter,
        }
    }

    /// 存储阶段失败；归属冲突属于输入问题，不应重试
    pub fn from_store(stage: FanoutStage, err: StoreError) -> Self {
        match err {
            StoreError::OwnershipConflict { .. } => Self {
                kind: ProcessingErrorKind::BadInput,
                stage,
                message: err.to_string(),
                code: ErrorCode::OwnershipConflict,
            },
            StoreError::Rejected(_) => Self {
                kind: ProcessingErrorKind::BadInput,
                stage,
                message: err.to_string(),
                code: ErrorCode::InvalidParameter,
            },
            StoreError::Unavailable(_) => Self {
                kind: ProcessingErrorKind::StoreUnavailable,
                stage,
                message: err.to_string(),
                code: ErrorCode::StoreUnavailable,
            },
        }
    }

    pub fn delivery_unavailable(err: DeliveryError) -> Self {
        Self {
            kind: ProcessingErrorKind::DeliveryUnavailable,
            stage: FanoutStage::TokensLoaded,
            message: err.to_string(),
            code: ErrorCode::DeliveryUnavailable,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.code
    }
}
