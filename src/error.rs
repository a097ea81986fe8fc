//! Flare Notify 错误码
//!
//! 各服务的错误类型各自定义（thiserror），这里只提供跨服务统一的错误码，
//! 用于指标标签与死信消息中的 `error_code` 字段。

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// 输入不合法（不可重试）
    InvalidParameter,
    /// 存储不可用（依赖重投递重试）
    StoreUnavailable,
    /// 推送渠道不可用（通知已落库，可独立补推）
    DeliveryUnavailable,
    /// 设备已归属其他用户
    OwnershipConflict,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::DeliveryUnavailable => "DELIVERY_UNAVAILABLE",
            ErrorCode::OwnershipConflict => "OWNERSHIP_CONFLICT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display_matches_as_str() {
        for code in [
            ErrorCode::InvalidParameter,
            ErrorCode::StoreUnavailable,
            ErrorCode::DeliveryUnavailable,
            ErrorCode::OwnershipConflict,
        ] {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn test_serializes_as_screaming_snake_case() {
        let value = serde_json::to_value(ErrorCode::OwnershipConflict).unwrap();
        assert_eq!(value, serde_json::json!("OWNERSHIP_CONFLICT"));
    }
}
