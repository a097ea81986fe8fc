//! 命令结构体定义（Command DTO）

/// 处理一条队列事件
#[derive(Debug, Clone)]
pub struct ProcessNotificationCommand {
    /// 原始消息体
    pub payload: Vec<u8>,
}

/// 显式注销设备（如用户登出）
#[derive(Debug, Clone)]
pub struct UnregisterDeviceCommand {
    pub user_id: String,
    pub device_id: String,
}
