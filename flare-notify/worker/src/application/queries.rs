//! 查询结构体定义（Query DTO）

use serde::{Deserialize, Serialize};

/// 查询用户的通知历史
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNotificationsQuery {
    pub user_id: String,
}
