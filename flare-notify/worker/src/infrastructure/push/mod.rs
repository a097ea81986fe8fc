//! 推送渠道实现

pub mod fcm;
pub mod fcm_auth;
pub mod noop;

pub use fcm::FcmPushProvider;
pub use noop::NoopPushProvider;
