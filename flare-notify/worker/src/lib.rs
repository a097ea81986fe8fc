//! 通知扇出 Worker
//!
//! 从队列消费通知事件：登记来源设备、落库通知、向用户全部设备推送。

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod service;

pub use config::NotifyWorkerConfig;
pub use service::ApplicationBootstrap;
