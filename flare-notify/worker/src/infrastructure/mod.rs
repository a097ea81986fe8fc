//! 基础设施层（Repository impl）

pub mod dlq_publisher;
pub mod kafka;
pub mod persistence;
pub mod push;

pub use dlq_publisher::{KafkaDlqPublisher, NoopDlqPublisher};
pub use persistence::{
    InMemoryDeviceTokenStore, InMemoryNotificationStore, MongoDeviceTokenStore,
    MongoNotificationStore, PostgresDeviceTokenStore, PostgresNotificationStore,
};
pub use push::{FcmPushProvider, NoopPushProvider};
