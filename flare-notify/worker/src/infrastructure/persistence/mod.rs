//! 持久化适配器：Mongo / Postgres / 内存

pub mod memory_store;
pub mod mongo_store;
pub mod postgres_store;

pub use memory_store::{InMemoryDeviceTokenStore, InMemoryNotificationStore};
pub use mongo_store::{MongoDeviceTokenStore, MongoNotificationStore};
pub use postgres_store::{PostgresDeviceTokenStore, PostgresNotificationStore};
