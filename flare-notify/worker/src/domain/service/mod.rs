//! 领域服务

pub mod device_registry;
pub mod fanout_domain_service;
pub mod notification_ledger;
pub mod push_dispatcher;

pub use device_registry::DeviceRegistry;
pub use fanout_domain_service::NotificationFanoutService;
pub use notification_ledger::NotificationLedger;
pub use push_dispatcher::PushDispatcher;
