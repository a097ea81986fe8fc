//! 领域层（业务核心逻辑）

pub mod error;
pub mod model;
pub mod repository;
pub mod service;

pub use error::{DeliveryError, ProcessingError, ProcessingErrorKind, StoreError};
pub use model::{
    BatchResult, DeadLetter, DeviceOwnershipPolicy, DeviceToken, FanoutReport, FanoutStage,
    Notification, NotificationEvent, Registration, TokenOutcome,
};
pub use repository::{DeviceTokenRepository, DlqPublisher, NotificationRepository, PushProvider};
pub use service::{DeviceRegistry, NotificationFanoutService, NotificationLedger, PushDispatcher};
