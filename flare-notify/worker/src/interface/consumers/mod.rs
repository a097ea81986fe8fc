pub mod ack_plan;
pub mod consumer;
pub mod in_flight;
pub mod processor;

pub use ack_plan::{
    AckPlan, Admission, Disposition, FailureAction, OffsetTracker, PartitionPlan, RecordOutcome,
};
pub use consumer::NotifyWorkerConsumer;
pub use processor::{InboundRecord, RecordProcessor};
