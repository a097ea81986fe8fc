//! 在途任务：panic 兜底与停机排空

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::interface::consumers::ack_plan::{OffsetTracker, RecordOutcome};

/// 任务 panic 时返回 `fallback`，保证每条已接收的消息都有结果
pub async fn catch_panic<F>(task: F, fallback: RecordOutcome) -> RecordOutcome
where
    F: Future<Output = RecordOutcome>,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                partition = fallback.partition,
                offset = fallback.offset,
                "record processing panicked"
            );
            fallback
        }
    }
}

/// 把完成的任务结果记入跟踪器
pub fn record_joined(
    joined: Result<RecordOutcome, tokio::task::JoinError>,
    tracker: &mut OffsetTracker,
) {
    match joined {
        Ok(outcome) => {
            if !tracker.complete(outcome) {
                debug!(
                    partition = outcome.partition,
                    offset = outcome.offset,
                    "ignoring outcome of a record superseded by a rewind"
                );
            }
        }
        Err(e) => error!(error = %e, "record task failed"),
    }
}

/// 停机时在宽限期内等待在途任务，超时后中止剩余任务
///
/// 返回被放弃的任务数。被放弃的消息没有结果，不会被提交。
pub async fn drain(
    tasks: &mut JoinSet<RecordOutcome>,
    tracker: &mut OffsetTracker,
    grace: Duration,
) -> usize {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(joined) => record_joined(joined, tracker),
                None => return 0,
            },
            _ = &mut deadline => {
                let abandoned = tasks.len();
                tasks.abort_all();
                return abandoned;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::consumers::ack_plan::{Admission, Disposition};

    fn generation(admission: Admission) -> u64 {
        match admission {
            Admission::Accept { generation, .. } => generation,
            Admission::Skip => panic!("record skipped"),
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_redelivered() {
        let mut tracker = OffsetTracker::default();
        let g10 = generation(tracker.admit(0, 10));
        let g11 = generation(tracker.admit(0, 11));

        let mut tasks = JoinSet::new();
        tasks.spawn(catch_panic(
            async move { RecordOutcome::new(0, 10, g10, Disposition::Ack) },
            RecordOutcome::new(0, 10, g10, Disposition::Redeliver),
        ));
        tasks.spawn(catch_panic(
            async move {
                if g11 == 0 {
                    panic!("store driver bug");
                }
                RecordOutcome::new(0, 11, g11, Disposition::Ack)
            },
            RecordOutcome::new(0, 11, g11, Disposition::Redeliver),
        ));

        let abandoned = drain(&mut tasks, &mut tracker, Duration::from_secs(5)).await;
        assert_eq!(abandoned, 0);

        let plan = tracker.advance();
        assert_eq!(plan.commits().collect::<Vec<_>>(), vec![(0, 11)]);
        assert_eq!(plan.rewinds().collect::<Vec<_>>(), vec![(0, 11)]);
    }

    #[tokio::test]
    async fn test_drain_abandons_records_after_grace() {
        let mut tracker = OffsetTracker::default();
        let g20 = generation(tracker.admit(2, 20));
        let g21 = generation(tracker.admit(2, 21));
        let g22 = generation(tracker.admit(2, 22));

        let mut tasks = JoinSet::new();
        tasks.spawn(async move { RecordOutcome::new(2, 20, g20, Disposition::Ack) });
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            RecordOutcome::new(2, 21, g21, Disposition::Ack)
        });
        tasks.spawn(async move { RecordOutcome::new(2, 22, g22, Disposition::Ack) });

        let abandoned = drain(&mut tasks, &mut tracker, Duration::from_millis(100)).await;
        assert_eq!(abandoned, 1);

        // 21 未完成，只能提交到 21；21 与 22 重启后重新消费
        let plan = tracker.advance();
        assert_eq!(plan.commits().collect::<Vec<_>>(), vec![(2, 21)]);
        assert!(!plan.has_rewinds());
        assert_eq!(tracker.uncommitted(), 2);
    }

    #[tokio::test]
    async fn test_drain_with_no_tasks_returns_immediately() {
        let mut tracker = OffsetTracker::default();
        let mut tasks: JoinSet<RecordOutcome> = JoinSet::new();
        assert_eq!(
            drain(&mut tasks, &mut tracker, Duration::from_secs(30)).await,
            0
        );
    }
}
