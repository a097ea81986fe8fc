//! 确认计划
//!
//! 消息并发处理、乱序完成。每个分区记录已接收但未提交的 offset，
//! 只提交连续已确认前缀之后的 offset；前缀中遇到需要重投递的消息时，
//! 从该 offset 回退（seek），其后的消息全部重新消费。

use std::collections::BTreeMap;

use crate::domain::error::ProcessingErrorKind;

/// 单条消息的确认结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Redeliver,
}

/// 处理失败后的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// 写入死信后确认
    DeadLetter,
    /// 不确认，等待重投递
    Redeliver,
}

impl FailureAction {
    pub fn for_kind(kind: ProcessingErrorKind) -> Self {
        match kind {
            ProcessingErrorKind::BadInput | ProcessingErrorKind::DeliveryUnavailable => {
                FailureAction::DeadLetter
            }
            ProcessingErrorKind::StoreUnavailable => FailureAction::Redeliver,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub partition: i32,
    pub offset: i64,
    /// 接收时分区所处的回退代数，过期的结果会被忽略
    pub generation: u64,
    pub disposition: Disposition,
}

impl RecordOutcome {
    pub fn new(partition: i32, offset: i64, generation: u64, disposition: Disposition) -> Self {
        Self {
            partition,
            offset,
            generation,
            disposition,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    /// 下一条待消费的 offset（Kafka 提交语义）
    pub commit: Option<i64>,
    /// 回退到该 offset 重新消费
    pub rewind_to: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckPlan {
    pub partitions: BTreeMap<i32, PartitionPlan>,
}

impl AckPlan {
    pub fn commits(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.partitions
            .iter()
            .filter_map(|(partition, plan)| plan.commit.map(|offset| (*partition, offset)))
    }

    pub fn rewinds(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.partitions
            .iter()
            .filter_map(|(partition, plan)| plan.rewind_to.map(|offset| (*partition, offset)))
    }

    pub fn has_rewinds(&self) -> bool {
        self.rewinds().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// 接收一条消息时的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept {
        generation: u64,
        /// 回退后重新消费的第一条消息
        redelivered: bool,
    },
    /// 回退前已预取的消息，丢弃等待重新消费
    Skip,
}

#[derive(Debug, Default)]
struct PartitionState {
    generation: u64,
    /// offset -> 处理结果；None 表示仍在处理中
    pending: BTreeMap<i64, Option<Disposition>>,
    resume_at: Option<i64>,
}

/// 各分区在途 offset 的跟踪器
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<i32, PartitionState>,
}

impl OffsetTracker {
    pub fn admit(&mut self, partition: i32, offset: i64) -> Admission {
        let state = self.partitions.entry(partition).or_default();
        let mut redelivered = false;
        if let Some(resume_at) = state.resume_at {
            if offset != resume_at {
                return Admission::Skip;
            }
            state.resume_at = None;
            redelivered = true;
        }
        state.pending.insert(offset, None);
        Admission::Accept {
            generation: state.generation,
            redelivered,
        }
    }

    /// 记录处理结果；已被回退作废的结果返回 false
    pub fn complete(&mut self, outcome: RecordOutcome) -> bool {
        let Some(state) = self.partitions.get_mut(&outcome.partition) else {
            return false;
        };
        if state.generation != outcome.generation {
            return false;
        }
        match state.pending.get_mut(&outcome.offset) {
            Some(slot) => {
                *slot = Some(outcome.disposition);
                true
            }
            None => false,
        }
    }

    /// 弹出各分区已完成的连续前缀，生成提交与回退计划
    ///
    /// 仍在处理中的消息会挡住其后的提交：停机时被放弃的消息因此不会提交，重启后重新消费。
    pub fn advance(&mut self) -> AckPlan {
        let mut plan = AckPlan::default();
        for (partition, state) in self.partitions.iter_mut() {
            let mut step = PartitionPlan::default();
            while let Some((&offset, &result)) = state.pending.first_key_value() {
                match result {
                    None => break,
                    Some(Disposition::Ack) => {
                        state.pending.remove(&offset);
                        step.commit = Some(offset + 1);
                    }
                    Some(Disposition::Redeliver) => {
                        state.pending.clear();
                        state.generation += 1;
                        state.resume_at = Some(offset);
                        step.rewind_to = Some(offset);
                        break;
                    }
                }
            }
            if step != PartitionPlan::default() {
                plan.partitions.insert(*partition, step);
            }
        }
        plan
    }

    /// 已接收、尚未提交的消息数
    pub fn uncommitted(&self) -> usize {
        self.partitions.values().map(|s| s.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Disposition::{Ack, Redeliver};

    fn accept(tracker: &mut OffsetTracker, partition: i32, offset: i64) -> u64 {
        match tracker.admit(partition, offset) {
            Admission::Accept { generation, .. } => generation,
            Admission::Skip => panic!("offset {offset} was skipped"),
        }
    }

    fn settle(tracker: &mut OffsetTracker, partition: i32, offsets: &[(i64, Disposition)]) {
        for (offset, disposition) in offsets {
            assert!(tracker.complete(RecordOutcome::new(partition, *offset, 0, *disposition)));
        }
    }

    #[test]
    fn test_out_of_order_acks_commit_past_last_offset() {
        let mut tracker = OffsetTracker::default();
        for offset in 10..13 {
            accept(&mut tracker, 0, offset);
        }
        settle(&mut tracker, 0, &[(12, Ack), (10, Ack), (11, Ack)]);

        let plan = tracker.advance();
        assert_eq!(plan.commits().collect::<Vec<_>>(), vec![(0, 13)]);
        assert!(!plan.has_rewinds());
        assert_eq!(tracker.uncommitted(), 0);
        // 已提交的前缀不会重复提交
        assert!(tracker.advance().is_empty());
    }

    #[test]
    fn test_unfinished_record_blocks_later_commits() {
        let mut tracker = OffsetTracker::default();
        for offset in 10..13 {
            accept(&mut tracker, 0, offset);
        }
        settle(&mut tracker, 0, &[(10, Ack), (12, Ack)]);

        let plan = tracker.advance();
        assert_eq!(plan.commits().collect::<Vec<_>>(), vec![(0, 11)]);
        assert_eq!(tracker.uncommitted(), 2);

        settle(&mut tracker, 0, &[(11, Ack)]);
        assert_eq!(tracker.advance().commits().collect::<Vec<_>>(), vec![(0, 13)]);
    }

    #[test]
    fn test_redeliver_stops_commit_and_rewinds() {
        let mut tracker = OffsetTracker::default();
        for offset in 10..13 {
            accept(&mut tracker, 0, offset);
        }
        settle(&mut tracker, 0, &[(10, Ack), (11, Redeliver), (12, Ack)]);

        let plan = tracker.advance();
        assert_eq!(
            plan.partitions[&0],
            PartitionPlan {
                commit: Some(11),
                rewind_to: Some(11)
            }
        );
        assert_eq!(tracker.uncommitted(), 0);
    }

    #[test]
    fn test_rewind_discards_stale_records_and_outcomes() {
        let mut tracker = OffsetTracker::default();
        for offset in 40..43 {
            accept(&mut tracker, 3, offset);
        }
        settle(&mut tracker, 3, &[(40, Redeliver)]);
        assert_eq!(tracker.advance().rewinds().collect::<Vec<_>>(), vec![(3, 40)]);

        // 回退前已在处理的 41 完成，其结果作废
        assert!(!tracker.complete(RecordOutcome::new(3, 41, 0, Ack)));
        // 回退前预取的 43 被丢弃，直到 40 重新到达
        assert_eq!(tracker.admit(3, 43), Admission::Skip);
        assert_eq!(
            tracker.admit(3, 40),
            Admission::Accept {
                generation: 1,
                redelivered: true
            }
        );
        assert_eq!(
            tracker.admit(3, 41),
            Admission::Accept {
                generation: 1,
                redelivered: false
            }
        );

        assert!(tracker.complete(RecordOutcome::new(3, 40, 1, Ack)));
        assert!(tracker.complete(RecordOutcome::new(3, 41, 1, Ack)));
        assert_eq!(tracker.advance().commits().collect::<Vec<_>>(), vec![(3, 42)]);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        accept(&mut tracker, 0, 5);
        accept(&mut tracker, 1, 7);
        accept(&mut tracker, 2, 9);
        settle(&mut tracker, 0, &[(5, Ack)]);
        settle(&mut tracker, 1, &[(7, Redeliver)]);
        settle(&mut tracker, 2, &[(9, Ack)]);

        let plan = tracker.advance();
        assert_eq!(plan.commits().collect::<Vec<_>>(), vec![(0, 6), (2, 10)]);
        assert_eq!(plan.rewinds().collect::<Vec<_>>(), vec![(1, 7)]);
    }

    #[test]
    fn test_failure_actions() {
        assert_eq!(
            FailureAction::for_kind(ProcessingErrorKind::BadInput),
            FailureAction::DeadLetter
        );
        assert_eq!(
            FailureAction::for_kind(ProcessingErrorKind::DeliveryUnavailable),
            FailureAction::DeadLetter
        );
        assert_eq!(
            FailureAction::for_kind(ProcessingErrorKind::StoreUnavailable),
            FailureAction::Redeliver
        );
    }
}
