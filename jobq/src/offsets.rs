//! # 分区偏移量跟踪
//!
//! 记录每个分区已拉取未决、已释放待重投的偏移量，计算可安全提交的位置。
//! 提交位置不会回退，也不会越过任何未决或待重投的消息。
//!
//! 待重投的消息不阻塞分区：读取越过它继续交付后续消息，
//! 到期后回退读取位置重读，期间已交付或已决的后续消息被跳过。

use std::collections::{BTreeMap, BTreeSet};
use tokio::time::{Duration, Instant};

/// 延迟超出时钟范围时的到期上限
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now` 之后 `delay` 的到期时刻，溢出时取远期上限
pub fn due_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// 拉取到消息后的裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 交付给工作者
    Deliver,
    /// 未决、已决或未到期的消息，跳过
    Skip,
}

/// 单个分区的偏移量状态
#[derive(Debug, Default)]
pub struct PartitionOffsets {
    committed: Option<i64>,
    resolved: Option<i64>,
    position: Option<i64>,
    inflight: BTreeMap<i64, Instant>,
    deferred: BTreeMap<i64, Instant>,
    ready: BTreeSet<i64>,
    settled: BTreeSet<i64>,
}

impl PartitionOffsets {
    /// 登记读取到的消息
    pub fn fetched(&mut self, offset: i64, now: Instant) -> Verdict {
        self.position = Some(offset + 1);
        if self.inflight.contains_key(&offset)
            || self.settled.contains(&offset)
            || self.committed.is_some_and(|c| offset < c)
        {
            return Verdict::Skip;
        }
        if let Some(&due) = self.deferred.get(&offset) {
            if due > now {
                return Verdict::Skip;
            }
            self.deferred.remove(&offset);
        }
        self.ready.remove(&offset);
        self.committed.get_or_insert(offset);
        self.inflight.insert(offset, now);
        Verdict::Deliver
    }

    /// 确认消息，返回需要提交的新位置
    ///
    /// 代理提交成功后须调用 [`PartitionOffsets::confirm`]；
    /// 提交失败时重复确认会再次返回同一位置。
    pub fn acknowledge(&mut self, offset: i64) -> Option<i64> {
        self.resolve(offset);
        let mut position = self.resolved?;
        if let Some(low) = self.low_water() {
            position = position.min(low);
        }
        match self.committed {
            Some(committed) if position <= committed => None,
            _ => Some(position),
        }
    }

    /// 记录代理已提交到 `position`
    pub fn confirm(&mut self, position: i64) {
        if self.committed.is_some_and(|c| position <= c) {
            return;
        }
        self.committed = Some(position);
        self.settled = self.settled.split_off(&position);
    }

    /// 消息处理失败：视为已决，但本次不提交
    pub fn fail(&mut self, offset: i64) {
        self.resolve(offset);
    }

    /// 释放消息，`delay` 后重投；立即到期时返回读取需回退到的偏移量
    pub fn release(&mut self, offset: i64, delay: Duration, now: Instant) -> Option<i64> {
        self.inflight.remove(&offset);
        let due = due_after(now, delay);
        if due > now {
            self.deferred.insert(offset, due);
            None
        } else {
            self.ready.insert(offset);
            self.rewind()
        }
    }

    /// 到期处理：超过 `retry_after` 未决的消息与到期的待重投消息转为可重读，
    /// 返回读取需回退到的偏移量。`retry_after` 为零时不过期未决消息。
    pub fn maintain(&mut self, now: Instant, retry_after: Duration) -> Option<i64> {
        if !retry_after.is_zero() {
            let stale: Vec<i64> = self
                .inflight
                .iter()
                .filter(|&(_, fetched_at)| now.saturating_duration_since(*fetched_at) >= retry_after)
                .map(|(offset, _)| *offset)
                .collect();
            for offset in stale {
                self.inflight.remove(&offset);
                self.ready.insert(offset);
            }
        }
        let due: Vec<i64> = self
            .deferred
            .iter()
            .filter(|&(_, due)| *due <= now)
            .map(|(offset, _)| *offset)
            .collect();
        for offset in due {
            self.deferred.remove(&offset);
            self.ready.insert(offset);
        }
        self.rewind()
    }

    /// 最早的待重投到期时刻
    pub fn next_due(&self) -> Option<Instant> {
        self.deferred.values().min().copied()
    }

    /// 已提交位置
    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// 未决消息数量
    pub fn pending(&self) -> usize {
        self.inflight.len() + self.deferred.len() + self.ready.len()
    }

    fn resolve(&mut self, offset: i64) {
        self.inflight.remove(&offset);
        self.deferred.remove(&offset);
        self.ready.remove(&offset);
        if self.committed.is_none_or(|c| offset >= c) {
            self.settled.insert(offset);
        }
        let next = offset + 1;
        self.resolved = Some(self.resolved.map_or(next, |r| r.max(next)));
    }

    /// 读取位置已越过可重读的消息时回退
    fn rewind(&mut self) -> Option<i64> {
        let target = *self.ready.first()?;
        if self.position.is_some_and(|p| target < p) {
            self.position = Some(target);
            return Some(target);
        }
        None
    }

    fn low_water(&self) -> Option<i64> {
        [
            self.inflight.first_key_value().map(|(o, _)| *o),
            self.deferred.first_key_value().map(|(o, _)| *o),
            self.ready.first().copied(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
