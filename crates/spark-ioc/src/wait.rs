//! 阻塞等待的截止时间辅助。
//!
//! 所有可阻塞 API 都以相同方式解释 [`BlockingMode`]：先检查条件，条件不满足时由本模块决定
//! “立即失败 / 无限等待 / 限时等待”。等待被唤醒后调用方必须重新检查条件（虚假唤醒与竞争唤醒都可能发生）。

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

use crate::types::BlockingMode;

/// 单次等待的结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// 被唤醒或等待了一段时间，需要重新检查条件。
    Recheck,
    /// 调用方不允许等待（`NonBlock`）。
    WouldBlock,
    /// 截止时间已到。
    Expired,
}

/// 一次阻塞调用的截止时间。
///
/// - **契约 (What)**：在调用入口处通过 [`WaitDeadline::start`] 固定截止时间，后续多轮等待共享同一截止点，
///   因此被反复唤醒的调用方不会因为“每轮重新计时”而超出调用方给定的时长。
#[derive(Clone, Copy, Debug)]
pub(crate) struct WaitDeadline {
    mode: BlockingMode,
    deadline: Option<Instant>,
}

impl WaitDeadline {
    pub(crate) fn start(mode: BlockingMode) -> Self {
        let mode = mode.normalized();
        let deadline = match mode {
            BlockingMode::Timeout(duration) => Instant::now().checked_add(duration),
            _ => None,
        };
        Self { mode, deadline }
    }

    #[cfg(test)]
    pub(crate) fn mode(&self) -> BlockingMode {
        self.mode
    }

    /// 距离截止时间的剩余时长；无限等待返回 `None`。
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// 在条件变量上等待一次。
    pub(crate) fn wait<T>(&self, condvar: &Condvar, guard: &mut MutexGuard<'_, T>) -> WaitOutcome {
        match self.mode {
            BlockingMode::NonBlock => WaitOutcome::WouldBlock,
            BlockingMode::MayBlock => {
                condvar.wait(guard);
                WaitOutcome::Recheck
            }
            BlockingMode::Timeout(_) => match self.remaining() {
                Some(remaining) if !remaining.is_zero() => {
                    condvar.wait_for(guard, remaining);
                    WaitOutcome::Recheck
                }
                // `checked_add` 溢出时视为无限等待。
                None => {
                    condvar.wait(guard);
                    WaitOutcome::Recheck
                }
                Some(_) => WaitOutcome::Expired,
            },
        }
    }
}
