//! # 命令通道
//!
//! ## 意图（Why）
//! - `CmdInitiator` 链路发起请求，配对的 `CmdExecutor` 链路通过执行回调给出结果，形成同步 RPC；
//! - 执行回调在发起方线程上运行，同一执行端的命令串行执行，子状态在执行期间分别为
//!   `CmdInitiatorBusyExecCmd` 与 `CmdExecutorBusyExecCmd`。
//!
//! ## 契约（What）
//! - 执行端未注册回调时返回 `NoCmdExecutor`；
//! - 在执行回调内部对同一执行端再次发起命令返回 `ForbiddenInCallback`；
//! - 执行端正忙时按阻塞模式等待：`NonBlock` 返回 `TooMany`，`Timeout` 到期返回 `Timeout`。

use core::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::dispatch::DispatchScope;
use crate::error::{IocError, IocResult};
use crate::link::state::{BusyKind, OpCounters};
use crate::types::{BlockingMode, LinkId};
use crate::wait::{WaitDeadline, WaitOutcome};

/// 命令类型标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CmdId(pub u64);

impl CmdId {
    /// 连通性探测：执行端原样回显输入。
    pub const PING: CmdId = CmdId(1);
    pub const ECHO: CmdId = CmdId(2);
}

/// 命令执行状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CmdStatus {
    #[default]
    Initialized,
    Success,
    Failed,
}

/// 一次命令请求及其结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdDesc {
    pub cmd_id: CmdId,
    pub input: Bytes,
    pub output: Bytes,
    pub status: CmdStatus,
}

impl CmdDesc {
    pub fn new(cmd_id: CmdId, input: impl Into<Bytes>) -> Self {
        Self {
            cmd_id,
            input: input.into(),
            output: Bytes::new(),
            status: CmdStatus::Initialized,
        }
    }
}

/// 命令执行回调：参数为执行端链路句柄与待填充结果的命令。
pub type CmdExecutorFn = Arc<dyn Fn(LinkId, &mut CmdDesc) -> IocResult<()> + Send + Sync>;

/// 执行端状态：回调与串行化闸门。
pub(crate) struct CmdExecutor {
    link: LinkId,
    callback: Option<CmdExecutorFn>,
    busy: Mutex<bool>,
    idle: Condvar,
}

impl fmt::Debug for CmdExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdExecutor")
            .field("link", &self.link)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl CmdExecutor {
    pub(crate) fn new(link: LinkId, callback: Option<CmdExecutorFn>) -> Self {
        Self {
            link,
            callback,
            busy: Mutex::new(false),
            idle: Condvar::new(),
        }
    }

    /// 在调用线程上执行命令。
    pub(crate) fn execute(
        &self,
        ops: &OpCounters,
        mut desc: CmdDesc,
        blocking: BlockingMode,
    ) -> IocResult<CmdDesc> {
        let callback = self
            .callback
            .as_ref()
            .ok_or(IocError::NoCmdExecutor { link: self.link })?;
        let _slot = self.acquire(blocking)?;
        let _busy = ops.enter(BusyKind::ExecCmd);
        let _scope = DispatchScope::enter(self.link);
        match catch_unwind(AssertUnwindSafe(|| callback(self.link, &mut desc))) {
            Ok(Ok(())) => {
                if desc.status == CmdStatus::Initialized {
                    desc.status = CmdStatus::Success;
                }
                Ok(desc)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(ioc.link_id = %self.link, cmd_id = desc.cmd_id.0, "command executor panicked");
                Err(IocError::bug("command executor panicked"))
            }
        }
    }

    fn acquire(&self, blocking: BlockingMode) -> IocResult<ExecSlot<'_>> {
        let deadline = WaitDeadline::start(blocking);
        let mut busy = self.busy.lock();
        loop {
            if !*busy {
                *busy = true;
                return Ok(ExecSlot { executor: self });
            }
            match deadline.wait(&self.idle, &mut busy) {
                WaitOutcome::Recheck => continue,
                WaitOutcome::WouldBlock => {
                    return Err(IocError::TooMany {
                        what: "in-flight commands per executor",
                        limit: 1,
                    });
                }
                WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }
}

struct ExecSlot<'a> {
    executor: &'a CmdExecutor,
}

impl Drop for ExecSlot<'_> {
    fn drop(&mut self) {
        *self.executor.busy.lock() = false;
        self.executor.idle.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_fills_result_and_marks_success() {
        let executor = CmdExecutor::new(
            LinkId::from_raw(4),
            Some(Arc::new(|_: LinkId, desc: &mut CmdDesc| {
                desc.output = desc.input.clone();
                Ok(())
            })),
        );
        let ops = OpCounters::default();
        let result = executor
            .execute(&ops, CmdDesc::new(CmdId::ECHO, "abc"), BlockingMode::MayBlock)
            .expect("执行成功");
        assert_eq!(result.output, Bytes::from_static(b"abc"));
        assert_eq!(result.status, CmdStatus::Success);
    }

    #[test]
    fn missing_callback_reports_no_executor() {
        let executor = CmdExecutor::new(LinkId::from_raw(4), None);
        let err = executor
            .execute(
                &OpCounters::default(),
                CmdDesc::new(CmdId::PING, Bytes::new()),
                BlockingMode::MayBlock,
            )
            .expect_err("没有执行回调");
        assert!(matches!(err, IocError::NoCmdExecutor { .. }));
    }

    #[test]
    fn callback_error_is_propagated() {
        let executor = CmdExecutor::new(
            LinkId::from_raw(4),
            Some(Arc::new(|_: LinkId, _: &mut CmdDesc| {
                Err(IocError::NotSupport {
                    operation: "unknown command",
                })
            })),
        );
        let err = executor
            .execute(
                &OpCounters::default(),
                CmdDesc::new(CmdId(99), Bytes::new()),
                BlockingMode::NonBlock,
            )
            .expect_err("回调拒绝");
        assert!(matches!(err, IocError::NotSupport { .. }));
    }
}
