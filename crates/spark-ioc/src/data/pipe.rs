//! # 数据通道：发送端暂存区与接收端队列
//!
//! ## 核心意图（Why）
//! - 发送端 [`DataOutbox`] 暂存已提交但尚未交付的数据块，接收端 [`DataInbox`] 保存已交付但尚未被轮询取走的数据块，
//!   两者各自以 `MaxDataQueueSize` 字节为上限，背压从接收端逐级传回发送端；
//! - 推进（pump）在发送线程上完成，轮询接收方取走数据后会再次触发推进，不需要额外的后台线程。
//!
//! ## 行为契约（What）
//! - 同一链路上并发的 `send_dat` 以进入暂存区的顺序交付，数据块从不拆分或交错；
//! - 任一时刻只有一个线程在推进某个暂存区；拿不到推进权的线程留下“补推”标记后立即返回，
//!   推进者释放推进权后会检查该标记，因此不会丢失唤醒；
//! - 接收端注册了回调时不保留队列，数据块在推进线程上直接交给回调，回调期间子状态为 `BusyCbRecvDat`。
//!
//! ## 风险提示（Trade-offs）
//! - 回调模式下接收回调运行在发送方线程上，耗时回调会拖慢发送方；需要解耦时应改用轮询模式。

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::data::DatDesc;
use crate::dispatch::DispatchScope;
use crate::error::{IocError, IocResult};
use crate::link::state::{BusyKind, OpCounters};
use crate::transport::{DataSink, Transport};
use crate::types::{BlockingMode, LinkId};
use crate::wait::{WaitDeadline, WaitOutcome};

/// 数据接收回调：参数为接收链路句柄与数据块。
pub type DatCallback = Arc<dyn Fn(LinkId, &DatDesc) -> IocResult<()> + Send + Sync>;

#[derive(Debug, Default)]
struct Staging {
    chunks: VecDeque<DatDesc>,
    bytes: usize,
    closed: bool,
}

/// 发送端暂存区。
pub(crate) struct DataOutbox {
    link: LinkId,
    limit: usize,
    staging: Mutex<Staging>,
    not_full: Condvar,
    drained: Condvar,
    pump_lock: Mutex<()>,
    kick: AtomicBool,
}

impl DataOutbox {
    pub(crate) fn new(link: LinkId, limit: usize) -> Self {
        Self {
            link,
            limit,
            staging: Mutex::new(Staging::default()),
            not_full: Condvar::new(),
            drained: Condvar::new(),
            pump_lock: Mutex::new(()),
            kick: AtomicBool::new(false),
        }
    }

    /// 把数据块放入暂存区，空间不足时按阻塞模式等待。
    ///
    /// - `in_callback` 为真时调用方正处于对端的接收回调中，等待只能靠自己推进，因此 `MayBlock` 退化为立即失败。
    pub(crate) fn stage(
        &self,
        chunk: DatDesc,
        blocking: BlockingMode,
        in_callback: bool,
    ) -> IocResult<()> {
        let blocking = match blocking.normalized() {
            BlockingMode::MayBlock if in_callback => BlockingMode::NonBlock,
            other => other,
        };
        let deadline = WaitDeadline::start(blocking);
        let len = chunk.len();
        let mut staging = self.staging.lock();
        loop {
            if staging.closed {
                return Err(IocError::LinkBroken { link: self.link });
            }
            if staging.bytes + len <= self.limit {
                staging.bytes += len;
                staging.chunks.push_back(chunk);
                trace!(ioc.link_id = %self.link, len, queued = staging.bytes, "data staged");
                return Ok(());
            }
            match deadline.wait(&self.not_full, &mut staging) {
                WaitOutcome::Recheck => continue,
                WaitOutcome::WouldBlock => {
                    return Err(IocError::BufferFull {
                        link: self.link,
                        queued: staging.bytes,
                        limit: self.limit,
                    });
                }
                WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }

    /// 尽可能把暂存数据推进到接收端。
    pub(crate) fn pump(&self, transport: &dyn Transport, sink: &dyn DataSink) {
        self.kick.store(true, Ordering::Release);
        loop {
            let Some(_pumping) = self.pump_lock.try_lock() else {
                return;
            };
            self.kick.store(false, Ordering::Release);
            loop {
                let Some(chunk) = self.staging.lock().chunks.pop_front() else {
                    break;
                };
                let len = chunk.len();
                match transport.transmit(sink, chunk) {
                    Ok(()) => {
                        let mut staging = self.staging.lock();
                        staging.bytes -= len;
                        self.not_full.notify_all();
                        if staging.bytes == 0 {
                            self.drained.notify_all();
                        }
                    }
                    Err(chunk) => {
                        self.staging.lock().chunks.push_front(chunk);
                        break;
                    }
                }
            }
            drop(_pumping);
            if !self.kick.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// 推进后按阻塞模式等待暂存区清空。
    pub(crate) fn flush(
        &self,
        transport: &dyn Transport,
        sink: &dyn DataSink,
        blocking: BlockingMode,
        in_callback: bool,
    ) -> IocResult<()> {
        self.pump(transport, sink);
        let blocking = if in_callback {
            BlockingMode::NonBlock
        } else {
            blocking
        };
        let deadline = WaitDeadline::start(blocking);
        let mut staging = self.staging.lock();
        loop {
            // 以字节计数判定：正在交付途中的数据块已离开队列但尚未被接收端接受。
            if staging.bytes == 0 {
                return Ok(());
            }
            if staging.closed {
                return Err(IocError::LinkBroken { link: self.link });
            }
            match deadline.wait(&self.drained, &mut staging) {
                WaitOutcome::Recheck => continue,
                // 非阻塞刷新只负责推进，剩余数据留待接收端腾出空间。
                WaitOutcome::WouldBlock => return Ok(()),
                WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }

    /// 暂存区中尚未交付的字节数。
    #[cfg(test)]
    pub(crate) fn queued_bytes(&self) -> usize {
        self.staging.lock().bytes
    }

    /// 链路关闭或断开：拒绝新数据并唤醒全部等待者。
    pub(crate) fn shutdown(&self) {
        let mut staging = self.staging.lock();
        staging.closed = true;
        let dropped = staging.chunks.len();
        self.not_full.notify_all();
        self.drained.notify_all();
        if dropped > 0 {
            debug!(ioc.link_id = %self.link, dropped, "staged data discarded on shutdown");
        }
    }
}

#[derive(Debug, Default)]
struct Inbound {
    chunks: VecDeque<DatDesc>,
    bytes: usize,
    closed: bool,
}

/// 接收端队列（轮询模式）或回调入口（回调模式）。
pub(crate) struct DataInbox {
    link: LinkId,
    limit: usize,
    callback: Option<DatCallback>,
    inbound: Mutex<Inbound>,
    not_empty: Condvar,
    callback_lock: Mutex<()>,
}

impl DataInbox {
    pub(crate) fn new(link: LinkId, limit: usize, callback: Option<DatCallback>) -> Self {
        Self {
            link,
            limit,
            callback,
            inbound: Mutex::new(Inbound::default()),
            not_empty: Condvar::new(),
            callback_lock: Mutex::new(()),
        }
    }

    pub(crate) fn is_callback_mode(&self) -> bool {
        self.callback.is_some()
    }

    /// 接收一块数据：回调模式直接执行回调，轮询模式在容量允许时入队。
    pub(crate) fn offer(&self, ops: &OpCounters, chunk: DatDesc) -> Result<(), DatDesc> {
        if let Some(callback) = &self.callback {
            let _serial = self.callback_lock.lock();
            let _busy = ops.enter(BusyKind::CbRecvDat);
            let _scope = DispatchScope::enter(self.link);
            match catch_unwind(AssertUnwindSafe(|| callback(self.link, &chunk))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(ioc.link_id = %self.link, ioc.result = err.code(), "data callback returned error");
                }
                Err(_) => warn!(ioc.link_id = %self.link, "data callback panicked"),
            }
            return Ok(());
        }
        let mut inbound = self.inbound.lock();
        if inbound.closed {
            return Ok(());
        }
        let len = chunk.len();
        if inbound.bytes + len > self.limit {
            return Err(chunk);
        }
        inbound.bytes += len;
        inbound.chunks.push_back(chunk);
        self.not_empty.notify_all();
        Ok(())
    }

    /// 轮询接收一块数据。
    pub(crate) fn recv(&self, blocking: BlockingMode) -> IocResult<DatDesc> {
        let deadline = WaitDeadline::start(blocking);
        let mut inbound = self.inbound.lock();
        loop {
            if let Some(chunk) = inbound.chunks.pop_front() {
                inbound.bytes -= chunk.len();
                return Ok(chunk);
            }
            if inbound.closed {
                return Err(IocError::LinkBroken { link: self.link });
            }
            match deadline.wait(&self.not_empty, &mut inbound) {
                WaitOutcome::Recheck => continue,
                WaitOutcome::WouldBlock => return Err(IocError::NoData { link: self.link }),
                WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }

    /// 停止接收新数据并唤醒轮询者；已排队的数据仍可被取走。
    pub(crate) fn shutdown(&self) {
        self.inbound.lock().closed = true;
        self.not_empty.notify_all();
    }
}
