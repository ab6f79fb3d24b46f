//! # 消费端事件队列与分发
//!
//! ## 核心意图（Why）
//! - 每条 `EvtConsumer` 链路持有一个 [`EventInbox`]：生产端投递的事件按 `seq_id` 顺序进入队列，
//!   再由回调（同步投递方或分发线程）或轮询者（`pull_evt`）消费，每个事件只被消费一次；
//! - 回调执行由分发锁串行化，保证回调看到的事件顺序与投递顺序一致。
//!
//! ## 行为契约（What）
//! - 轮询者取队首；回调路径取队列中第一个有订阅者关心的事件，无人订阅的事件留给轮询者；
//! - 队列深度达到上限时，生产端按阻塞模式等待、失败或超时；回调内部的可阻塞投递退化为立即失败，
//!   级联事件因此受容量约束，而不会让分发线程等待自己；
//! - 订阅者列表在每次出队时快照，回调中的订阅/退订只影响之后出队的事件。
//!
//! ## 执行（How）
//! - 异步模式由惰性创建的分发线程驱动；同步投递方持有分发锁，把自己的事件之前（含）可投递的事件依次执行完毕再返回；
//! - 链路关闭时设置 `closed` 并唤醒全部等待者，再回收分发线程；若关闭发生在该线程自己的回调中，则只发信号不等待。

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::dispatch::{self, DispatchScope};
use crate::error::{IocError, IocResult};
use crate::event::subscription::{EvtCallback, EvtSubscription};
use crate::link::state::{BusyKind, OpCounters};
use crate::types::{BlockingMode, EvtDesc, LinkId};
use crate::wait::{WaitDeadline, WaitOutcome};

#[derive(Default)]
struct InboxState {
    queue: VecDeque<EvtDesc>,
    subscribers: Vec<EvtSubscription>,
    /// 链路已关闭，全部操作失败，分发线程退出。
    closed: bool,
    /// 生产端已消失；剩余事件仍可被消费，队列取空后轮询者得到 `LinkBroken`。
    broken: bool,
}

impl InboxState {
    fn deliverable_position(&self, upto: Option<u64>) -> Option<usize> {
        self.queue.iter().position(|desc| {
            upto.is_none_or(|seq| desc.seq_id <= seq)
                && self.subscribers.iter().any(|sub| sub.wants(desc.evt_id))
        })
    }

    fn take_deliverable(&mut self, upto: Option<u64>) -> Option<(EvtDesc, Vec<EvtCallback>)> {
        let pos = self.deliverable_position(upto)?;
        let desc = self.queue.remove(pos)?;
        let callbacks = self
            .subscribers
            .iter()
            .filter(|sub| sub.wants(desc.evt_id))
            .map(|sub| sub.callback().clone())
            .collect();
        Some((desc, callbacks))
    }
}

/// 消费链路的事件队列。
pub(crate) struct EventInbox {
    link: LinkId,
    depth: usize,
    max_subscribers: usize,
    ops: Arc<OpCounters>,
    state: Mutex<InboxState>,
    readable: Condvar,
    writable: Condvar,
    dispatch_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventInbox {
    pub(crate) fn new(
        link: LinkId,
        depth: usize,
        max_subscribers: usize,
        ops: Arc<OpCounters>,
    ) -> Self {
        Self {
            link,
            depth,
            max_subscribers,
            ops,
            state: Mutex::new(InboxState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            dispatch_lock: Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    /// 入队一个事件，并在入队的同一临界区内从 `seq` 分配 `seq_id`。
    ///
    /// - `producer`：投递方链路，用于错误上下文；
    /// - `seq`：生产端的序号计数器；序号只分配给成功入队的事件，队列顺序因此与序号顺序一致；
    /// - `in_callback`：调用方正处于某个回调之中，此时 `MayBlock` 退化为立即失败。
    pub(crate) fn enqueue(
        &self,
        producer: LinkId,
        mut desc: EvtDesc,
        seq: &AtomicU64,
        blocking: BlockingMode,
        in_callback: bool,
    ) -> IocResult<EvtDesc> {
        let blocking = match blocking.normalized() {
            BlockingMode::MayBlock if in_callback => BlockingMode::NonBlock,
            other => other,
        };
        let deadline = WaitDeadline::start(blocking);
        let mut state = self.state.lock();
        loop {
            if state.closed || state.broken {
                return Err(IocError::LinkBroken { link: producer });
            }
            if state.queue.len() < self.depth {
                desc.seq_id = seq.fetch_add(1, Ordering::Relaxed);
                state.queue.push_back(desc);
                self.readable.notify_all();
                trace!(
                    ioc.link_id = %self.link,
                    ioc.evt_id = desc.evt_id.0,
                    ioc.seq_id = desc.seq_id,
                    "event queued"
                );
                return Ok(desc);
            }
            match deadline.wait(&self.writable, &mut state) {
                WaitOutcome::Recheck => continue,
                WaitOutcome::WouldBlock => {
                    debug!(
                        ioc.link_id = %self.link,
                        depth = self.depth,
                        "event queue full"
                    );
                    return Err(IocError::TooManyQueuingEvtDesc {
                        link: self.link,
                        depth: self.depth,
                    });
                }
                WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }

    /// 同步投递：在调用线程上执行直到 `seq_id` 对应事件被消费（或确认无人订阅）。
    pub(crate) fn dispatch_through(&self, producer: LinkId, seq_id: u64) -> IocResult<()> {
        let _serial = self.dispatch_lock.lock();
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(IocError::LinkBroken { link: producer });
                }
                if !state.queue.iter().any(|desc| desc.seq_id == seq_id) {
                    return Ok(());
                }
                state.take_deliverable(Some(seq_id))
            };
            let Some((desc, callbacks)) = next else {
                // 目标事件无人订阅，留在队列中等待轮询者。
                return Ok(());
            };
            self.writable.notify_all();
            self.deliver(&desc, &callbacks);
        }
    }

    /// 轮询取队首事件。
    pub(crate) fn pull(&self, blocking: BlockingMode) -> IocResult<EvtDesc> {
        let deadline = WaitDeadline::start(blocking);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(IocError::LinkBroken { link: self.link });
            }
            if let Some(desc) = state.queue.pop_front() {
                self.writable.notify_all();
                return Ok(desc);
            }
            if state.broken {
                return Err(IocError::LinkBroken { link: self.link });
            }
            match deadline.wait(&self.readable, &mut state) {
                WaitOutcome::Recheck => continue,
                WaitOutcome::WouldBlock => {
                    return Err(IocError::NoEventConsumer { link: self.link });
                }
                WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }

    /// 添加订阅者；必要时启动分发线程。
    pub(crate) fn subscribe(self: &Arc<Self>, sub: EvtSubscription) -> IocResult<()> {
        if sub.evt_ids().is_empty() {
            return Err(IocError::InvalidParam {
                detail: "subscription must list at least one event id",
            });
        }
        let _busy = self.ops.enter(BusyKind::SubEvt);
        self.ensure_worker()?;
        let mut state = self.state.lock();
        if state
            .subscribers
            .iter()
            .any(|existing| existing.is_same_consumer(sub.callback()))
        {
            return Err(IocError::ConflictEvtConsumer { link: self.link });
        }
        if state.subscribers.len() >= self.max_subscribers {
            return Err(IocError::TooMany {
                what: "event subscribers per link",
                limit: self.max_subscribers,
            });
        }
        debug!(ioc.link_id = %self.link, evt_ids = ?sub.evt_ids(), "event subscribed");
        state.subscribers.push(sub);
        self.readable.notify_all();
        Ok(())
    }

    /// 移除订阅者。
    pub(crate) fn unsubscribe(&self, callback: &EvtCallback) -> IocResult<()> {
        let _busy = self.ops.enter(BusyKind::UnsubEvt);
        let mut state = self.state.lock();
        let pos = state
            .subscribers
            .iter()
            .position(|sub| sub.is_same_consumer(callback))
            .ok_or(IocError::NoEventConsumer { link: self.link })?;
        state.subscribers.remove(pos);
        debug!(ioc.link_id = %self.link, "event unsubscribed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 生产端消失：停止接收新事件，唤醒轮询者。
    pub(crate) fn mark_broken(&self) {
        self.state.lock().broken = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// 链路关闭：丢弃剩余事件并回收分发线程。
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            state.subscribers.clear();
            std::mem::take(&mut state.queue).len()
        };
        self.readable.notify_all();
        self.writable.notify_all();
        if dropped > 0 {
            debug!(ioc.link_id = %self.link, dropped, "queued events discarded on close");
        }
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() || dispatch::is_dispatching(self.link) {
            // 在本链路的回调中关闭：分发线程可能正等待调用方持有的分发锁，只发信号，线程看到 closed 后自行退出。
            return;
        }
        if handle.join().is_err() {
            warn!(ioc.link_id = %self.link, "event dispatch worker panicked");
        }
    }

    fn ensure_worker(self: &Arc<Self>) -> IocResult<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Ok(());
        }
        let inbox = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("ioc-evt-{}", self.link.as_raw()))
            .spawn(move || inbox.run_worker())
            .map_err(|err| IocError::bug(format!("failed to spawn event dispatcher: {err}")))?;
        *slot = Some(handle);
        Ok(())
    }

    fn run_worker(&self) {
        trace!(ioc.link_id = %self.link, "event dispatcher started");
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if state.closed {
                        trace!(ioc.link_id = %self.link, "event dispatcher stopped");
                        return;
                    }
                    if state.deliverable_position(None).is_some() {
                        break;
                    }
                    self.readable.wait(&mut state);
                }
            }
            let _serial = self.dispatch_lock.lock();
            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    continue;
                }
                state.take_deliverable(None)
            };
            if let Some((desc, callbacks)) = next {
                self.writable.notify_all();
                self.deliver(&desc, &callbacks);
            }
        }
    }

    fn deliver(&self, desc: &EvtDesc, callbacks: &[EvtCallback]) {
        let _busy = self.ops.enter(BusyKind::CbProcEvt);
        let _scope = DispatchScope::enter(self.link);
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(desc))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(
                    ioc.link_id = %self.link,
                    ioc.evt_id = desc.evt_id.0,
                    ioc.result = err.code(),
                    "event callback returned error"
                ),
                Err(_) => warn!(
                    ioc.link_id = %self.link,
                    ioc.evt_id = desc.evt_id.0,
                    "event callback panicked"
                ),
            }
        }
    }
}
