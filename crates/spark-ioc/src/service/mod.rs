//! # 服务：连接接受者与已接受链路的登记簿
//!
//! ## 核心意图（Why）
//! - 服务以 URI 为目录键对外暴露，负责把入站连接请求提升为已接受链路，并在整个在线期间跟踪这些链路；
//! - 接受模式分为手动（应用调用 `accept_client`）与自动（服务自有的守护线程持续接受），两者共享同一条待接受队列。
//!
//! ## 状态机（What）
//! - `NotExist → Online → Offline`，不可逆：下线后的 `SrvId` 永远返回 `NotExistService`，重新上线得到新句柄；
//! - 服务状态（在线与否、能力位、标志位）不受链路建立、出错或关闭的影响。
//!
//! ## 执行（How）
//! - 连接请求以 [`PendingConnect`] 排队，阶段 `Pending → Claimed → Done` 由接受方推进；
//!   连接方超时只在 `Pending` 阶段撤回请求，已被认领的请求必然等到结果，因此不会出现“接受方建好了链路而连接方已放弃”的悬挂状态；
//! - 下线时先标记 `offline` 再排空待接受队列与已接受列表，与并发的接受操作在同一把锁上串行。

pub(crate) mod daemon;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{IocError, IocResult};
use crate::link::{Link, UsageArgs};
use crate::transport::SrvUri;
use crate::types::{EvtDesc, LinkId, ServiceFlags, SrvId, Usage, UsageCapabilities};
use crate::wait::{WaitDeadline, WaitOutcome};

/// `online_service` 的参数。
#[derive(Clone, Debug)]
pub struct ServiceArgs {
    pub uri: SrvUri,
    pub capabilities: UsageCapabilities,
    pub flags: ServiceFlags,
    /// 已接受链路使用的用途参数（自动订阅、数据回调、命令执行回调）。
    pub usage_args: UsageArgs,
}

impl ServiceArgs {
    pub fn new(uri: SrvUri, capabilities: UsageCapabilities) -> Self {
        Self {
            uri,
            capabilities,
            flags: ServiceFlags::default(),
            usage_args: UsageArgs::default(),
        }
    }

    pub fn with_flags(mut self, flags: ServiceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_usage_args(mut self, usage_args: UsageArgs) -> Self {
        self.usage_args = usage_args;
        self
    }
}

/// `connect_service` 的参数。
#[derive(Clone, Debug)]
pub struct ConnectArgs {
    pub uri: SrvUri,
    /// 连接方链路的用途；服务端链路取其互补用途。
    pub usage: Usage,
    pub usage_args: UsageArgs,
}

impl ConnectArgs {
    pub fn new(uri: SrvUri, usage: Usage) -> Self {
        Self {
            uri,
            usage,
            usage_args: UsageArgs::default(),
        }
    }

    pub fn with_usage_args(mut self, usage_args: UsageArgs) -> Self {
        self.usage_args = usage_args;
        self
    }
}

/// 在线服务的接受模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptMode {
    Manual,
    Auto,
}

/// `get_service_state` 的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceState {
    pub uri: SrvUri,
    pub capabilities: UsageCapabilities,
    pub flags: ServiceFlags,
    pub accept_mode: AcceptMode,
    pub connected_link_count: usize,
}

#[derive(Debug)]
enum ConnectPhase {
    Pending,
    Claimed,
    Done(IocResult<()>),
    Withdrawn,
}

/// 一条等待被接受的连接请求。
#[derive(Debug)]
pub(crate) struct PendingConnect {
    client: Arc<Link>,
    phase: Mutex<ConnectPhase>,
    settled: Condvar,
}

impl PendingConnect {
    fn new(client: Arc<Link>) -> Arc<Self> {
        Arc::new(Self {
            client,
            phase: Mutex::new(ConnectPhase::Pending),
            settled: Condvar::new(),
        })
    }

    pub(crate) fn client(&self) -> &Arc<Link> {
        &self.client
    }

    /// 接受方认领请求；请求已被撤回或已有结果时返回 `false`。
    pub(crate) fn claim(&self) -> bool {
        let mut phase = self.phase.lock();
        if matches!(*phase, ConnectPhase::Pending) {
            *phase = ConnectPhase::Claimed;
            true
        } else {
            false
        }
    }

    /// 写入结果并唤醒连接方。
    pub(crate) fn settle(&self, result: IocResult<()>) {
        let mut phase = self.phase.lock();
        if matches!(*phase, ConnectPhase::Pending | ConnectPhase::Claimed) {
            *phase = ConnectPhase::Done(result);
            self.settled.notify_all();
        }
    }

    /// 连接方等待结果；在 `Pending` 阶段超时会撤回请求。
    pub(crate) fn wait(&self, deadline: &WaitDeadline) -> IocResult<()> {
        let mut phase = self.phase.lock();
        loop {
            let claimed = match &*phase {
                ConnectPhase::Done(result) => return result.clone(),
                ConnectPhase::Withdrawn => {
                    return Err(IocError::bug("connect request withdrawn twice"));
                }
                ConnectPhase::Claimed => true,
                ConnectPhase::Pending => false,
            };
            if claimed {
                self.settled.wait(&mut phase);
                continue;
            }
            match deadline.wait(&self.settled, &mut phase) {
                WaitOutcome::Recheck => {}
                WaitOutcome::WouldBlock | WaitOutcome::Expired => {
                    *phase = ConnectPhase::Withdrawn;
                    return Err(IocError::Timeout);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct PendingQueue {
    queue: VecDeque<Arc<PendingConnect>>,
    offline: bool,
}

#[derive(Debug, Default)]
struct AcceptedLinks {
    ids: Vec<LinkId>,
    offline: bool,
}

/// 在线服务的内部对象。
#[derive(Debug)]
pub(crate) struct ServiceCore {
    id: SrvId,
    uri: SrvUri,
    capabilities: UsageCapabilities,
    flags: ServiceFlags,
    usage_args: UsageArgs,
    pending: Mutex<PendingQueue>,
    arrived: Condvar,
    accepted: Mutex<AcceptedLinks>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
    broadcast_tx: Mutex<Option<mpsc::Sender<EvtDesc>>>,
}

impl ServiceCore {
    pub(crate) fn new(id: SrvId, args: ServiceArgs) -> Self {
        Self {
            id,
            uri: args.uri,
            capabilities: args.capabilities,
            flags: args.flags,
            usage_args: args.usage_args,
            pending: Mutex::new(PendingQueue::default()),
            arrived: Condvar::new(),
            accepted: Mutex::new(AcceptedLinks::default()),
            daemons: Mutex::new(Vec::new()),
            broadcast_tx: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> SrvId {
        self.id
    }

    pub(crate) fn uri(&self) -> &SrvUri {
        &self.uri
    }

    pub(crate) fn flags(&self) -> ServiceFlags {
        self.flags
    }

    pub(crate) fn usage_args(&self) -> &UsageArgs {
        &self.usage_args
    }

    pub(crate) fn accept_mode(&self) -> AcceptMode {
        if self.flags.contains(ServiceFlags::AUTO_ACCEPT) {
            AcceptMode::Auto
        } else {
            AcceptMode::Manual
        }
    }

    /// 连接方用途必须与服务能力互补。
    pub(crate) fn check_usage(&self, usage: Usage) -> IocResult<()> {
        if self.capabilities.contains(usage.peer().capability()) {
            Ok(())
        } else {
            Err(IocError::IncompatibleUsage {
                service: self.id,
                usage,
            })
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        ServiceState {
            uri: self.uri.clone(),
            capabilities: self.capabilities,
            flags: self.flags,
            accept_mode: self.accept_mode(),
            connected_link_count: self.accepted.lock().ids.len(),
        }
    }

    /// 排入一条连接请求。
    pub(crate) fn enqueue(&self, client: Arc<Link>) -> IocResult<Arc<PendingConnect>> {
        let mut pending = self.pending.lock();
        if pending.offline {
            return Err(IocError::NotExistService { service: self.id });
        }
        let request = PendingConnect::new(client);
        pending.queue.push_back(Arc::clone(&request));
        self.arrived.notify_all();
        Ok(request)
    }

    /// 从队列中移除已撤回的请求。
    pub(crate) fn withdraw(&self, request: &Arc<PendingConnect>) {
        self.pending
            .lock()
            .queue
            .retain(|queued| !Arc::ptr_eq(queued, request));
    }

    /// 取出下一条待接受请求，按阻塞模式等待。
    pub(crate) fn take_pending(&self, deadline: &WaitDeadline) -> IocResult<Arc<PendingConnect>> {
        let mut pending = self.pending.lock();
        loop {
            if pending.offline {
                return Err(IocError::NotExistService { service: self.id });
            }
            if let Some(request) = pending.queue.pop_front() {
                return Ok(request);
            }
            match deadline.wait(&self.arrived, &mut pending) {
                WaitOutcome::Recheck => continue,
                WaitOutcome::WouldBlock | WaitOutcome::Expired => return Err(IocError::Timeout),
            }
        }
    }

    /// 在 `accepted` 锁内登记新链路；服务已下线时返回 `NotExistService`。
    pub(crate) fn admit<F>(&self, register: F) -> IocResult<LinkId>
    where
        F: FnOnce() -> IocResult<LinkId>,
    {
        let mut accepted = self.accepted.lock();
        if accepted.offline {
            return Err(IocError::NotExistService { service: self.id });
        }
        let id = register()?;
        accepted.ids.push(id);
        Ok(id)
    }

    /// 链路关闭后从已接受列表中移除。
    pub(crate) fn forget(&self, link: LinkId) {
        self.accepted.lock().ids.retain(|id| *id != link);
    }

    /// 把已接受链路写入调用方缓冲，返回真实总数。
    pub(crate) fn copy_link_ids(&self, buf: &mut [LinkId]) -> usize {
        let accepted = self.accepted.lock();
        for (slot, id) in buf.iter_mut().zip(accepted.ids.iter()) {
            *slot = *id;
        }
        accepted.ids.len()
    }

    pub(crate) fn link_ids(&self) -> Vec<LinkId> {
        self.accepted.lock().ids.clone()
    }

    pub(crate) fn attach_daemon(&self, handle: JoinHandle<()>) {
        self.daemons.lock().push(handle);
    }

    pub(crate) fn set_broadcast_sender(&self, tx: mpsc::Sender<EvtDesc>) {
        *self.broadcast_tx.lock() = Some(tx);
    }

    /// 把事件交给广播线程。
    pub(crate) fn broadcast(&self, desc: EvtDesc) -> IocResult<()> {
        let guard = self.broadcast_tx.lock();
        let tx = guard.as_ref().ok_or(IocError::NotSupport {
            operation: "broadcast_evt requires ServiceFlags::BROADCAST_EVENT",
        })?;
        tx.send(desc)
            .map_err(|_| IocError::NotExistService { service: self.id })
    }

    /// 下线：拒绝新请求，让待接受请求失败，停止并回收守护线程，返回已接受链路。
    pub(crate) fn go_offline(&self) -> Vec<LinkId> {
        let abandoned = {
            let mut pending = self.pending.lock();
            pending.offline = true;
            std::mem::take(&mut pending.queue)
        };
        self.arrived.notify_all();
        for request in abandoned {
            request.settle(Err(IocError::NotExistService { service: self.id }));
        }
        self.broadcast_tx.lock().take();

        let daemons = std::mem::take(&mut *self.daemons.lock());
        for handle in daemons {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!(ioc.srv_id = %self.id, "service daemon panicked");
            }
        }

        let mut accepted = self.accepted.lock();
        accepted.offline = true;
        let ids = std::mem::take(&mut accepted.ids);
        debug!(ioc.srv_id = %self.id, links = ids.len(), "service accepted links released");
        ids
    }
}

/// 在线服务表与 URI 目录。
#[derive(Debug)]
pub(crate) struct ServiceTable {
    services: DashMap<SrvId, Arc<ServiceCore>>,
    directory: DashMap<SrvUri, SrvId>,
    next_id: AtomicU64,
    online: AtomicUsize,
    limit: usize,
}

impl ServiceTable {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            services: DashMap::new(),
            directory: DashMap::new(),
            next_id: AtomicU64::new(1),
            online: AtomicUsize::new(0),
            limit,
        }
    }

    /// 绑定 URI 并登记服务。
    pub(crate) fn register(&self, args: ServiceArgs) -> IocResult<Arc<ServiceCore>> {
        match self.directory.entry(args.uri.clone()) {
            Entry::Occupied(occupied) => Err(IocError::ConflictSrvArgs {
                uri: args.uri.to_string(),
                existing: *occupied.get(),
            }),
            Entry::Vacant(vacant) => {
                self.online
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        (current < self.limit).then_some(current + 1)
                    })
                    .map_err(|_| IocError::TooMany {
                        what: "services",
                        limit: self.limit,
                    })?;
                let id = SrvId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
                let core = Arc::new(ServiceCore::new(id, args));
                self.services.insert(id, Arc::clone(&core));
                vacant.insert(id);
                Ok(core)
            }
        }
    }

    pub(crate) fn get(&self, id: SrvId) -> IocResult<Arc<ServiceCore>> {
        if id.is_invalid() {
            return Err(IocError::InvalidParam {
                detail: "SrvId::INVALID",
            });
        }
        self.services
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(IocError::NotExistService { service: id })
    }

    pub(crate) fn lookup(&self, uri: &SrvUri) -> IocResult<Arc<ServiceCore>> {
        let id = self
            .directory
            .get(uri)
            .map(|entry| *entry.value())
            .ok_or(IocError::NotExistService {
                service: SrvId::INVALID,
            })?;
        self.get(id)
    }

    /// 注销服务并解除 URI 绑定。
    pub(crate) fn remove(&self, id: SrvId) -> IocResult<Arc<ServiceCore>> {
        if id.is_invalid() {
            return Err(IocError::InvalidParam {
                detail: "SrvId::INVALID",
            });
        }
        let (_, core) = self
            .services
            .remove(&id)
            .ok_or(IocError::NotExistService { service: id })?;
        self.directory
            .remove_if(core.uri(), |_, bound| *bound == id);
        self.online.fetch_sub(1, Ordering::AcqRel);
        Ok(core)
    }

    pub(crate) fn ids(&self) -> Vec<SrvId> {
        self.services.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(path: &str) -> ServiceArgs {
        ServiceArgs::new(SrvUri::fifo(path), UsageCapabilities::EVT_PRODUCER)
    }

    #[test]
    fn uri_conflict_is_reported_with_existing_id() {
        let table = ServiceTable::new(4);
        let first = table.register(args("a")).expect("上线");
        let err = table.register(args("a")).expect_err("URI 冲突");
        assert_eq!(
            err,
            IocError::ConflictSrvArgs {
                uri: "fifo://localprocess/a".to_owned(),
                existing: first.id(),
            }
        );
    }

    #[test]
    fn removed_service_releases_uri_and_capacity() {
        let table = ServiceTable::new(1);
        let core = table.register(args("a")).expect("上线");
        assert!(matches!(
            table.register(args("b")),
            Err(IocError::TooMany { what: "services", .. })
        ));
        table.remove(core.id()).expect("下线");
        assert!(matches!(
            table.remove(core.id()),
            Err(IocError::NotExistService { .. })
        ));
        let again = table.register(args("a")).expect("URI 已释放");
        assert_ne!(again.id(), core.id(), "句柄不复用");
    }

    #[test]
    fn incompatible_usage_is_detected() {
        let core = ServiceCore::new(SrvId::from_raw(1), args("x"));
        assert!(core.check_usage(Usage::EvtConsumer).is_ok());
        assert!(matches!(
            core.check_usage(Usage::DatSender),
            Err(IocError::IncompatibleUsage { .. })
        ));
    }

    #[test]
    fn accept_timeout_leaves_queue_usable() {
        let core = ServiceCore::new(SrvId::from_raw(1), args("x"));
        let deadline = WaitDeadline::start(crate::types::BlockingMode::Timeout(
            std::time::Duration::from_millis(10),
        ));
        assert_eq!(core.take_pending(&deadline).map(|_| ()), Err(IocError::Timeout));
        assert!(core.go_offline().is_empty());
        let deadline = WaitDeadline::start(crate::types::BlockingMode::NonBlock);
        assert!(matches!(
            core.take_pending(&deadline),
            Err(IocError::NotExistService { .. })
        ));
    }
}
