//! # 链路
//!
//! ## 核心意图（Why）
//! - 链路是 IOC 的基本寻址端点：一端由 `connect_service` 创建，另一端由服务接受，两端互为对端；
//! - 链路用途在创建时固定，角色相关的状态（事件队列、数据暂存区、命令执行器）以 [`LinkRole`]
//!   的变体承载，角色不匹配的调用只需一次标签检查即可拒绝。
//!
//! ## 行为契约（What）
//! - 连接状态只沿 [`ConnState::can_transition_to`] 允许的边推进，非法推进视为内部缺陷；
//! - 对端以弱引用保存，任何一端关闭都会把另一端标记为 `Broken` 并唤醒其上的全部等待者；
//! - 链路的 Busy 状态只存在于调用执行期间，见 [`state`]。

pub(crate) mod registry;
pub mod state;

use core::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::command::{CmdExecutor, CmdExecutorFn};
use crate::config::IocConfig;
use crate::data::pipe::{DataInbox, DataOutbox};
use crate::data::{DatCallback, DatDesc};
use crate::error::{IocError, IocResult};
use crate::event::EvtSubscription;
use crate::event::inbox::EventInbox;
use crate::transport::{DataSink, Transport};
use crate::types::{LinkId, SrvId, Usage};

use self::state::{ConnState, LinkState, LinkSubState, OpCounters};

/// 按用途提供的链路参数。
///
/// # 教案式说明
/// - **意图 (Why)**：在连接或上线时一次性声明回调，免去建立链路后的显式订阅/注册步骤；
/// - **契约 (What)**：只有与链路用途匹配的字段会被使用：
///   - `evt_subscriptions`：`EvtConsumer` 链路建立后自动订阅；
///   - `dat_callback`：`DatReceiver` 链路以回调模式接收，此后不可轮询；
///   - `cmd_executor`：`CmdExecutor` 链路的执行回调。
#[derive(Clone, Default)]
pub struct UsageArgs {
    pub evt_subscriptions: Vec<EvtSubscription>,
    pub dat_callback: Option<DatCallback>,
    pub cmd_executor: Option<CmdExecutorFn>,
}

impl UsageArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_evt_subscription(mut self, sub: EvtSubscription) -> Self {
        self.evt_subscriptions.push(sub);
        self
    }

    pub fn with_dat_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(LinkId, &DatDesc) -> IocResult<()> + Send + Sync + 'static,
    {
        self.dat_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_cmd_executor<F>(mut self, executor: F) -> Self
    where
        F: Fn(LinkId, &mut crate::command::CmdDesc) -> IocResult<()> + Send + Sync + 'static,
    {
        self.cmd_executor = Some(Arc::new(executor));
        self
    }
}

impl fmt::Debug for UsageArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageArgs")
            .field("evt_subscriptions", &self.evt_subscriptions.len())
            .field("dat_callback", &self.dat_callback.is_some())
            .field("cmd_executor", &self.cmd_executor.is_some())
            .finish()
    }
}

/// 角色相关的链路状态。
pub(crate) enum LinkRole {
    EvtProducer { next_seq: AtomicU64 },
    EvtConsumer(Arc<EventInbox>),
    DatSender(DataOutbox),
    DatReceiver(DataInbox),
    CmdInitiator,
    CmdExecutor(CmdExecutor),
}

/// 链路在服务关系中的位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkSide {
    /// 由 `connect_service` 创建。
    Client,
    /// 由服务接受。
    Accepted,
}

/// 进程内链路对象。
pub(crate) struct Link {
    id: LinkId,
    usage: Usage,
    service: SrvId,
    side: LinkSide,
    conn: Mutex<ConnState>,
    peer: Mutex<Weak<Link>>,
    transport: OnceLock<Arc<dyn Transport>>,
    ops: Arc<OpCounters>,
    role: LinkRole,
}

impl Link {
    /// 创建处于 `Disconnected` 的链路并应用自动订阅。
    pub(crate) fn new(
        id: LinkId,
        usage: Usage,
        service: SrvId,
        side: LinkSide,
        args: &UsageArgs,
        config: &IocConfig,
    ) -> IocResult<Arc<Self>> {
        let ops = Arc::new(OpCounters::default());
        let role = match usage {
            Usage::EvtProducer => LinkRole::EvtProducer {
                next_seq: AtomicU64::new(1),
            },
            Usage::EvtConsumer => LinkRole::EvtConsumer(Arc::new(EventInbox::new(
                id,
                config.max_evt_queue_depth,
                config.max_subscribers_per_link,
                Arc::clone(&ops),
            ))),
            Usage::DatSender => LinkRole::DatSender(DataOutbox::new(id, config.max_data_queue_size)),
            Usage::DatReceiver => LinkRole::DatReceiver(DataInbox::new(
                id,
                config.max_data_queue_size,
                args.dat_callback.clone(),
            )),
            Usage::CmdInitiator => LinkRole::CmdInitiator,
            Usage::CmdExecutor => LinkRole::CmdExecutor(CmdExecutor::new(id, args.cmd_executor.clone())),
        };
        let link = Arc::new(Self {
            id,
            usage,
            service,
            side,
            conn: Mutex::new(ConnState::Disconnected),
            peer: Mutex::new(Weak::new()),
            transport: OnceLock::new(),
            ops,
            role,
        });
        if let LinkRole::EvtConsumer(inbox) = &link.role {
            for sub in &args.evt_subscriptions {
                if let Err(err) = inbox.subscribe(sub.clone()) {
                    inbox.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(link)
    }

    pub(crate) fn id(&self) -> LinkId {
        self.id
    }

    pub(crate) fn usage(&self) -> Usage {
        self.usage
    }

    pub(crate) fn service(&self) -> SrvId {
        self.service
    }

    pub(crate) fn side(&self) -> LinkSide {
        self.side
    }

    pub(crate) fn role(&self) -> &LinkRole {
        &self.role
    }

    pub(crate) fn ops(&self) -> &OpCounters {
        &self.ops
    }

    pub(crate) fn conn_state(&self) -> ConnState {
        *self.conn.lock()
    }

    pub(crate) fn link_state(&self) -> (LinkState, LinkSubState) {
        (self.ops.link_state(), self.ops.sub_state(self.usage))
    }

    /// 推进连接状态。
    pub(crate) fn transition(&self, target: ConnState) -> IocResult<()> {
        let mut conn = self.conn.lock();
        if !conn.can_transition_to(target) {
            return Err(IocError::bug(format!(
                "illegal connection transition {:?} -> {target:?} on {}",
                *conn, self.id
            )));
        }
        if *conn != target {
            debug!(ioc.link_id = %self.id, from = ?*conn, to = ?target, "link state changed");
        }
        *conn = target;
        Ok(())
    }

    /// 要求链路处于 `Connected`。
    pub(crate) fn ensure_connected(&self) -> IocResult<()> {
        match self.conn_state() {
            ConnState::Connected => Ok(()),
            ConnState::Broken => Err(IocError::LinkBroken { link: self.id }),
            _ => Err(IocError::NotExistLink { link: self.id }),
        }
    }

    /// 绑定服务 URI 协议对应的传输；只在建立连接时调用一次。
    pub(crate) fn bind_transport(&self, transport: Arc<dyn Transport>) {
        let _ = self.transport.set(transport);
    }

    pub(crate) fn transport(&self) -> IocResult<&dyn Transport> {
        self.transport
            .get()
            .map(|transport| &**transport)
            .ok_or_else(|| IocError::bug(format!("{} has no transport bound", self.id)))
    }

    pub(crate) fn pair_with(&self, peer: &Arc<Link>) {
        *self.peer.lock() = Arc::downgrade(peer);
    }

    /// 取得对端；对端已消失时返回 `LinkBroken`。
    pub(crate) fn peer(&self) -> IocResult<Arc<Link>> {
        self.peer
            .lock()
            .upgrade()
            .ok_or(IocError::LinkBroken { link: self.id })
    }

    /// 生产端的事件序号计数器；序号在入队时由消费端队列分配。
    pub(crate) fn seq_counter(&self) -> IocResult<&AtomicU64> {
        match &self.role {
            LinkRole::EvtProducer { next_seq } => Ok(next_seq),
            _ => Err(IocError::NotSupport {
                operation: "post_evt requires an EvtProducer link",
            }),
        }
    }

    /// 对端消失：进入 `Broken` 并唤醒等待者。
    pub(crate) fn mark_broken(&self) {
        {
            let mut conn = self.conn.lock();
            if !conn.can_transition_to(ConnState::Broken) || *conn == ConnState::Broken {
                return;
            }
            *conn = ConnState::Broken;
        }
        *self.peer.lock() = Weak::new();
        info!(ioc.link_id = %self.id, ioc.srv_id = %self.service, "link broken by peer loss");
        match &self.role {
            LinkRole::EvtConsumer(inbox) => inbox.mark_broken(),
            LinkRole::DatSender(outbox) => outbox.shutdown(),
            LinkRole::DatReceiver(inbox) => inbox.shutdown(),
            LinkRole::EvtProducer { .. } | LinkRole::CmdInitiator | LinkRole::CmdExecutor(_) => {}
        }
    }

    /// 优雅关闭：`Disconnecting` → 释放角色资源 → 通知对端 → `Disconnected`。
    pub(crate) fn close(&self) -> IocResult<()> {
        let from = self.conn_state();
        if from == ConnState::Connected {
            self.transition(ConnState::Disconnecting)?;
        }
        match &self.role {
            LinkRole::EvtConsumer(inbox) => inbox.shutdown(),
            LinkRole::DatSender(outbox) => outbox.shutdown(),
            LinkRole::DatReceiver(inbox) => inbox.shutdown(),
            LinkRole::EvtProducer { .. } | LinkRole::CmdInitiator | LinkRole::CmdExecutor(_) => {}
        }
        let peer = std::mem::take(&mut *self.peer.lock()).upgrade();
        if let Some(peer) = peer {
            peer.mark_broken();
        }
        self.transition(ConnState::Disconnected)
    }
}

impl DataSink for Link {
    fn link_id(&self) -> LinkId {
        self.id
    }

    fn offer(&self, chunk: DatDesc) -> Result<(), DatDesc> {
        match &self.role {
            LinkRole::DatReceiver(inbox) => inbox.offer(&self.ops, chunk),
            // 配对时已校验用途互补，其他角色不会成为数据接收端。
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("usage", &self.usage)
            .field("service", &self.service)
            .field("side", &self.side)
            .field("conn", &self.conn_state())
            .finish()
    }
}
