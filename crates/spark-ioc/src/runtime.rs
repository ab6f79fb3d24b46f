//! # IocRuntime：IOC 全部入口的显式句柄
//!
//! ## 核心意图（Why）
//! - 链路表、服务表与传输注册表都挂在一个显式的运行时对象上，测试之间互不干扰，也不存在进程级单例；
//! - 每个入口按统一顺序校验参数：哨兵句柄 → 句柄存在 → 链路用途 → 连接状态 → 数据边界，
//!   同一个错误输入无论与何种其他问题组合，得到的结果码都可预测。
//!
//! ## 行为契约（What）
//! - `IocRuntime` 可廉价克隆，克隆共享同一份内部状态；
//! - 最后一个句柄析构时下线全部服务并关闭全部链路，守护线程与分发线程在此之前被回收；
//! - 失败的调用不改变任何状态（超时、背压拒绝、校验失败均无副作用）。
//!
//! ## 风险提示（Trade-offs）
//! - 回调闭包若捕获 `IocRuntime` 克隆，会与运行时形成引用环，运行时只能在显式 `offline_service`/`close_link`
//!   之后释放对应资源。

use core::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityDescription, CapabilityId};
use crate::command::CmdDesc;
use crate::config::{ConfigError, IocConfig};
use crate::data::DatDesc;
use crate::dispatch;
use crate::error::{IocError, IocResult};
use crate::event::EvtSubscription;
use crate::link::registry::{LinkTable, Reservation};
use crate::link::state::{BusyKind, ConnState, LinkState, LinkSubState};
use crate::link::{Link, LinkRole, LinkSide};
use crate::service::daemon;
use crate::service::{AcceptMode, ConnectArgs, PendingConnect, ServiceArgs, ServiceCore, ServiceState, ServiceTable};
use crate::transport::{FifoTransport, Transport};
use crate::types::{EvtDesc, IocOptions, LinkId, ServiceFlags, SrvId, Usage};
use crate::wait::WaitDeadline;

/// IOC 运行时句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：把连接型 IOC 的全部操作（服务上下线、连接与接受、事件、数据、命令、能力查询）
///   集中在一个类型上，调用方只需持有它即可完成端到端通信；
/// - **契约 (What)**：所有方法都可以从任意线程并发调用；可阻塞方法的等待语义由 [`IocOptions`] 决定；
/// - **执行 (How)**：内部以 `Arc<RuntimeInner>` 共享状态，服务守护线程只持有弱引用。
#[derive(Clone, Debug)]
pub struct IocRuntime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    config: IocConfig,
    links: LinkTable,
    services: ServiceTable,
    transports: DashMap<&'static str, Arc<dyn Transport>>,
}

impl fmt::Debug for RuntimeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("config", &self.config)
            .field("links", &self.links.len())
            .field("transports", &self.transports.len())
            .finish()
    }
}

impl IocRuntime {
    /// 以校验后的配置构造运行时，并注册进程内 FIFO 传输。
    pub fn new(config: IocConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// 使用默认限额构造运行时。
    pub fn with_defaults() -> Self {
        Self::build(IocConfig::default())
    }

    fn build(config: IocConfig) -> Self {
        let inner = RuntimeInner {
            links: LinkTable::new(config.max_links),
            services: ServiceTable::new(config.max_services),
            transports: DashMap::new(),
            config,
        };
        let fifo: Arc<dyn Transport> = Arc::new(FifoTransport);
        inner.transports.insert(fifo.protocol(), fifo);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &IocConfig {
        &self.inner.config
    }

    /// 注册（或替换）某个协议的传输实现。
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let protocol = transport.protocol();
        if self.inner.transports.insert(protocol, transport).is_some() {
            debug!(protocol, "transport replaced");
        }
    }

    /// 当前存活的链路数。
    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    // ---------------------------------------------------------------------
    // 服务
    // ---------------------------------------------------------------------

    /// 上线服务。
    ///
    /// - **契约 (What)**：能力位为空返回 `InvalidParam`；协议没有注册传输返回 `NotSupport`；
    ///   URI 已被绑定返回 `ConflictSrvArgs`；在线服务数达到上限返回 `TooMany`；
    /// - **执行 (How)**：登记成功后按标志位启动自动接受与广播线程，启动失败会撤销本次上线。
    pub fn online_service(&self, args: ServiceArgs) -> IocResult<SrvId> {
        if args.capabilities.is_empty() {
            return Err(IocError::InvalidParam {
                detail: "service capabilities must not be empty",
            });
        }
        let transport = self.inner.transport_for(args.uri.protocol())?;
        transport.check_uri(&args.uri)?;
        let core = self.inner.services.register(args)?;
        if let Err(err) = self.start_daemons(&core) {
            let _ = self.offline_service(core.id());
            return Err(err);
        }
        info!(
            ioc.srv_id = %core.id(),
            ioc.uri = %core.uri(),
            flags = ?core.flags(),
            "service online"
        );
        Ok(core.id())
    }

    fn start_daemons(&self, core: &Arc<ServiceCore>) -> IocResult<()> {
        if core.accept_mode() == AcceptMode::Auto {
            let handle = daemon::spawn_auto_accept(
                Arc::downgrade(&self.inner),
                Arc::clone(core),
                self.inner.config.auto_accept_poll_interval(),
            )
            .map_err(|err| IocError::bug(format!("failed to spawn auto-accept daemon: {err}")))?;
            core.attach_daemon(handle);
        }
        if core.flags().contains(ServiceFlags::BROADCAST_EVENT) {
            let (tx, handle) = daemon::spawn_broadcast(Arc::downgrade(&self.inner), Arc::clone(core))
                .map_err(|err| IocError::bug(format!("failed to spawn broadcast daemon: {err}")))?;
            core.set_broadcast_sender(tx);
            core.attach_daemon(handle);
        }
        Ok(())
    }

    /// 下线服务。
    ///
    /// - **契约 (What)**：重复下线返回 `NotExistService`；等待中的连接方得到 `NotExistService`；
    ///   已接受链路默认被关闭（对端随之进入 `Broken`），带 `KEEP_ACCEPTED_LINK` 时保留为独立链路；
    /// - **执行 (How)**：先解除 URI 绑定，新的连接请求立即失败，再回收守护线程，最后处理已接受链路。
    pub fn offline_service(&self, srv: SrvId) -> IocResult<()> {
        let core = self.inner.services.remove(srv)?;
        self.inner.retire_service(&core);
        Ok(())
    }

    pub fn get_service_state(&self, srv: SrvId) -> IocResult<ServiceState> {
        Ok(self.inner.services.get(srv)?.state())
    }

    /// 把已接受链路写入 `buf`（最多 `buf.len()` 个），返回真实总数。
    pub fn get_service_link_ids(&self, srv: SrvId, buf: &mut [LinkId]) -> IocResult<usize> {
        Ok(self.inner.services.get(srv)?.copy_link_ids(buf))
    }

    pub fn service_link_ids(&self, srv: SrvId) -> IocResult<Vec<LinkId>> {
        Ok(self.inner.services.get(srv)?.link_ids())
    }

    /// 手动接受一条连接。
    ///
    /// - 自动接受的服务返回 `NotSupport`；
    /// - 队列为空时按阻塞模式等待：`NonBlock` 与到期的 `Timeout` 都返回 `Timeout`，队列状态保持不变。
    pub fn accept_client(&self, srv: SrvId, options: IocOptions) -> IocResult<LinkId> {
        let core = self.inner.services.get(srv)?;
        if core.accept_mode() == AcceptMode::Auto {
            return Err(IocError::NotSupport {
                operation: "accept_client on an AUTO_ACCEPT service",
            });
        }
        let deadline = WaitDeadline::start(options.blocking);
        loop {
            let request = core.take_pending(&deadline)?;
            // 连接方已超时撤回的请求直接跳过。
            if let Some(link) = self.inner.promote(&core, &request)? {
                return Ok(link);
            }
        }
    }

    /// 连接服务。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：URI 无服务返回 `NotExistService`；服务缺少互补能力返回 `IncompatibleUsage`；
    ///   链路数达到上限返回 `TooMany`；在给定阻塞模式内未被接受返回 `Timeout` 并撤回请求；
    /// - **执行 (How)**：客户端链路先进入 `Connecting` 并排入服务的待接受队列，接受方完成配对后双方同时进入
    ///   `Connected`，随后客户端链路才登记到链路表，失败路径不会留下半建立的链路。
    pub fn connect_service(&self, args: ConnectArgs, options: IocOptions) -> IocResult<LinkId> {
        let core = self.inner.services.lookup(&args.uri)?;
        core.check_usage(args.usage)?;
        let transport = self.inner.transport_for(core.uri().protocol())?;
        let reservation = self.inner.links.reserve()?;
        let client = Link::new(
            reservation.id(),
            args.usage,
            core.id(),
            LinkSide::Client,
            &args.usage_args,
            &self.inner.config,
        )?;
        client.bind_transport(transport);
        client.transition(ConnState::Connecting)?;

        let request = match core.enqueue(Arc::clone(&client)) {
            Ok(request) => request,
            Err(err) => {
                let _ = client.close();
                return Err(err);
            }
        };
        let deadline = WaitDeadline::start(options.blocking);
        match request.wait(&deadline) {
            Ok(()) => {
                let id = self.inner.commit_client(reservation, &client)?;
                info!(
                    ioc.link_id = %id,
                    ioc.srv_id = %core.id(),
                    ioc.usage = args.usage.as_str(),
                    "link connected"
                );
                Ok(id)
            }
            Err(err) => {
                if err == IocError::Timeout {
                    core.withdraw(&request);
                }
                let _ = client.close();
                debug!(ioc.srv_id = %core.id(), ioc.result = err.code(), "connect failed");
                Err(err)
            }
        }
    }

    // ---------------------------------------------------------------------
    // 链路
    // ---------------------------------------------------------------------

    /// 关闭链路并立即释放句柄；对端链路进入 `Broken`。
    pub fn close_link(&self, link: LinkId) -> IocResult<()> {
        self.inner.close_link(link)
    }

    /// 查询连接状态；从不阻塞。
    pub fn get_link_conn_state(&self, link: LinkId) -> IocResult<ConnState> {
        Ok(self.inner.links.get(link)?.conn_state())
    }

    /// 查询操作主状态与子状态；从不阻塞。
    pub fn get_link_state(&self, link: LinkId) -> IocResult<(LinkState, LinkSubState)> {
        Ok(self.inner.links.get(link)?.link_state())
    }

    pub fn get_link_usage(&self, link: LinkId) -> IocResult<Usage> {
        Ok(self.inner.links.get(link)?.usage())
    }

    // ---------------------------------------------------------------------
    // 事件
    // ---------------------------------------------------------------------

    /// 投递事件，返回分配的 `seq_id`。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 同步模式在返回前执行完消费端的回调（除非轮询者先取走了事件）；
    ///   - 同步投递的目标正在当前线程上执行回调时返回 `ForbiddenInCallback`，不产生任何副作用；
    ///   - 消费端队列已满时按阻塞模式等待，`NonBlock` 返回 `TooManyQueuingEvtDesc`；
    /// - **风险 (Trade-offs)**：两个线程在各自回调中交叉同步投递到对方链路属于应用层环路，本层不做检测。
    pub fn post_evt(&self, link: LinkId, desc: EvtDesc, options: IocOptions) -> IocResult<u64> {
        self.inner.post_evt(link, desc, options)
    }

    /// 为消费链路添加订阅。
    pub fn sub_evt(&self, link: LinkId, sub: EvtSubscription) -> IocResult<()> {
        let consumer = self.inner.links.get(link)?;
        let LinkRole::EvtConsumer(inbox) = consumer.role() else {
            return Err(IocError::NotSupport {
                operation: "sub_evt requires an EvtConsumer link",
            });
        };
        consumer.ensure_connected()?;
        inbox.subscribe(sub)
    }

    /// 移除以同一回调注册的订阅。
    pub fn unsub_evt(&self, link: LinkId, sub: &EvtSubscription) -> IocResult<()> {
        let consumer = self.inner.links.get(link)?;
        let LinkRole::EvtConsumer(inbox) = consumer.role() else {
            return Err(IocError::NotSupport {
                operation: "unsub_evt requires an EvtConsumer link",
            });
        };
        inbox.unsubscribe(sub.callback())
    }

    /// 轮询取事件。
    ///
    /// 队列为空时：`NonBlock` 返回 `NoEventConsumer`，`Timeout` 到期返回 `Timeout`，`MayBlock` 等到事件或链路断开。
    /// 对端断开后仍可取走剩余事件。
    pub fn pull_evt(&self, link: LinkId, options: IocOptions) -> IocResult<EvtDesc> {
        let consumer = self.inner.links.get(link)?;
        let LinkRole::EvtConsumer(inbox) = consumer.role() else {
            return Err(IocError::NotSupport {
                operation: "pull_evt requires an EvtConsumer link",
            });
        };
        inbox.pull(options.blocking)
    }

    /// 通过服务的广播线程向全部已接受链路异步投递事件。
    pub fn broadcast_evt(&self, srv: SrvId, desc: EvtDesc) -> IocResult<()> {
        let core = self.inner.services.get(srv)?;
        if !core.flags().contains(ServiceFlags::BROADCAST_EVENT) {
            return Err(IocError::NotSupport {
                operation: "broadcast_evt requires ServiceFlags::BROADCAST_EVENT",
            });
        }
        core.broadcast(desc)
    }

    // ---------------------------------------------------------------------
    // 数据
    // ---------------------------------------------------------------------

    /// 发送一块数据。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：零长度返回 `ZeroData`，超过 `max_data_queue_size` 返回 `DataTooLarge`，两者都不入队；
    ///   暂存区已满时按阻塞模式等待，`NonBlock` 返回 `BufferFull`；
    /// - **执行 (How)**：数据块整体进入发送端暂存区后立即尝试推进到接收端，
    ///   接收端队列满时留在暂存区，由接收方的 `recv_dat` 或发送方的 `flush_dat` 继续推进。
    pub fn send_dat(&self, link: LinkId, desc: DatDesc, options: IocOptions) -> IocResult<()> {
        let sender = self.inner.links.get(link)?;
        let LinkRole::DatSender(outbox) = sender.role() else {
            return Err(IocError::NotSupport {
                operation: "send_dat requires a DatSender link",
            });
        };
        sender.ensure_connected()?;
        if desc.is_empty() {
            return Err(IocError::ZeroData);
        }
        let limit = self.inner.config.max_data_queue_size;
        if desc.len() > limit {
            return Err(IocError::DataTooLarge {
                size: desc.len(),
                limit,
            });
        }
        let desc = desc.repack(self.inner.config.embedded_data_threshold);
        let receiver = sender.peer()?;
        let _busy = sender.ops().enter(BusyKind::SendDat);
        outbox.stage(desc, options.blocking, dispatch::is_dispatching(receiver.id()))?;
        outbox.pump(sender.transport()?, &*receiver);
        Ok(())
    }

    /// 轮询接收一块数据。
    ///
    /// 以回调模式接收的链路返回 `NotSupport`；队列为空时 `NonBlock` 返回 `NoData`。
    pub fn recv_dat(&self, link: LinkId, options: IocOptions) -> IocResult<DatDesc> {
        let receiver = self.inner.links.get(link)?;
        let LinkRole::DatReceiver(inbox) = receiver.role() else {
            return Err(IocError::NotSupport {
                operation: "recv_dat requires a DatReceiver link",
            });
        };
        if inbox.is_callback_mode() {
            return Err(IocError::NotSupport {
                operation: "recv_dat on a callback-mode DatReceiver",
            });
        }
        let _busy = receiver.ops().enter(BusyKind::RecvDat);
        let chunk = inbox.recv(options.blocking)?;
        // 腾出空间后推进发送端暂存区中被退回的数据。
        pump_toward(&receiver);
        Ok(chunk)
    }

    /// 把暂存数据推进到接收端，并按阻塞模式等待暂存区清空。
    pub fn flush_dat(&self, link: LinkId, options: IocOptions) -> IocResult<()> {
        let sender = self.inner.links.get(link)?;
        let LinkRole::DatSender(outbox) = sender.role() else {
            return Err(IocError::NotSupport {
                operation: "flush_dat requires a DatSender link",
            });
        };
        sender.ensure_connected()?;
        let receiver = sender.peer()?;
        outbox.flush(
            sender.transport()?,
            &*receiver,
            options.blocking,
            dispatch::is_dispatching(receiver.id()),
        )
    }

    // ---------------------------------------------------------------------
    // 命令
    // ---------------------------------------------------------------------

    /// 在对端执行端上同步执行命令，返回填充了结果的命令描述。
    pub fn exec_cmd(&self, link: LinkId, desc: CmdDesc, options: IocOptions) -> IocResult<CmdDesc> {
        let initiator = self.inner.links.get(link)?;
        if initiator.usage() != Usage::CmdInitiator {
            return Err(IocError::NotSupport {
                operation: "exec_cmd requires a CmdInitiator link",
            });
        }
        initiator.ensure_connected()?;
        let executor_link = initiator.peer()?;
        let LinkRole::CmdExecutor(executor) = executor_link.role() else {
            return Err(IocError::bug(format!(
                "peer of {} is not a command executor",
                initiator.id()
            )));
        };
        if dispatch::is_dispatching(executor_link.id()) {
            debug!(ioc.link_id = %link, ioc.peer_link_id = %executor_link.id(), "exec_cmd rejected inside executor callback");
            return Err(IocError::ForbiddenInCallback {
                link: executor_link.id(),
            });
        }
        let _busy = initiator.ops().enter(BusyKind::ExecCmd);
        executor.execute(executor_link.ops(), desc, options.blocking)
    }

    // ---------------------------------------------------------------------
    // 能力
    // ---------------------------------------------------------------------

    pub fn get_capability(&self, id: CapabilityId) -> CapabilityDescription {
        CapabilityDescription::describe(id, &self.inner.config)
    }
}

impl Default for IocRuntime {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// 接收端腾出空间后，推进对端发送暂存区。
fn pump_toward(receiver: &Arc<Link>) {
    let Ok(sender) = receiver.peer() else {
        return;
    };
    let LinkRole::DatSender(outbox) = sender.role() else {
        return;
    };
    if let Ok(transport) = sender.transport() {
        outbox.pump(transport, &**receiver);
    }
}

impl RuntimeInner {
    fn transport_for(&self, protocol: &str) -> IocResult<Arc<dyn Transport>> {
        self.transports
            .get(protocol)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(IocError::NotSupport {
                operation: "service URI protocol has no registered transport",
            })
    }

    pub(crate) fn post_evt(&self, link: LinkId, desc: EvtDesc, options: IocOptions) -> IocResult<u64> {
        let producer = self.links.get(link)?;
        let seq = producer.seq_counter()?;
        producer.ensure_connected()?;
        let consumer = producer.peer()?;
        let LinkRole::EvtConsumer(inbox) = consumer.role() else {
            return Err(IocError::bug(format!("peer of {link} is not an event consumer")));
        };
        if options.sync && dispatch::is_dispatching(consumer.id()) {
            debug!(
                ioc.link_id = %link,
                ioc.peer_link_id = %consumer.id(),
                ioc.evt_id = desc.evt_id.0,
                "sync post rejected inside consumer callback"
            );
            return Err(IocError::ForbiddenInCallback { link: consumer.id() });
        }
        let queued = inbox.enqueue(link, desc, seq, options.blocking, dispatch::in_callback())?;
        if options.sync {
            inbox.dispatch_through(link, queued.seq_id)?;
        }
        Ok(queued.seq_id)
    }

    /// 认领并接受一条连接请求；请求已被连接方撤回时返回 `Ok(None)`。
    pub(crate) fn promote(&self, core: &ServiceCore, request: &PendingConnect) -> IocResult<Option<LinkId>> {
        if !request.claim() {
            return Ok(None);
        }
        match self.build_accepted(core, request.client()) {
            Ok(link) => {
                request.settle(Ok(()));
                info!(
                    ioc.link_id = %link,
                    ioc.peer_link_id = %request.client().id(),
                    ioc.srv_id = %core.id(),
                    "link accepted"
                );
                Ok(Some(link))
            }
            Err(err) => {
                request.settle(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn build_accepted(&self, core: &ServiceCore, client: &Arc<Link>) -> IocResult<LinkId> {
        let transport = self.transport_for(core.uri().protocol())?;
        let reservation = self.links.reserve()?;
        let server = Link::new(
            reservation.id(),
            client.usage().peer(),
            core.id(),
            LinkSide::Accepted,
            core.usage_args(),
            &self.config,
        )?;
        server.bind_transport(transport);
        server.transition(ConnState::Connecting)?;
        let admitted = core.admit(|| {
            server.pair_with(client);
            client.pair_with(&server);
            server.transition(ConnState::Connected)?;
            client.transition(ConnState::Connected)?;
            reservation.commit(Arc::clone(&server))?;
            Ok(server.id())
        });
        if admitted.is_err() {
            let _ = server.close();
        }
        admitted
    }

    /// 登记握手完成的客户端链路。
    ///
    /// 服务在受理之后、登记之前下线时，客户端已被对端置为 `Broken`；此时回收句柄并报告服务不存在。
    fn commit_client(&self, reservation: Reservation<'_>, client: &Arc<Link>) -> IocResult<LinkId> {
        let id = client.id();
        reservation.commit(Arc::clone(client))?;
        if client.conn_state() != ConnState::Connected {
            let _ = self.close_link(id);
            return Err(IocError::NotExistService {
                service: client.service(),
            });
        }
        Ok(id)
    }

    fn close_link(&self, link: LinkId) -> IocResult<()> {
        let target = self.links.remove(link)?;
        let result = target.close();
        if target.side() == LinkSide::Accepted {
            if let Ok(core) = self.services.get(target.service()) {
                core.forget(link);
            }
        }
        info!(ioc.link_id = %link, ioc.srv_id = %target.service(), "link closed");
        result
    }

    fn retire_service(&self, core: &ServiceCore) {
        let accepted = core.go_offline();
        if core.flags().contains(ServiceFlags::KEEP_ACCEPTED_LINK) {
            info!(
                ioc.srv_id = %core.id(),
                kept = accepted.len(),
                "service offline, accepted links kept"
            );
            return;
        }
        for link in &accepted {
            match self.close_link(*link) {
                Ok(()) | Err(IocError::NotExistLink { .. }) => {}
                Err(err) => warn!(ioc.link_id = %link, ioc.result = err.code(), "closing accepted link failed"),
            }
        }
        info!(ioc.srv_id = %core.id(), closed = accepted.len(), "service offline");
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        for srv in self.services.ids() {
            if let Ok(core) = self.services.remove(srv) {
                self.retire_service(&core);
            }
        }
        for link in self.links.snapshot() {
            let _ = self.close_link(link.id());
        }
    }
}
