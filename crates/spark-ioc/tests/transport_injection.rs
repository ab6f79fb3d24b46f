//! 可插拔传输绑定：数据路径经由注册的 `Transport` 推进，绑定拒收时转化为发送端背压。
//!
//! 测试用的 `GatedTransport` 记录每次 `transmit` 调用，并可通过闸门让绑定整体拒收。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use spark_ioc::{
    ConnectArgs, DataSink, DatDesc, IocConfig, IocError, IocOptions, IocResult, IocRuntime, LinkId,
    ServiceArgs, ServiceFlags, SrvId, SrvUri, Transport, Usage, UsageCapabilities,
};

const PROTOCOL: &str = "gated";

#[derive(Default)]
struct GatedTransport {
    attempts: AtomicUsize,
    delivered: AtomicUsize,
    closed: AtomicBool,
}

impl GatedTransport {
    fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }
}

impl Transport for GatedTransport {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn check_uri(&self, uri: &SrvUri) -> IocResult<()> {
        if uri.host() != SrvUri::LOCAL_PROCESS_HOST {
            return Err(IocError::NotSupport {
                operation: "gated transport only serves host `localprocess`",
            });
        }
        Ok(())
    }

    fn transmit(&self, sink: &dyn DataSink, chunk: DatDesc) -> Result<(), DatDesc> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return Err(chunk);
        }
        sink.offer(chunk)?;
        self.delivered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

fn gated_uri(path: &str) -> SrvUri {
    SrvUri::new(PROTOCOL, SrvUri::LOCAL_PROCESS_HOST, path)
}

fn online_receiver(runtime: &IocRuntime, path: &str) -> SrvId {
    runtime
        .online_service(
            ServiceArgs::new(gated_uri(path), UsageCapabilities::DAT_RECEIVER)
                .with_flags(ServiceFlags::AUTO_ACCEPT),
        )
        .expect("服务上线")
}

/// 以 DatSender 连接，返回 `(发送端, 接收端)`。
fn connect_sender(runtime: &IocRuntime, srv: SrvId, path: &str) -> (LinkId, LinkId) {
    let before = runtime.service_link_ids(srv).expect("服务在线");
    let sender = runtime
        .connect_service(
            ConnectArgs::new(gated_uri(path), Usage::DatSender),
            IocOptions::timeout(Duration::from_secs(2)),
        )
        .expect("连接成功");
    let receiver = runtime
        .service_link_ids(srv)
        .expect("服务在线")
        .into_iter()
        .find(|id| !before.contains(id))
        .expect("服务端链路已登记");
    (sender, receiver)
}

#[test]
fn data_path_goes_through_registered_transport() {
    let runtime = IocRuntime::with_defaults();
    let transport = Arc::new(GatedTransport::default());
    runtime.register_transport(transport.clone());
    let srv = online_receiver(&runtime, "inject/route");
    let (sender, receiver) = connect_sender(&runtime, srv, "inject/route");

    for byte in 1..=3u8 {
        runtime
            .send_dat(sender, DatDesc::from_slice(&[byte; 4]), IocOptions::may_block())
            .expect("发送成功");
    }
    assert_eq!(transport.delivered(), 3);
    for byte in 1..=3u8 {
        let got = runtime
            .recv_dat(receiver, IocOptions::non_block())
            .expect("经由绑定交付");
        assert_eq!(got.as_slice(), &[byte; 4]);
    }
}

#[test]
fn uri_is_checked_by_transport() {
    let runtime = IocRuntime::with_defaults();
    runtime.register_transport(Arc::new(GatedTransport::default()));
    let err = runtime
        .online_service(ServiceArgs::new(
            SrvUri::new(PROTOCOL, "elsewhere", "inject/host"),
            UsageCapabilities::DAT_RECEIVER,
        ))
        .expect_err("绑定拒绝该主机");
    assert!(matches!(err, IocError::NotSupport { .. }));
}

#[test]
fn refusing_transport_becomes_sender_backpressure() {
    let runtime = IocRuntime::new(IocConfig {
        max_data_queue_size: 16,
        ..IocConfig::default()
    })
    .expect("配置合法");
    let transport = Arc::new(GatedTransport::default());
    runtime.register_transport(transport.clone());
    let srv = online_receiver(&runtime, "inject/refuse");
    let (sender, receiver) = connect_sender(&runtime, srv, "inject/refuse");

    transport.set_closed(true);
    runtime
        .send_dat(sender, DatDesc::from_slice(&[7u8; 16]), IocOptions::non_block())
        .expect("被拒收的数据留在暂存区");
    assert!(transport.attempts() >= 1);
    assert_eq!(transport.delivered(), 0);

    assert_eq!(
        runtime.send_dat(sender, DatDesc::from_slice(b"x"), IocOptions::non_block()),
        Err(IocError::BufferFull {
            link: sender,
            queued: 16,
            limit: 16
        })
    );
    assert_eq!(
        runtime.flush_dat(sender, IocOptions::timeout(Duration::from_millis(20))),
        Err(IocError::Timeout)
    );
    assert!(matches!(
        runtime.recv_dat(receiver, IocOptions::non_block()),
        Err(IocError::NoData { .. })
    ));

    transport.set_closed(false);
    runtime
        .flush_dat(sender, IocOptions::may_block())
        .expect("闸门打开后暂存区清空");
    assert_eq!(transport.delivered(), 1);
    let got = runtime
        .recv_dat(receiver, IocOptions::non_block())
        .expect("数据完整到达");
    assert_eq!(got.as_slice(), &[7u8; 16]);
}

#[test]
fn replacement_applies_to_new_connections() {
    let runtime = IocRuntime::with_defaults();
    let first = Arc::new(GatedTransport::default());
    runtime.register_transport(first.clone());
    let srv = online_receiver(&runtime, "inject/replace");
    let (old_sender, _old_receiver) = connect_sender(&runtime, srv, "inject/replace");

    let second = Arc::new(GatedTransport::default());
    runtime.register_transport(second.clone());
    let (new_sender, _new_receiver) = connect_sender(&runtime, srv, "inject/replace");

    runtime
        .send_dat(old_sender, DatDesc::from_slice(b"old"), IocOptions::may_block())
        .expect("旧链路沿用连接时的绑定");
    runtime
        .send_dat(new_sender, DatDesc::from_slice(b"new"), IocOptions::may_block())
        .expect("新链路使用替换后的绑定");
    assert_eq!((first.delivered(), second.delivered()), (1, 1));
}
