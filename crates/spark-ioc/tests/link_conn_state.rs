//! 链路连接状态机集成测试。
//!
//! - **Why**：连接状态是所有通道操作的前置条件，必须与事件/数据活动正交且只沿合法边推进；
//! - **What**：覆盖建立后稳定为 `Connected`、关闭后句柄立即失效、对端关闭后进入 `Broken`、
//!   连接超时撤回请求等路径。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use spark_ioc::{
    ConnState, ConnectArgs, DatDesc, EvtDesc, EvtId, IocError, IocOptions, IocRuntime, LinkId,
    ServiceArgs, SrvUri, Usage, UsageArgs, UsageCapabilities,
};

use support::{pair, shared_vec};

#[test]
fn established_link_stays_connected_during_traffic() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, consumer, producer) = pair(
        &runtime,
        "conn/steady",
        Usage::EvtConsumer,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    for link in [consumer, producer] {
        assert_eq!(runtime.get_link_conn_state(link), Ok(ConnState::Connected));
    }
    for value in 0..8 {
        runtime
            .post_evt(
                producer,
                EvtDesc::new(EvtId::HELLO, value),
                IocOptions::non_block(),
            )
            .expect("投递成功");
        runtime
            .pull_evt(consumer, IocOptions::non_block())
            .expect("取到事件");
        assert_eq!(runtime.get_link_conn_state(consumer), Ok(ConnState::Connected));
    }
}

#[test]
fn closed_link_is_freed_synchronously() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, sender, _receiver) = pair(
        &runtime,
        "conn/close",
        Usage::DatSender,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    runtime.close_link(sender).expect("关闭成功");
    assert_eq!(
        runtime.get_link_conn_state(sender),
        Err(IocError::NotExistLink { link: sender })
    );
    assert_eq!(
        runtime.close_link(sender),
        Err(IocError::NotExistLink { link: sender })
    );
}

#[test]
fn peer_close_turns_survivor_broken() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, sender, receiver) = pair(
        &runtime,
        "conn/broken",
        Usage::DatSender,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    runtime.close_link(receiver).expect("关闭接收端");
    assert_eq!(runtime.get_link_conn_state(sender), Ok(ConnState::Broken));
    assert_eq!(
        runtime.send_dat(sender, DatDesc::from_slice(b"late"), IocOptions::non_block()),
        Err(IocError::LinkBroken { link: sender })
    );
    runtime.close_link(sender).expect("Broken 链路可以关闭");
}

#[test]
fn blocked_poller_wakes_on_peer_close() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, consumer, producer) = pair(
        &runtime,
        "conn/wake",
        Usage::EvtConsumer,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    let poller = {
        let runtime = runtime.clone();
        thread::spawn(move || runtime.pull_evt(consumer, IocOptions::may_block()))
    };
    thread::sleep(Duration::from_millis(30));
    runtime.close_link(producer).expect("关闭生产端");
    let outcome = poller.join().expect("轮询线程正常退出");
    assert_eq!(outcome, Err(IocError::LinkBroken { link: consumer }));
}

/// 观察者线程持续采样连接状态，断言采样序列只沿 `Connected → Broken → 句柄失效` 推进。
#[test]
fn observed_states_follow_the_partial_order() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, client, server) = pair(
        &runtime,
        "conn/order",
        Usage::CmdInitiator,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    let samples = shared_vec::<Result<ConnState, IocError>>();
    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
        let runtime = runtime.clone();
        let samples = Arc::clone(&samples);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                samples.lock().push(runtime.get_link_conn_state(server));
                thread::yield_now();
            }
        })
    };
    thread::sleep(Duration::from_millis(5));
    runtime.close_link(client).expect("关闭客户端");
    thread::sleep(Duration::from_millis(5));
    runtime.close_link(server).expect("关闭服务端");
    thread::sleep(Duration::from_millis(5));
    stop.store(true, Ordering::Release);
    observer.join().expect("观察者退出");

    let rank = |sample: &Result<ConnState, IocError>| match sample {
        Ok(ConnState::Connected) => 0,
        Ok(ConnState::Broken) => 1,
        Err(IocError::NotExistLink { .. }) => 2,
        other => panic!("意外的采样值: {other:?}"),
    };
    let ranks: Vec<_> = samples.lock().iter().map(rank).collect();
    assert!(!ranks.is_empty());
    assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "状态回退: {ranks:?}");
}

#[test]
fn connect_timeout_withdraws_request() {
    let runtime = IocRuntime::with_defaults();
    let srv = runtime
        .online_service(ServiceArgs::new(
            SrvUri::fifo("conn/manual"),
            UsageCapabilities::DAT_RECEIVER,
        ))
        .expect("手动接受服务上线");
    let err = runtime
        .connect_service(
            ConnectArgs::new(SrvUri::fifo("conn/manual"), Usage::DatSender),
            IocOptions::timeout(Duration::from_millis(20)),
        )
        .expect_err("无人接受");
    assert_eq!(err, IocError::Timeout);
    assert_eq!(runtime.link_count(), 0, "撤回的请求不留下链路");
    assert_eq!(
        runtime.accept_client(srv, IocOptions::non_block()),
        Err(IocError::Timeout),
        "撤回的请求不会被接受"
    );
}

#[test]
fn sentinel_and_unknown_links_are_distinguished() {
    let runtime = IocRuntime::with_defaults();
    assert!(matches!(
        runtime.get_link_conn_state(LinkId::INVALID),
        Err(IocError::InvalidParam { .. })
    ));
    let unknown = LinkId::from_raw(999_999);
    assert_eq!(
        runtime.get_link_conn_state(unknown),
        Err(IocError::NotExistLink { link: unknown })
    );
    assert_eq!(
        runtime.get_link_state(unknown),
        Err(IocError::NotExistLink { link: unknown })
    );
}
