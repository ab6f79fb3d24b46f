//! 数据通道子状态测试。
//!
//! - **Why**：子状态只在调用期间处于 Busy，调用返回后必须回到 Ready；发送端与接收端只报告各自角色的子状态；
//! - **How**：让发送/接收在背压下阻塞，从另一线程采样 `get_link_state`；回调模式下在回调内部采样。

mod support;

use std::thread;
use std::time::Duration;

use spark_ioc::{
    DatDesc, IocConfig, IocError, IocOptions, IocRuntime, LinkId, LinkState, LinkSubState, Usage,
    UsageArgs,
};

use support::{pair, shared_vec, wait_until};

fn small_runtime(max_data_queue_size: usize) -> IocRuntime {
    IocRuntime::new(IocConfig {
        max_data_queue_size,
        ..IocConfig::default()
    })
    .expect("配置合法")
}

fn sub_state(runtime: &IocRuntime, link: LinkId) -> LinkSubState {
    runtime.get_link_state(link).expect("链路存在").1
}

#[test]
fn idle_links_report_role_ready_states() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, sender, receiver) = pair(
        &runtime,
        "dat-state/idle",
        Usage::DatSender,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    assert_eq!(
        runtime.get_link_state(sender),
        Ok((LinkState::Ready, LinkSubState::DatSenderReady))
    );
    assert_eq!(
        runtime.get_link_state(receiver),
        Ok((LinkState::Ready, LinkSubState::DatReceiverReady))
    );
}

#[test]
fn blocked_send_reports_busy_then_returns_to_ready() {
    let runtime = small_runtime(8);
    let (_srv, sender, receiver) = pair(
        &runtime,
        "dat-state/send",
        Usage::DatSender,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    let chunk = DatDesc::from_slice(&[7u8; 8]);
    // 第一块进入接收端队列，第二块留在发送暂存区，第三块只能等待。
    runtime
        .send_dat(sender, chunk.clone(), IocOptions::non_block())
        .expect("接收端有空间");
    runtime
        .send_dat(sender, chunk.clone(), IocOptions::non_block())
        .expect("暂存区有空间");

    let blocked = {
        let runtime = runtime.clone();
        let chunk = chunk.clone();
        thread::spawn(move || runtime.send_dat(sender, chunk, IocOptions::may_block()))
    };
    assert!(wait_until(Duration::from_secs(1), || {
        sub_state(&runtime, sender) == LinkSubState::DatSenderBusySendDat
    }));
    assert_eq!(sub_state(&runtime, receiver), LinkSubState::DatReceiverReady);

    runtime
        .recv_dat(receiver, IocOptions::non_block())
        .expect("取走第一块");
    blocked
        .join()
        .expect("发送线程退出")
        .expect("腾出空间后发送成功");
    assert_eq!(sub_state(&runtime, sender), LinkSubState::DatSenderReady);
}

#[test]
fn blocked_recv_reports_busy_until_data_arrives() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, sender, receiver) = pair(
        &runtime,
        "dat-state/recv",
        Usage::DatSender,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    let waiting = {
        let runtime = runtime.clone();
        thread::spawn(move || runtime.recv_dat(receiver, IocOptions::may_block()))
    };
    assert!(wait_until(Duration::from_secs(1), || {
        sub_state(&runtime, receiver) == LinkSubState::DatReceiverBusyRecvDat
    }));
    runtime
        .send_dat(sender, DatDesc::from_slice(b"wake"), IocOptions::may_block())
        .expect("发送成功");
    let got = waiting.join().expect("接收线程退出").expect("收到数据");
    assert_eq!(got.as_slice(), b"wake");
    assert_eq!(sub_state(&runtime, receiver), LinkSubState::DatReceiverReady);
}

#[test]
fn callback_receiver_reports_busy_inside_callback() {
    let runtime = IocRuntime::with_defaults();
    let observed = shared_vec::<LinkSubState>();
    let server_args = {
        let runtime = runtime.clone();
        let observed = observed.clone();
        UsageArgs::new().with_dat_callback(move |link: LinkId, _: &DatDesc| {
            observed.lock().push(sub_state(&runtime, link));
            Ok(())
        })
    };
    let (_srv, sender, receiver) = pair(
        &runtime,
        "dat-state/callback",
        Usage::DatSender,
        UsageArgs::new(),
        server_args,
    );
    runtime
        .send_dat(sender, DatDesc::from_slice(b"cb"), IocOptions::may_block())
        .expect("发送成功");
    assert_eq!(
        observed.lock().as_slice(),
        &[LinkSubState::DatReceiverBusyCbRecvDat]
    );
    assert_eq!(sub_state(&runtime, receiver), LinkSubState::DatReceiverReady);
    assert!(matches!(
        runtime.recv_dat(receiver, IocOptions::non_block()),
        Err(IocError::NotSupport { .. })
    ));
}

#[test]
fn role_mismatched_calls_are_not_supported() {
    let runtime = IocRuntime::with_defaults();
    let (_srv, sender, receiver) = pair(
        &runtime,
        "dat-state/roles",
        Usage::DatSender,
        UsageArgs::new(),
        UsageArgs::new(),
    );
    assert!(matches!(
        runtime.recv_dat(sender, IocOptions::non_block()),
        Err(IocError::NotSupport { .. })
    ));
    assert!(matches!(
        runtime.send_dat(receiver, DatDesc::from_slice(b"x"), IocOptions::non_block()),
        Err(IocError::NotSupport { .. })
    ));
    assert!(matches!(
        runtime.flush_dat(receiver, IocOptions::non_block()),
        Err(IocError::NotSupport { .. })
    ));
    assert_eq!(sub_state(&runtime, sender), LinkSubState::DatSenderReady);
    assert_eq!(sub_state(&runtime, receiver), LinkSubState::DatReceiverReady);
}
