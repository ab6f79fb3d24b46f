//! 集成测试共享辅助。
//!
//! - `shared_vec`：回调把观测结果写入共享向量，主线程在断言阶段读取；
//! - `wait_until`：以短间隔轮询条件，避免在测试中散落固定时长的 `sleep`；
//! - `online` / `connect_pair`：建立“服务 + 一对链路”的常用样板。

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spark_ioc::{
    ConnectArgs, IocOptions, IocRuntime, LinkId, ServiceArgs, ServiceFlags, SrvId, SrvUri, Usage,
    UsageArgs, UsageCapabilities,
};

pub fn shared_vec<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

/// 在 `within` 内等待条件成立。
pub fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// 上线一个自动接受的服务。
pub fn online(
    runtime: &IocRuntime,
    path: &str,
    capabilities: UsageCapabilities,
    flags: ServiceFlags,
    usage_args: UsageArgs,
) -> SrvId {
    runtime
        .online_service(
            ServiceArgs::new(SrvUri::fifo(path), capabilities)
                .with_flags(flags | ServiceFlags::AUTO_ACCEPT)
                .with_usage_args(usage_args),
        )
        .expect("服务上线")
}

/// 连接到自动接受的服务，返回 `(客户端链路, 服务端链路)`。
pub fn connect_pair(
    runtime: &IocRuntime,
    srv: SrvId,
    path: &str,
    usage: Usage,
    usage_args: UsageArgs,
) -> (LinkId, LinkId) {
    let before = runtime.service_link_ids(srv).expect("服务在线");
    let client = runtime
        .connect_service(
            ConnectArgs::new(SrvUri::fifo(path), usage).with_usage_args(usage_args),
            IocOptions::timeout(Duration::from_secs(2)),
        )
        .expect("连接成功");
    let server = runtime
        .service_link_ids(srv)
        .expect("服务在线")
        .into_iter()
        .find(|id| !before.contains(id))
        .expect("服务端链路已登记");
    (client, server)
}

/// 建立一对全新服务与链路：客户端用途为 `usage`。
pub fn pair(
    runtime: &IocRuntime,
    path: &str,
    usage: Usage,
    client_args: UsageArgs,
    server_args: UsageArgs,
) -> (SrvId, LinkId, LinkId) {
    let srv = online(
        runtime,
        path,
        usage.peer().capability(),
        ServiceFlags::empty(),
        server_args,
    );
    let (client, server) = connect_pair(runtime, srv, path, usage, client_args);
    (srv, client, server)
}
