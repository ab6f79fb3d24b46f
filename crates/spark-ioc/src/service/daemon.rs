//! # 服务守护线程
//!
//! 服务上线时按标志位启动两类线程，下线时由 [`ServiceCore::go_offline`] 统一回收：
//!
//! - **自动接受**（`AUTO_ACCEPT`）：以配置的轮询间隔等待待接受请求并逐个提升为已接受链路；
//!   服务下线后 `take_pending` 返回 `NotExistService`，线程随即退出；
//! - **广播**（`BROADCAST_EVENT`）：从通道读取事件，以异步非阻塞方式投递到每条已接受链路；
//!   发送端在下线时被丢弃，通道关闭后线程退出。
//!
//! 线程只持有运行时的弱引用，运行时析构不会被守护线程拖住。

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::IocError;
use crate::runtime::RuntimeInner;
use crate::service::ServiceCore;
use crate::types::{BlockingMode, EvtDesc, IocOptions};
use crate::wait::WaitDeadline;

/// 启动自动接受线程。
pub(crate) fn spawn_auto_accept(
    runtime: Weak<RuntimeInner>,
    core: Arc<ServiceCore>,
    poll: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("ioc-accept-{}", core.id().as_raw()))
        .spawn(move || run_auto_accept(&runtime, &core, poll))
}

fn run_auto_accept(runtime: &Weak<RuntimeInner>, core: &ServiceCore, poll: Duration) {
    info!(ioc.srv_id = %core.id(), ioc.uri = %core.uri(), "auto-accept daemon started");
    loop {
        let deadline = WaitDeadline::start(BlockingMode::Timeout(poll));
        let request = match core.take_pending(&deadline) {
            Ok(request) => request,
            Err(IocError::Timeout) => {
                if runtime.strong_count() == 0 {
                    break;
                }
                continue;
            }
            Err(_) => break,
        };
        let Some(inner) = runtime.upgrade() else {
            request.settle(Err(IocError::NotExistService { service: core.id() }));
            break;
        };
        match inner.promote(core, &request) {
            Ok(Some(link)) => debug!(ioc.srv_id = %core.id(), ioc.link_id = %link, "connection auto-accepted"),
            Ok(None) => {}
            Err(err) => warn!(ioc.srv_id = %core.id(), ioc.result = err.code(), "auto-accept failed"),
        }
    }
    info!(ioc.srv_id = %core.id(), "auto-accept daemon stopped");
}

/// 启动广播线程，返回供 `broadcast_evt` 使用的发送端。
pub(crate) fn spawn_broadcast(
    runtime: Weak<RuntimeInner>,
    core: Arc<ServiceCore>,
) -> io::Result<(mpsc::Sender<EvtDesc>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(format!("ioc-bcast-{}", core.id().as_raw()))
        .spawn(move || run_broadcast(&runtime, &core, &rx))?;
    Ok((tx, handle))
}

fn run_broadcast(runtime: &Weak<RuntimeInner>, core: &ServiceCore, rx: &mpsc::Receiver<EvtDesc>) {
    info!(ioc.srv_id = %core.id(), "broadcast daemon started");
    while let Ok(desc) = rx.recv() {
        let Some(inner) = runtime.upgrade() else {
            break;
        };
        let options = IocOptions::non_block().async_mode();
        for link in core.link_ids() {
            if let Err(err) = inner.post_evt(link, desc, options) {
                debug!(
                    ioc.srv_id = %core.id(),
                    ioc.link_id = %link,
                    ioc.evt_id = desc.evt_id.0,
                    ioc.result = err.code(),
                    "broadcast delivery skipped"
                );
            }
        }
    }
    info!(ioc.srv_id = %core.id(), "broadcast daemon stopped");
}
