//! 全局订阅器安装：只能成功一次。
//!
//! 全局 Subscriber 属于进程级状态，本文件单独编译为一个测试二进制，且只包含一个用例，
//! 因而首次调用 [`install`] 的结果是确定的。

use spark_ioc::observability::{InstallError, install};

#[test]
fn first_install_succeeds_and_second_is_refused() {
    install().expect("本进程尚未设置任何订阅器");
    assert!(tracing::dispatcher::has_been_set());
    assert!(matches!(install(), Err(InstallError::AlreadyInstalled)));
    assert!(matches!(install(), Err(InstallError::AlreadyInstalled)));
}
