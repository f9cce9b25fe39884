//! 日志目标与可选的订阅器安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：发送、接收、信用与服务握手四条路径使用固定的 `tracing` target，运维可以用
//!   `RUST_LOG=htc::credit=trace` 之类的过滤器只打开一条路径；
//! - **逻辑（How）**：库本身只产出事件，不安装订阅器；开启 `subscriber` 特性后，可执行程序可调用
//!   [`install_fmt_subscriber`] 一次性组装 `fmt + EnvFilter`；
//! - **契约（What）**：target 字符串属于对外约定，修改需同步更新运维文档。

/// 发送路径：入队、排空、总线提交、完成。
pub const TARGET_SEND: &str = "htc::send";
/// 接收路径：重组、帧校验、分发。
pub const TARGET_RECV: &str = "htc::recv";
/// 信用消耗、回报与不足。
pub const TARGET_CREDIT: &str = "htc::credit";
/// 就绪握手与服务连接。
pub const TARGET_SERVICE: &str = "htc::service";

#[cfg(feature = "subscriber")]
pub use install::{InstallError, install_fmt_subscriber};

#[cfg(feature = "subscriber")]
mod install {
    use thiserror::Error;
    use tracing::dispatcher;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::EnvFilter;

    #[derive(Debug, Error)]
    pub enum InstallError {
        #[error("a global tracing subscriber is already installed")]
        SubscriberAlreadySet,
        #[error("failed to set global subscriber: {0}")]
        SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    }

    /// 安装 `fmt + EnvFilter` 全局订阅器；`RUST_LOG` 缺省时按 `info` 过滤。
    ///
    /// 外部已设置订阅器时返回 [`InstallError::SubscriberAlreadySet`]，不会覆盖。
    pub fn install_fmt_subscriber() -> Result<(), InstallError> {
        if dispatcher::has_been_set() {
            return Err(InstallError::SubscriberAlreadySet);
        }
        let subscriber = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(tracing_subscriber::fmt::layer());
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }

    fn build_env_filter() -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
