use std::borrow::Cow;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ids::ServiceId;
use crate::wire::WireError;
use crate::wire::control::ServiceStatus;

/// 错误的处置类别，供调用方决定重试、放弃或上报。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 资源暂时不足，稍后重试即可。
    Retryable,
    NonRetryable,
    Timeout,
    Cancelled,
    /// 对端违反线协议，当前帧或握手应被丢弃。
    ProtocolViolation,
}

/// 总线层返回的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus has no free transfer resources")]
    NoResource,
    #[error("bus could not allocate a transfer buffer")]
    NoMemory,
    #[error("no pipe mapping for service {0}")]
    Unsupported(ServiceId),
    #[error("bus transfer failed: {0}")]
    Failed(Cow<'static, str>),
}

/// 传输层错误。
///
/// # 契约说明（What）
/// - 每个变体都有稳定的 [`HtcError::code`]，格式为 `htc.<域>.<原因>`，可直接用于日志检索与告警规则；
/// - [`HtcError::category`] 给出处置建议；逐帧错误在接收路径内部消化，只有握手、配置与参数错误会同步返回。
#[derive(Debug, Error)]
pub enum HtcError {
    #[error("out of memory")]
    NoMemory,
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        waited: Duration,
    },
    #[error("target rejected service {service}: {status}")]
    ServiceRejected {
        service: ServiceId,
        status: ServiceStatus,
    },
    #[error("protocol error: {reason}")]
    ProtocolError { reason: Cow<'static, str> },
    #[error("operation canceled")]
    Canceled,
    #[error("transport resources busy")]
    ResourceBusy,
    #[error("invalid endpoint {endpoint}")]
    InvalidEndpoint { endpoint: u8 },
    #[error("service {service} is already connected")]
    AlreadyInUse { service: ServiceId },
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },
    #[error("target has not reported ready")]
    NotReady,
    #[error("transport is stopping")]
    Stopped,
    #[error("bus error: {0}")]
    Bus(BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HtcError {
    pub(crate) fn protocol(reason: impl Into<Cow<'static, str>>) -> Self {
        HtcError::ProtocolError {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HtcError::NoMemory => "htc.transport.no_memory",
            HtcError::Timeout { .. } => "htc.transport.timeout",
            HtcError::ServiceRejected { .. } => "htc.service.rejected",
            HtcError::ProtocolError { .. } => "htc.protocol.violation",
            HtcError::Canceled => "htc.transport.canceled",
            HtcError::ResourceBusy => "htc.transport.resource_busy",
            HtcError::InvalidEndpoint { .. } => "htc.endpoint.invalid",
            HtcError::AlreadyInUse { .. } => "htc.service.already_in_use",
            HtcError::InvalidArgument { .. } => "htc.transport.invalid_argument",
            HtcError::NotReady => "htc.service.not_ready",
            HtcError::Stopped => "htc.transport.stopped",
            HtcError::Bus(_) => "htc.bus.failed",
            HtcError::Config(_) => "htc.config.invalid",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HtcError::ResourceBusy | HtcError::NoMemory => ErrorCategory::Retryable,
            HtcError::Timeout { .. } => ErrorCategory::Timeout,
            HtcError::Canceled | HtcError::Stopped => ErrorCategory::Cancelled,
            HtcError::ProtocolError { .. } => ErrorCategory::ProtocolViolation,
            HtcError::Bus(BusError::NoResource) => ErrorCategory::Retryable,
            _ => ErrorCategory::NonRetryable,
        }
    }
}

impl From<WireError> for HtcError {
    fn from(error: WireError) -> Self {
        HtcError::protocol(error.to_string())
    }
}

impl From<BusError> for HtcError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::NoResource => HtcError::ResourceBusy,
            BusError::NoMemory => HtcError::NoMemory,
            other => HtcError::Bus(other),
        }
    }
}
