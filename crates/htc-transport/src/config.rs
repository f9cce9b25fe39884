//! 传输层配置。
//!
//! # 设计概要（How）
//! - `HtcConfig` 同时实现 `Default` 与 `serde::Deserialize`，缺省字段取默认值，未知字段直接报错；
//! - `from_toml_str` 解析后立即执行 [`HtcConfig::validate`]，保证进入运行时的配置都满足约束。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ids::ServiceId;

/// 单次聚合发送的帧数上限。
pub const HTC_MAX_MSG_PER_BUNDLE_TX: usize = 32;
/// 构成聚合包的最少帧数。
pub const HTC_MIN_MSG_PER_BUNDLE: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse htc config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid htc config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// 接收重组策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RxReassembly {
    /// 跟随总线能力。
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// 就绪消息之后为某服务预留的初始信用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditAllocation {
    pub service_id: u16,
    pub credits: u32,
}

impl CreditAllocation {
    pub fn service(&self) -> ServiceId {
        ServiceId(self.service_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HtcConfig {
    /// 端点数组长度，编号 `0..max_endpoints`。
    pub max_endpoints: usize,
    pub connect_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub tx_bundle_enabled: bool,
    pub max_msgs_per_bundle: usize,
    pub min_msgs_per_bundle: usize,
    pub rx_bundle_enabled: bool,
    pub rx_reassembly: RxReassembly,
    pub credit_history_capacity: usize,
    pub bundle_pool_size: usize,
    pub control_pool_size: usize,
    /// 连接请求未指定队列深度时使用。
    pub default_max_queue_depth: usize,
    /// 为空时全部目标信用分配给 WMI 控制服务。
    pub credit_allocation: Vec<CreditAllocation>,
}

impl Default for HtcConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 8,
            connect_timeout_ms: 2000,
            ready_timeout_ms: 2000,
            tx_bundle_enabled: true,
            max_msgs_per_bundle: 16,
            min_msgs_per_bundle: HTC_MIN_MSG_PER_BUNDLE,
            rx_bundle_enabled: false,
            rx_reassembly: RxReassembly::Auto,
            credit_history_capacity: 1024,
            bundle_pool_size: 4,
            control_pool_size: 4,
            default_max_queue_depth: 64,
            credit_allocation: Vec::new(),
        }
    }
}

impl HtcConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: HtcConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=256).contains(&self.max_endpoints) {
            return Err(invalid("max_endpoints", "must be within 2..=256"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms", "must be positive"));
        }
        if self.ready_timeout_ms == 0 {
            return Err(invalid("ready_timeout_ms", "must be positive"));
        }
        if self.min_msgs_per_bundle < HTC_MIN_MSG_PER_BUNDLE {
            return Err(invalid("min_msgs_per_bundle", "must be at least 2"));
        }
        if self.max_msgs_per_bundle > HTC_MAX_MSG_PER_BUNDLE_TX {
            return Err(invalid("max_msgs_per_bundle", "must not exceed 32"));
        }
        if self.tx_bundle_enabled && self.max_msgs_per_bundle < self.min_msgs_per_bundle {
            return Err(invalid(
                "max_msgs_per_bundle",
                "must not be below min_msgs_per_bundle",
            ));
        }
        if self.credit_history_capacity == 0 {
            return Err(invalid("credit_history_capacity", "must be positive"));
        }
        if self.default_max_queue_depth == 0 {
            return Err(invalid("default_max_queue_depth", "must be positive"));
        }
        if self
            .credit_allocation
            .iter()
            .any(|entry| ServiceId(entry.service_id).is_unused())
        {
            return Err(invalid("credit_allocation", "service_id 0 is reserved"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        HtcConfig::default().validate().expect("默认配置必须合法");
    }

    #[test]
    fn toml_overrides_and_keeps_defaults() {
        let config = HtcConfig::from_toml_str(
            r#"
            max_endpoints = 12
            rx_reassembly = "enabled"

            [[credit_allocation]]
            service_id = 0x0100
            credits = 20
            "#,
        )
        .expect("解析合法配置");
        assert_eq!(config.max_endpoints, 12);
        assert_eq!(config.rx_reassembly, RxReassembly::Enabled);
        assert_eq!(config.credit_allocation[0].service(), ServiceId::WMI_CONTROL);
        assert_eq!(config.connect_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn unknown_fields_and_bad_ranges_are_rejected() {
        assert!(matches!(
            HtcConfig::from_toml_str("max_endpoint = 4"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            HtcConfig::from_toml_str("min_msgs_per_bundle = 1"),
            Err(ConfigError::Invalid {
                field: "min_msgs_per_bundle",
                ..
            })
        ));
    }
}
