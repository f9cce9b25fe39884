//! 端点、服务与管道的强类型标识。

use core::fmt;

/// 逻辑端点编号，连接完成后不可变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub u8);

impl EndpointId {
    /// 控制端点：初始化即存在，发送不消耗信用。
    pub const CONTROL: EndpointId = EndpointId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_control(self) -> bool {
        self == Self::CONTROL
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// 服务编号，高字节为服务组，低字节为组内编号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub u16);

impl ServiceId {
    /// 保留值，表示端点未被占用。
    pub const UNUSED: ServiceId = ServiceId(0);
    /// 控制通道保留服务，直接映射到 [`EndpointId::CONTROL`]，无需握手。
    pub const CONTROL_RSVD: ServiceId = ServiceId::make(0, 1);
    pub const WMI_CONTROL: ServiceId = ServiceId::make(1, 0);
    pub const WMI_DATA_BE: ServiceId = ServiceId::make(1, 1);
    pub const WMI_DATA_BK: ServiceId = ServiceId::make(1, 2);
    pub const WMI_DATA_VI: ServiceId = ServiceId::make(1, 3);
    pub const WMI_DATA_VO: ServiceId = ServiceId::make(1, 4);
    pub const HTT_DATA_MSG: ServiceId = ServiceId::make(3, 0);
    pub const PACKET_LOG: ServiceId = ServiceId::make(4, 0);

    pub const fn make(group: u8, index: u8) -> ServiceId {
        ServiceId(((group as u16) << 8) | index as u16)
    }

    pub fn is_unused(self) -> bool {
        self == Self::UNUSED
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// 总线物理管道编号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipeId(pub u8);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

/// 一次总线发送的唯一标识，完成回调据此匹配在途队列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(pub u64);
