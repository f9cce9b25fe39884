//! 控制端点（EP0）上的控制消息。
//!
//! 所有消息以小端 `u16` 消息编号开头，后续字段按固定布局紧密排列。

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{HTC_SERVICE_META_DATA_MAX_LENGTH, WireError};
use crate::ids::{EndpointId, ServiceId};

pub const MSG_READY: u16 = 1;
pub const MSG_CONNECT_SERVICE: u16 = 2;
pub const MSG_CONNECT_SERVICE_RESPONSE: u16 = 3;
pub const MSG_SETUP_COMPLETE: u16 = 4;
pub const MSG_SETUP_COMPLETE_EX: u16 = 5;
pub const MSG_SEND_SUSPEND_COMPLETE: u16 = 6;
pub const MSG_NACK_SUSPEND: u16 = 7;
pub const MSG_WAKEUP: u16 = 8;

const READY_LEN: usize = 8;
const READY_EX_LEN: usize = 12;
const CONNECT_LEN: usize = 8;
const CONNECT_RESPONSE_LEN: usize = 10;
const SETUP_COMPLETE_EX_LEN: usize = 10;

/// `SETUP_COMPLETE_EX` 标志：主机可以接收聚合帧。
pub const SETUP_FLAG_ENABLE_BUNDLE_RECV: u32 = 1 << 0;

/// 连接标志位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionFlags(pub u16);

impl ConnectionFlags {
    pub const REDUCE_CREDIT_DRIBBLE: u16 = 1 << 2;
    /// 关闭该服务的信用流控，发送改由总线资源约束。
    pub const DISABLE_CREDIT_FLOW_CTRL: u16 = 1 << 3;

    pub fn credit_flow_disabled(self) -> bool {
        self.0 & Self::DISABLE_CREDIT_FLOW_CTRL != 0
    }
}

/// 目标对连接请求的应答状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Success,
    NotFound,
    Failed,
    NoResources,
    NoMoreEndpoints,
    Other(u8),
}

impl From<u8> for ServiceStatus {
    fn from(raw: u8) -> Self {
        match raw {
            0 => ServiceStatus::Success,
            1 => ServiceStatus::NotFound,
            2 => ServiceStatus::Failed,
            3 => ServiceStatus::NoResources,
            4 => ServiceStatus::NoMoreEndpoints,
            other => ServiceStatus::Other(other),
        }
    }
}

impl From<ServiceStatus> for u8 {
    fn from(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::Success => 0,
            ServiceStatus::NotFound => 1,
            ServiceStatus::Failed => 2,
            ServiceStatus::NoResources => 3,
            ServiceStatus::NoMoreEndpoints => 4,
            ServiceStatus::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Success => f.write_str("success"),
            ServiceStatus::NotFound => f.write_str("service not found"),
            ServiceStatus::Failed => f.write_str("failed"),
            ServiceStatus::NoResources => f.write_str("no resources"),
            ServiceStatus::NoMoreEndpoints => f.write_str("no more endpoints"),
            ServiceStatus::Other(raw) => write!(f, "status {raw}"),
        }
    }
}

/// 目标就绪消息携带的缓冲与能力信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyMessage {
    pub credit_count: u16,
    pub credit_size: u16,
    pub max_endpoints: u8,
    /// 扩展形式才携带的字段。
    pub extended: Option<ReadyExtension>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyExtension {
    pub htc_version: u8,
    pub max_msgs_per_bundle: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectServiceMessage {
    pub service_id: ServiceId,
    pub flags: ConnectionFlags,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectServiceResponseMessage {
    pub service_id: ServiceId,
    pub status: ServiceStatus,
    pub endpoint: EndpointId,
    pub max_msg_size: u16,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupCompleteExMessage {
    pub flags: u32,
    pub max_msgs_per_bundled_recv: u8,
}

/// 控制消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ready(ReadyMessage),
    ConnectService(ConnectServiceMessage),
    ConnectServiceResponse(ConnectServiceResponseMessage),
    SetupComplete,
    SetupCompleteEx(SetupCompleteExMessage),
    SendSuspendComplete,
    NackSuspend,
    Wakeup,
    Unknown(u16),
}

impl ControlMessage {
    pub fn decode(buf: &Bytes) -> Result<Self, WireError> {
        let id = read_u16(buf, 0)?;
        let short = |need: usize| {
            if buf.len() < need {
                Err(WireError::ShortControlMessage { id, len: buf.len() })
            } else {
                Ok(())
            }
        };
        let message = match id {
            MSG_READY => {
                short(READY_LEN)?;
                let extended = (buf.len() >= READY_EX_LEN).then(|| ReadyExtension {
                    htc_version: buf[8],
                    max_msgs_per_bundle: buf[9],
                });
                ControlMessage::Ready(ReadyMessage {
                    credit_count: read_u16(buf, 2)?,
                    credit_size: read_u16(buf, 4)?,
                    max_endpoints: buf[6],
                    extended,
                })
            }
            MSG_CONNECT_SERVICE => {
                short(CONNECT_LEN)?;
                let meta_len = buf[6] as usize;
                short(CONNECT_LEN + meta_len)?;
                ControlMessage::ConnectService(ConnectServiceMessage {
                    service_id: ServiceId(read_u16(buf, 2)?),
                    flags: ConnectionFlags(read_u16(buf, 4)?),
                    metadata: buf.slice(CONNECT_LEN..CONNECT_LEN + meta_len),
                })
            }
            MSG_CONNECT_SERVICE_RESPONSE => {
                short(CONNECT_RESPONSE_LEN)?;
                let meta_len = buf[8] as usize;
                // 元数据被截断时只保留实际到达的部分。
                let meta_end = (CONNECT_RESPONSE_LEN + meta_len).min(buf.len());
                ControlMessage::ConnectServiceResponse(ConnectServiceResponseMessage {
                    service_id: ServiceId(read_u16(buf, 2)?),
                    status: ServiceStatus::from(buf[4]),
                    endpoint: EndpointId(buf[5]),
                    max_msg_size: read_u16(buf, 6)?,
                    metadata: buf.slice(CONNECT_RESPONSE_LEN..meta_end),
                })
            }
            MSG_SETUP_COMPLETE => ControlMessage::SetupComplete,
            MSG_SETUP_COMPLETE_EX => {
                short(SETUP_COMPLETE_EX_LEN)?;
                ControlMessage::SetupCompleteEx(SetupCompleteExMessage {
                    flags: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
                    max_msgs_per_bundled_recv: buf[6],
                })
            }
            MSG_SEND_SUSPEND_COMPLETE => ControlMessage::SendSuspendComplete,
            MSG_NACK_SUSPEND => ControlMessage::NackSuspend,
            MSG_WAKEUP => ControlMessage::Wakeup,
            other => ControlMessage::Unknown(other),
        };
        Ok(message)
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        match self {
            ControlMessage::Ready(ready) => {
                out.put_u16_le(MSG_READY);
                out.put_u16_le(ready.credit_count);
                out.put_u16_le(ready.credit_size);
                out.put_u8(ready.max_endpoints);
                out.put_u8(0);
                if let Some(ext) = ready.extended {
                    out.put_u8(ext.htc_version);
                    out.put_u8(ext.max_msgs_per_bundle);
                    out.put_u16_le(0);
                }
            }
            ControlMessage::ConnectService(connect) => {
                check_metadata(&connect.metadata)?;
                out.put_u16_le(MSG_CONNECT_SERVICE);
                out.put_u16_le(connect.service_id.0);
                out.put_u16_le(connect.flags.0);
                out.put_u8(connect.metadata.len() as u8);
                out.put_u8(0);
                out.put_slice(&connect.metadata);
            }
            ControlMessage::ConnectServiceResponse(resp) => {
                check_metadata(&resp.metadata)?;
                out.put_u16_le(MSG_CONNECT_SERVICE_RESPONSE);
                out.put_u16_le(resp.service_id.0);
                out.put_u8(resp.status.into());
                out.put_u8(resp.endpoint.0);
                out.put_u16_le(resp.max_msg_size);
                out.put_u8(resp.metadata.len() as u8);
                out.put_u8(0);
                out.put_slice(&resp.metadata);
            }
            ControlMessage::SetupComplete => out.put_u16_le(MSG_SETUP_COMPLETE),
            ControlMessage::SetupCompleteEx(setup) => {
                out.put_u16_le(MSG_SETUP_COMPLETE_EX);
                out.put_u32_le(setup.flags);
                out.put_u8(setup.max_msgs_per_bundled_recv);
                out.put_slice(&[0; 3]);
            }
            ControlMessage::SendSuspendComplete => out.put_u16_le(MSG_SEND_SUSPEND_COMPLETE),
            ControlMessage::NackSuspend => out.put_u16_le(MSG_NACK_SUSPEND),
            ControlMessage::Wakeup => out.put_u16_le(MSG_WAKEUP),
            ControlMessage::Unknown(id) => out.put_u16_le(*id),
        }
        Ok(())
    }
}

fn check_metadata(metadata: &Bytes) -> Result<(), WireError> {
    if metadata.len() > HTC_SERVICE_META_DATA_MAX_LENGTH {
        return Err(WireError::MetadataTooLong {
            len: metadata.len(),
            max: HTC_SERVICE_META_DATA_MAX_LENGTH,
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, WireError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(WireError::Truncated {
            needed: offset + 2,
            available: buf.len(),
        })
}
