//! HTC 帧格式编解码。
//!
//! # 模块定位（Why）
//! - 发送、接收、握手三条路径都要读写同一个 8 字节帧头，集中在此处可以保证字节序与字段含义只定义一次；
//! - 尾部记录（trailer）与控制消息分别位于 [`trailer`] 与 [`control`] 子模块，帧头本身在本文件。
//!
//! # 帧头布局（What）
//! | 偏移 | 长度 | 字段 |
//! |---|---|---|
//! | 0 | 1 | 端点编号 |
//! | 1 | 1 | 标志位 |
//! | 2 | 2 | 负载长度（小端，不含帧头） |
//! | 4 | 1 | 控制字节 0：接收方向为尾部长度 |
//! | 5 | 1 | 控制字节 1：发送序号 |
//! | 6 | 2 | 保留字段：聚合发送时为填充字节数 |

pub mod control;
pub mod trailer;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ids::EndpointId;

/// 帧头长度。
pub const HTC_HDR_LENGTH: usize = 8;

/// 发送方向：请求目标尽快回送信用。
pub const FLAG_NEED_CREDIT_UPDATE: u8 = 1 << 0;
/// 发送方向：该帧属于一个聚合包。
pub const FLAG_SEND_BUNDLE: u8 = 1 << 1;
/// 接收方向：负载末尾携带尾部记录，长度见控制字节 0。
pub const FLAG_RECV_TRAILER: u8 = 1 << 1;
/// 接收方向：高半字节为聚合帧数量。
pub const FLAG_RECV_BUNDLE_CNT_MASK: u8 = 0xF0;
pub const FLAG_RECV_BUNDLE_CNT_SHIFT: u8 = 4;

/// 控制消息的最大长度。
pub const HTC_MAX_CONTROL_MESSAGE_LENGTH: usize = 256;
/// 连接请求可携带的服务元数据上限。
pub const HTC_SERVICE_META_DATA_MAX_LENGTH: usize = 128;

/// 线格式解析错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("trailer length {trailer} invalid for payload of {payload} bytes")]
    InvalidTrailerLength { trailer: usize, payload: usize },
    #[error("record {id} declares {len} bytes but only {remaining} remain")]
    RecordOverrun { id: u8, len: usize, remaining: usize },
    #[error("record {id} has malformed length {len}")]
    MalformedRecord { id: u8, len: usize },
    #[error("control message {id} is too short ({len} bytes)")]
    ShortControlMessage { id: u16, len: usize },
    #[error("metadata of {len} bytes exceeds {max}")]
    MetadataTooLong { len: usize, max: usize },
}

/// 解码后的帧头。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub endpoint: EndpointId,
    pub flags: u8,
    pub payload_len: u16,
    pub control: [u8; 2],
    pub reserved: u16,
}

impl FrameHeader {
    pub fn new(endpoint: EndpointId, flags: u8, payload_len: u16) -> Self {
        Self {
            endpoint,
            flags,
            payload_len,
            control: [0; 2],
            reserved: 0,
        }
    }

    pub fn with_seq(mut self, seq: u8) -> Self {
        self.control[1] = seq;
        self
    }

    /// 接收方向的尾部长度。
    pub fn trailer_len(&self) -> usize {
        self.control[0] as usize
    }

    pub fn seq(&self) -> u8 {
        self.control[1]
    }

    /// 帧头与负载的总长度。
    pub fn frame_len(&self) -> usize {
        HTC_HDR_LENGTH + self.payload_len as usize
    }

    pub fn encode(&self) -> [u8; HTC_HDR_LENGTH] {
        let len = self.payload_len.to_le_bytes();
        let reserved = self.reserved.to_le_bytes();
        [
            self.endpoint.0,
            self.flags,
            len[0],
            len[1],
            self.control[0],
            self.control[1],
            reserved[0],
            reserved[1],
        ]
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(&self.encode());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HTC_HDR_LENGTH {
            return Err(WireError::Truncated {
                needed: HTC_HDR_LENGTH,
                available: buf.len(),
            });
        }
        Ok(Self {
            endpoint: EndpointId(buf[0]),
            flags: buf[1],
            payload_len: u16::from_le_bytes([buf[2], buf[3]]),
            control: [buf[4], buf[5]],
            reserved: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// 聚合包内单个成员的帧头与负载。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMember {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// 拆分一个聚合包，按成员帧头中的填充字节数跳过对齐间隙。
///
/// 末尾成员的填充允许缺失（USB 总线不发送最后一段填充）。
pub fn split_bundle(bundle: &Bytes) -> Result<Vec<BundleMember>, WireError> {
    let mut members = Vec::new();
    let mut offset = 0;
    while offset < bundle.len() {
        let header = FrameHeader::decode(&bundle[offset..])?;
        let end = offset + header.frame_len();
        if end > bundle.len() {
            return Err(WireError::Truncated {
                needed: end,
                available: bundle.len(),
            });
        }
        members.push(BundleMember {
            header,
            payload: bundle.slice(offset + HTC_HDR_LENGTH..end),
        });
        offset = (end + header.reserved as usize).min(bundle.len());
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_matches_wire() {
        let mut header = FrameHeader::new(EndpointId(2), FLAG_NEED_CREDIT_UPDATE, 0x0134).with_seq(9);
        header.reserved = 0x0003;
        assert_eq!(header.encode(), [2, 0x01, 0x34, 0x01, 0, 9, 3, 0]);
        assert_eq!(FrameHeader::decode(&header.encode()), Ok(header));
    }

    #[test]
    fn short_header_is_rejected() {
        assert_eq!(
            FrameHeader::decode(&[1, 2, 3]),
            Err(WireError::Truncated {
                needed: HTC_HDR_LENGTH,
                available: 3
            })
        );
    }
}
