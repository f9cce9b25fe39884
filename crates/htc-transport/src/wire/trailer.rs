//! 接收帧尾部记录（trailer）的解析与编码。
//!
//! 尾部是一串 `{record_id: u8, len: u8, data[len]}` 记录，目标借此捎带信用回报与预读信息。
//! 解析结果是带类型的 [`TrailerRecord`]，接收路径只对枚举做匹配，不再接触原始偏移。

use bytes::{BufMut, Bytes, BytesMut};

use super::WireError;
use crate::ids::EndpointId;

/// 记录头长度（id + len），也是合法尾部的最小长度。
pub const RECORD_HEADER_LEN: usize = 2;

pub const RECORD_NULL: u8 = 0;
pub const RECORD_CREDITS: u8 = 1;
pub const RECORD_LOOKAHEAD: u8 = 2;
pub const RECORD_LOOKAHEAD_BUNDLE: u8 = 3;

const CREDIT_ENTRY_LEN: usize = 2;
const LOOKAHEAD_LEN: usize = 6;
const LOOKAHEAD_BUNDLE_ENTRY_LEN: usize = 4;

/// 单条信用回报：目标向某端点归还的信用数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditReport {
    pub endpoint: EndpointId,
    pub credits: u8,
}

/// 解码后的尾部记录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrailerRecord {
    CreditReport(Vec<CreditReport>),
    /// 预读的下一帧帧头前 4 字节；`valid` 由前后校验字节互补判定。
    Lookahead { valid: bool, lookahead: [u8; 4] },
    LookaheadBundle(Vec<[u8; 4]>),
    Unknown { id: u8, data: Bytes },
}

impl TrailerRecord {
    fn id(&self) -> u8 {
        match self {
            TrailerRecord::CreditReport(_) => RECORD_CREDITS,
            TrailerRecord::Lookahead { .. } => RECORD_LOOKAHEAD,
            TrailerRecord::LookaheadBundle(_) => RECORD_LOOKAHEAD_BUNDLE,
            TrailerRecord::Unknown { id, .. } => *id,
        }
    }
}

/// 解析整段尾部。
///
/// # 契约说明（What）
/// - 记录声明长度超过剩余字节时返回 [`WireError::RecordOverrun`]，整帧应被丢弃；
/// - `NULL` 记录被跳过，未知记录以 [`TrailerRecord::Unknown`] 原样保留，由调用方记录日志后忽略；
/// - 信用记录长度必须是 2 的整数倍，否则视为格式错误。
pub fn parse_trailer(trailer: &Bytes) -> Result<Vec<TrailerRecord>, WireError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < trailer.len() {
        let remaining = trailer.len() - offset;
        if remaining < RECORD_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: RECORD_HEADER_LEN,
                available: remaining,
            });
        }
        let id = trailer[offset];
        let len = trailer[offset + 1] as usize;
        let body_start = offset + RECORD_HEADER_LEN;
        if len > trailer.len() - body_start {
            return Err(WireError::RecordOverrun {
                id,
                len,
                remaining: trailer.len() - body_start,
            });
        }
        let body = &trailer[body_start..body_start + len];
        match id {
            RECORD_NULL => {}
            RECORD_CREDITS => {
                if len % CREDIT_ENTRY_LEN != 0 {
                    return Err(WireError::MalformedRecord { id, len });
                }
                let entries = body
                    .chunks_exact(CREDIT_ENTRY_LEN)
                    .map(|pair| CreditReport {
                        endpoint: EndpointId(pair[0]),
                        credits: pair[1],
                    })
                    .collect();
                records.push(TrailerRecord::CreditReport(entries));
            }
            RECORD_LOOKAHEAD => {
                if len != LOOKAHEAD_LEN {
                    return Err(WireError::MalformedRecord { id, len });
                }
                let lookahead = [body[1], body[2], body[3], body[4]];
                records.push(TrailerRecord::Lookahead {
                    valid: body[0] == !body[5],
                    lookahead,
                });
            }
            RECORD_LOOKAHEAD_BUNDLE => {
                if len % LOOKAHEAD_BUNDLE_ENTRY_LEN != 0 {
                    return Err(WireError::MalformedRecord { id, len });
                }
                let entries = body
                    .chunks_exact(LOOKAHEAD_BUNDLE_ENTRY_LEN)
                    .map(|c| [c[0], c[1], c[2], c[3]])
                    .collect();
                records.push(TrailerRecord::LookaheadBundle(entries));
            }
            _ => records.push(TrailerRecord::Unknown {
                id,
                data: trailer.slice(body_start..body_start + len),
            }),
        }
        offset = body_start + len;
    }
    Ok(records)
}

/// 将记录编码为尾部字节，供目标模拟器与测试构造接收帧。
pub fn encode_trailer(records: &[TrailerRecord], out: &mut BytesMut) {
    for record in records {
        let mut body = BytesMut::new();
        match record {
            TrailerRecord::CreditReport(entries) => {
                for entry in entries {
                    body.put_u8(entry.endpoint.0);
                    body.put_u8(entry.credits);
                }
            }
            TrailerRecord::Lookahead { valid, lookahead } => {
                let pre = 0x55u8;
                body.put_u8(pre);
                body.put_slice(lookahead);
                body.put_u8(if *valid { !pre } else { pre });
            }
            TrailerRecord::LookaheadBundle(entries) => {
                for entry in entries {
                    body.put_slice(entry);
                }
            }
            TrailerRecord::Unknown { data, .. } => body.put_slice(data),
        }
        out.put_u8(record.id());
        out.put_u8(body.len() as u8);
        out.put_slice(&body);
    }
}
