//! 端点注册表条目。
//!
//! 端点数组在初始化时按 `max_endpoints` 一次性创建，连接服务时激活（服务编号非零即“占用”），
//! 停止时清空队列。所有字段都在传输层 TX 锁内读写。

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use htc_buffer::Handle;

use crate::bus::PipeMapping;
use crate::ids::{EndpointId, PipeId, ServiceId, TransferToken};
use crate::packet::{HtcPacket, PacketQueue};
use crate::sink::EndpointSink;

/// 端点统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointStats {
    pub tx_posted: u64,
    pub tx_issued: u64,
    pub tx_dropped: u64,
    pub tx_completed: u64,
    pub tx_bundles: u64,
    pub tx_packets_bundled: u64,
    pub tx_credit_low_indications: u64,
    pub tx_credits_consumed: u64,
    pub tx_credits_returned: u64,
    pub tx_credit_rpts: u64,
    pub tx_credits_from_rx: u64,
    pub tx_credits_from_ep0: u64,
    pub tx_credits_from_other: u64,
    pub rx_received: u64,
}

/// 读取统计的方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsAction {
    Sample,
    SampleAndClear,
    Clear,
}

/// 已提交给总线、等待完成的传输。
#[derive(Debug)]
pub(crate) enum InFlight {
    Single {
        token: TransferToken,
        packet: HtcPacket,
    },
    Bundle {
        token: TransferToken,
        container: Handle,
        frame: Bytes,
        members: PacketQueue,
    },
}

impl InFlight {
    pub(crate) fn token(&self) -> TransferToken {
        match self {
            InFlight::Single { token, .. } | InFlight::Bundle { token, .. } => *token,
        }
    }
}

pub(crate) struct Endpoint {
    pub(crate) id: EndpointId,
    pub(crate) service: ServiceId,
    pub(crate) pipes: PipeMapping,
    pub(crate) max_msg_len: usize,
    pub(crate) max_queue_depth: usize,
    pub(crate) credit_flow: bool,
    pub(crate) tx_credits: u32,
    pub(crate) credit_size: u32,
    pub(crate) credits_per_max_msg: u32,
    pub(crate) tx_queue: PacketQueue,
    pub(crate) lookup: VecDeque<InFlight>,
    pub(crate) seq_no: u8,
    /// 正在执行排空循环的调用者数量，大于 1 的进入者立即返回。
    pub(crate) tx_process_count: u32,
    pub(crate) sink: Option<Arc<dyn EndpointSink>>,
    pub(crate) stats: EndpointStats,
}

impl Endpoint {
    pub(crate) fn inert(id: EndpointId) -> Self {
        Self {
            id,
            service: ServiceId::UNUSED,
            pipes: PipeMapping::default(),
            max_msg_len: 0,
            max_queue_depth: 0,
            credit_flow: true,
            tx_credits: 0,
            credit_size: 0,
            credits_per_max_msg: 0,
            tx_queue: PacketQueue::new(),
            lookup: VecDeque::new(),
            seq_no: 0,
            tx_process_count: 0,
            sink: None,
            stats: EndpointStats::default(),
        }
    }

    pub(crate) fn in_use(&self) -> bool {
        !self.service.is_unused()
    }

    pub(crate) fn ul_pipe(&self) -> PipeId {
        self.pipes.ul_pipe
    }

    pub(crate) fn next_seq(&mut self) -> u8 {
        let seq = self.seq_no;
        self.seq_no = self.seq_no.wrapping_add(1);
        seq
    }

    /// 在途队列匹配：先比对队首，未命中再线性扫描并保持其余条目顺序。
    ///
    /// 返回条目与是否走了扫描路径。
    pub(crate) fn take_in_flight(&mut self, token: TransferToken) -> Option<(InFlight, bool)> {
        if self.lookup.front().map(InFlight::token) == Some(token) {
            return self.lookup.pop_front().map(|entry| (entry, false));
        }
        let index = self.lookup.iter().position(|entry| entry.token() == token)?;
        self.lookup.remove(index).map(|entry| (entry, true))
    }

    /// 占用中的在途包数量（聚合包按成员计）。
    pub(crate) fn in_flight_packets(&self) -> usize {
        self.lookup
            .iter()
            .map(|entry| match entry {
                InFlight::Single { .. } => 1,
                InFlight::Bundle { members, .. } => members.len(),
            })
            .sum()
    }

    pub(crate) fn reset_stats(&mut self) {
        self.stats = EndpointStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(token: u64) -> InFlight {
        InFlight::Single {
            token: TransferToken(token),
            packet: HtcPacket::new(EndpointId(1), Bytes::from_static(b"x")),
        }
    }

    #[test]
    fn lookup_prefers_head_then_scans_in_order() {
        let mut ep = Endpoint::inert(EndpointId(1));
        ep.lookup.extend([single(1), single(2), single(3)]);
        let (entry, scanned) = ep.take_in_flight(TransferToken(1)).expect("队首命中");
        assert_eq!(entry.token(), TransferToken(1));
        assert!(!scanned);
        let (entry, scanned) = ep.take_in_flight(TransferToken(3)).expect("扫描命中");
        assert_eq!(entry.token(), TransferToken(3));
        assert!(scanned);
        assert_eq!(ep.lookup.front().map(InFlight::token), Some(TransferToken(2)));
        assert!(ep.take_in_flight(TransferToken(9)).is_none());
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut ep = Endpoint::inert(EndpointId(2));
        ep.seq_no = u8::MAX;
        assert_eq!(ep.next_seq(), u8::MAX);
        assert_eq!(ep.next_seq(), 0);
    }
}
