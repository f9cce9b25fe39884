//! 聚合发送：把多个已准入的小包拼成一次总线传输。
//!
//! # 契约说明（What）
//! - 每个成员保留自己的帧头（带 `SEND_BUNDLE` 标志，保留字段写入填充字节数），目标据此拆分；
//! - 成员按 `credit_size` 对齐，聚合包总长不超过 `max_msgs × credit_size`；
//! - 放不下的成员关闭当前聚合包；剩余包不足 `min_msgs` 时交回单包路径；
//! - 总线拒绝时成员原样退回，由排空循环连同信用一起放回发送队列头部。

use std::mem;

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::bus::{BusTransfer, BusType, Frame};
use crate::diagnostics::bump;
use crate::endpoint::InFlight;
use crate::ids::{EndpointId, PipeId};
use crate::observability::TARGET_SEND;
use crate::packet::{PacketQueue, TxTag};
use crate::transport::HtcTransport;
use crate::wire::{FLAG_SEND_BUNDLE, FrameHeader, HTC_HDR_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BundleParams {
    pub(crate) credit_size: usize,
    pub(crate) max_msgs: usize,
    pub(crate) min_msgs: usize,
}

impl BundleParams {
    fn capacity(&self) -> usize {
        self.max_msgs * self.credit_size
    }
}

/// 使成员帧按信用大小对齐所需的填充字节数。
pub(crate) fn credit_pad(transfer_len: usize, credit_size: usize) -> usize {
    (credit_size - transfer_len % credit_size) % credit_size
}

impl HtcTransport {
    /// 从 `queue` 头部连续取包组成聚合帧并提交，直到剩余包不足以成团。
    pub(crate) fn issue_bundles(
        &self,
        endpoint: EndpointId,
        pipe: PipeId,
        queue: &mut PacketQueue,
        params: BundleParams,
    ) -> Result<(), PacketQueue> {
        let capacity = params.capacity();
        while queue.len() >= params.min_msgs {
            let container = self.bundle_pool.acquire();
            let mut buffer = self
                .bundle_pool
                .with(container, mem::take)
                .unwrap_or_default();
            buffer.clear();
            buffer.reserve(capacity);

            let mut members = PacketQueue::new();
            let mut last_pad = 0;
            while members.len() < params.max_msgs {
                let Some(head) = queue.front() else {
                    break;
                };
                let transfer = HTC_HDR_LENGTH + head.len();
                if transfer > capacity - buffer.len() {
                    break;
                }
                let Some(packet) = queue.pop_front() else {
                    break;
                };
                let pad = credit_pad(transfer, params.credit_size);
                let mut header = FrameHeader::new(
                    endpoint,
                    packet.tx.send_flags | FLAG_SEND_BUNDLE,
                    packet.len() as u16,
                )
                .with_seq(packet.tx.seq_no);
                header.reserved = pad as u16;
                header.write_to(&mut buffer);
                buffer.put_slice(packet.payload());
                // 容量是 credit_size 的整数倍，补齐后不会越界。
                buffer.put_bytes(0, pad);
                last_pad = pad;
                members.push_back(packet);
            }

            if members.len() < params.min_msgs {
                while let Some(packet) = members.pop_back() {
                    queue.push_front(packet);
                }
                self.park_bundle_buffer(container, buffer);
                break;
            }
            if self.bus.bus_type() == BusType::Usb {
                buffer.truncate(buffer.len() - last_pad);
            }
            self.dispatch_bundle(endpoint, pipe, container, buffer, members, queue)?;
        }
        Ok(())
    }

    fn dispatch_bundle(
        &self,
        endpoint: EndpointId,
        pipe: PipeId,
        container: htc_buffer::Handle,
        buffer: BytesMut,
        members: PacketQueue,
        queue: &mut PacketQueue,
    ) -> Result<(), PacketQueue> {
        let frame = buffer.freeze();
        let token = self.next_token();
        let count = members.len();
        let runtime_puts = members
            .iter()
            .filter(|p| p.tag() == TxTag::RuntimePut)
            .count();
        {
            let mut state = self.tx.lock();
            let ep = &mut state.endpoints[endpoint.index()];
            ep.stats.tx_bundles += 1;
            ep.stats.tx_packets_bundled += count as u64;
            ep.stats.tx_issued += count as u64;
            ep.lookup.push_back(InFlight::Bundle {
                token,
                container,
                frame: frame.clone(),
                members,
            });
        }
        self.diagnostics.record_bundle(count);
        trace!(target: TARGET_SEND, %endpoint, count, bytes = frame.len(), "bundle issued");
        let transfer = BusTransfer {
            pipe,
            endpoint,
            token,
            frame: Frame::Bundle(frame),
        };
        match self.bus.send(transfer) {
            Ok(()) => {
                bump(&self.diagnostics.counters.bus_sends);
                for _ in 0..runtime_puts {
                    self.bus.pm_runtime_put();
                }
                Ok(())
            }
            Err(error) => {
                self.note_send_failure(endpoint, &error);
                let entry = {
                    let mut state = self.tx.lock();
                    let ep = &mut state.endpoints[endpoint.index()];
                    ep.stats.tx_bundles = ep.stats.tx_bundles.saturating_sub(1);
                    ep.stats.tx_packets_bundled =
                        ep.stats.tx_packets_bundled.saturating_sub(count as u64);
                    ep.stats.tx_issued = ep.stats.tx_issued.saturating_sub(count as u64);
                    ep.take_in_flight(token)
                };
                let mut stalled = PacketQueue::new();
                if let Some((
                    InFlight::Bundle {
                        container,
                        frame,
                        members,
                        ..
                    },
                    _,
                )) = entry
                {
                    self.recycle_bundle(container, frame);
                    stalled = members;
                }
                stalled.append(queue);
                Err(stalled)
            }
        }
    }

    /// 未发出的聚合缓冲放回池槽位。
    fn park_bundle_buffer(&self, container: htc_buffer::Handle, buffer: BytesMut) {
        self.recycle_bundle(container, buffer.freeze());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_aligns_to_credit_boundary() {
        assert_eq!(credit_pad(64, 64), 0);
        assert_eq!(credit_pad(18, 64), 46);
        assert_eq!(credit_pad(65, 64), 63);
    }
}
