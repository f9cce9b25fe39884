//! 总线发送完成处理。

use tracing::warn;

use crate::diagnostics::bump;
use crate::endpoint::InFlight;
use crate::ids::{EndpointId, TransferToken};
use crate::observability::TARGET_SEND;
use crate::packet::{PacketQueue, PacketStatus};
use crate::transport::HtcTransport;

impl HtcTransport {
    /// 总线完成回调。
    ///
    /// # 逻辑（How）
    /// 1. 在端点在途队列中查找 `token`：先比对队首，未命中再扫描；
    /// 2. 找不到时记录日志并视为已处理（重复或迟到的完成）；
    /// 3. 释放电源保持，单包直接完成，聚合包按成员顺序逐个完成后归还容器；
    /// 4. 非信用流控端点的发送速率受总线槽位约束，完成即意味着槽位释放，因此立即重新排空。
    pub fn tx_completion_handler(&self, endpoint: EndpointId, token: TransferToken) {
        bump(&self.diagnostics.counters.tx_completions);
        let (entry, sink, credit_flow) = {
            let mut state = self.tx.lock();
            let Some(ep) = state.endpoints.get_mut(endpoint.index()) else {
                warn!(target: TARGET_SEND, %endpoint, "completion for out-of-range endpoint");
                bump(&self.diagnostics.counters.unmatched_completions);
                return;
            };
            let Some((entry, scanned)) = ep.take_in_flight(token) else {
                warn!(
                    target: TARGET_SEND,
                    %endpoint,
                    token = token.0,
                    "completion matches no in-flight transfer"
                );
                bump(&self.diagnostics.counters.unmatched_completions);
                return;
            };
            if scanned {
                bump(&self.diagnostics.counters.lookup_scans);
            }
            ep.stats.tx_completed += match &entry {
                InFlight::Single { .. } => 1,
                InFlight::Bundle { members, .. } => members.len() as u64,
            };
            (entry, ep.sink.clone(), ep.credit_flow)
        };

        match entry {
            InFlight::Single { packet, .. } => {
                self.release_pm_hold(&packet);
                self.complete_tx(sink, PacketQueue::from([packet]), PacketStatus::Success);
            }
            InFlight::Bundle {
                container,
                frame,
                members,
                ..
            } => {
                for packet in &members {
                    self.release_pm_hold(packet);
                }
                self.complete_tx(sink, members, PacketStatus::Success);
                self.recycle_bundle(container, frame);
            }
        }

        if !credit_flow {
            self.drain(endpoint);
        }
    }
}
