//! 发送准入：决定本轮可以从端点队列取出哪些包。
//!
//! # 信用准入（What）
//! - 队首包需要 `ceil((payload + 帧头) / credit_size)` 个信用（至少 1 个），控制端点免信用；
//! - 余额不足即停止，不跳过队首，保证 FIFO；
//! - 扣减后余额不高于“单条最大消息所需信用”时在包上置 `NEED_CREDIT_UPDATE`，请求目标尽快回送；
//! - 电源管理包（[`TxTag::AutoPm`]）先被抽出单独准入，未准入的部分放回队列头部。

use std::mem;

use tracing::trace;

use crate::bus::HifBus;
use crate::credit_history::CreditEvent;
use crate::diagnostics::TransportDiagnostics;
use crate::endpoint::Endpoint;
use crate::observability::TARGET_CREDIT;
use crate::packet::{PacketQueue, TxTag};
use crate::wire::{FLAG_NEED_CREDIT_UPDATE, HTC_HDR_LENGTH};

/// 发送 `payload_len` 字节负载所需的信用数。
///
/// `credit_size` 为 0 表示目标尚未报告缓冲大小，此时任何包都无法准入。
pub fn credits_required(payload_len: usize, credit_size: u32) -> u32 {
    if credit_size == 0 {
        return u32::MAX;
    }
    let transfer = payload_len + HTC_HDR_LENGTH;
    let credits = transfer.div_ceil(credit_size as usize).max(1);
    u32::try_from(credits).unwrap_or(u32::MAX)
}

/// 把电源管理包从队列中抽出，其余包保持相对顺序。
fn extract_pm_packets(queue: &mut PacketQueue) -> PacketQueue {
    if !queue.iter().any(|p| p.tag() == TxTag::AutoPm) {
        return PacketQueue::new();
    }
    let (pm, rest): (PacketQueue, PacketQueue) = mem::take(queue)
        .into_iter()
        .partition(|p| p.tag() == TxTag::AutoPm);
    *queue = rest;
    pm
}

fn return_pm_packets(queue: &mut PacketQueue, mut pm: PacketQueue) {
    while let Some(packet) = pm.pop_back() {
        queue.push_front(packet);
    }
}

pub(crate) fn admit_credit_based(
    ep: &mut Endpoint,
    diagnostics: &TransportDiagnostics,
    bus: &dyn HifBus,
) -> PacketQueue {
    let mut admitted = PacketQueue::new();
    let mut pm_queue = extract_pm_packets(&mut ep.tx_queue);
    let from_pm = !pm_queue.is_empty();
    let queue = if from_pm {
        &mut pm_queue
    } else {
        &mut ep.tx_queue
    };
    while let Some(head) = queue.front() {
        let required = if ep.id.is_control() {
            0
        } else {
            credits_required(head.len(), ep.credit_size)
        };
        if required > ep.tx_credits {
            trace!(
                target: TARGET_CREDIT,
                endpoint = %ep.id,
                required,
                balance = ep.tx_credits,
                "insufficient credits"
            );
            break;
        }
        if !from_pm && bus.pm_runtime_get().is_err() {
            trace!(target: TARGET_CREDIT, endpoint = %ep.id, "bus resuming, hold admission");
            break;
        }
        let Some(mut packet) = queue.pop_front() else {
            break;
        };
        ep.tx_credits -= required;
        ep.stats.tx_credits_consumed += u64::from(required);
        let mut flags = 0;
        if required > 0 {
            diagnostics.record(CreditEvent::ConsumeCredit, ep.id, ep.tx_credits, queue.len());
            if ep.tx_credits <= ep.credits_per_max_msg {
                flags |= FLAG_NEED_CREDIT_UPDATE;
                ep.stats.tx_credit_low_indications += 1;
                diagnostics.record(CreditEvent::RequestCredit, ep.id, ep.tx_credits, queue.len());
            }
        }
        packet.tx.credits_used = required;
        packet.tx.send_flags = flags;
        admitted.push_back(packet);
    }
    return_pm_packets(&mut ep.tx_queue, pm_queue);
    admitted
}

/// 非信用流控端点：每个包占用一个总线发送槽位。
pub(crate) fn admit_by_resources(
    ep: &mut Endpoint,
    mut budget: usize,
    bus: &dyn HifBus,
) -> PacketQueue {
    let mut admitted = PacketQueue::new();
    let mut pm_queue = extract_pm_packets(&mut ep.tx_queue);
    let from_pm = !pm_queue.is_empty();
    let queue = if from_pm {
        &mut pm_queue
    } else {
        &mut ep.tx_queue
    };
    while budget > 0 && !queue.is_empty() {
        if !from_pm && bus.pm_runtime_get().is_err() {
            break;
        }
        let Some(packet) = queue.pop_front() else {
            break;
        };
        budget -= 1;
        admitted.push_back(packet);
    }
    return_pm_packets(&mut ep.tx_queue, pm_queue);
    admitted
}

/// 把目标回报的信用记入余额；余额封顶于 `u32::MAX`，封顶时返回 `false`。
pub(crate) fn return_credits(ep: &mut Endpoint, credits: u32) -> bool {
    match ep.tx_credits.checked_add(credits) {
        Some(balance) => {
            ep.tx_credits = balance;
            true
        }
        None => {
            ep.tx_credits = u32::MAX;
            false
        }
    }
}
