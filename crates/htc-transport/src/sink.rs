//! 上层服务与目标事件的回调接口。

use crate::error::HtcError;
use crate::packet::{HtcPacket, PacketQueue};

/// 发送队列溢出时上层的处置选择。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFullAction {
    /// 仍然入队，超出深度上限。
    Keep,
    /// 丢弃，该包以 `NoResource` 状态完成。
    Drop,
}

/// 端点的上层消费者。
///
/// # 契约说明（What）
/// - 所有回调都在传输层不持锁的情况下调用，实现可以在回调内再次调用发送接口；
/// - 同一端点的发送完成按提交顺序回调；接收回调按到达顺序；
/// - 批量回调默认逐个转发到单包回调，只有能批量处理的实现才需要覆盖。
pub trait EndpointSink: Send + Sync {
    fn on_receive(&self, packet: HtcPacket);

    fn on_receive_batch(&self, packets: PacketQueue) {
        for packet in packets {
            self.on_receive(packet);
        }
    }

    fn on_send_complete(&self, packet: HtcPacket);

    fn on_send_complete_batch(&self, packets: PacketQueue) {
        for packet in packets {
            self.on_send_complete(packet);
        }
    }

    fn on_send_queue_full(&self, _packet: &HtcPacket) -> SendFullAction {
        SendFullAction::Keep
    }

    /// 总线资源恢复，上层可以重新开始投递。
    fn on_resume_tx_queue(&self) {}
}

/// 目标整体状态事件。
pub trait TargetEvents: Send + Sync {
    /// 目标确认挂起（`nack = false`）或拒绝挂起（`nack = true`）。
    fn on_suspend_complete(&self, _nack: bool) {}

    fn on_initial_wakeup(&self) {}

    fn on_target_failure(&self, _error: &HtcError) {}
}

/// 不关心目标事件时使用。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTargetEvents;

impl TargetEvents for NoopTargetEvents {}
