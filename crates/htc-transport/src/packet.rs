//! 传输层数据包与队列。
//!
//! 数据包在任一时刻只属于一个队列（调用方队列、发送队列、在途队列或完成回调），
//! 以值语义在队列之间移动，所有权转移即队列归属转移。

use std::collections::VecDeque;

use bytes::Bytes;
use htc_buffer::Handle;

use crate::ids::EndpointId;

/// 先进先出的数据包队列。
pub type PacketQueue = VecDeque<HtcPacket>;

/// 发送完成时需要执行的附加动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxTag {
    #[default]
    Normal,
    /// 发送成功后立即释放运行时电源保持。
    RuntimePut,
    /// 电源管理自身产生的包：优先调度，不获取也不释放电源保持。
    AutoPm,
}

/// 数据包的完成状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketStatus {
    #[default]
    Pending,
    Success,
    /// 被 flush/stop 取消。
    Canceled,
    /// 发送队列已满且上层选择丢弃。
    NoResource,
}

/// 发送方向的调度信息，由调度器在出队时填写。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxInfo {
    pub seq_no: u8,
    pub credits_used: u32,
    pub send_flags: u8,
    pub tag: TxTag,
}

#[derive(Debug, Clone)]
pub struct HtcPacket {
    endpoint: EndpointId,
    payload: Bytes,
    context: u64,
    user_tag: u32,
    status: PacketStatus,
    pub(crate) tx: TxInfo,
    /// 控制消息借用的池容器，完成时归还。
    pub(crate) lease: Option<Handle>,
}

impl HtcPacket {
    pub fn new(endpoint: EndpointId, payload: Bytes) -> Self {
        Self {
            endpoint,
            payload,
            context: 0,
            user_tag: 0,
            status: PacketStatus::Pending,
            tx: TxInfo::default(),
            lease: None,
        }
    }

    /// 调用方不透明上下文，完成回调原样带回。
    pub fn with_context(mut self, context: u64) -> Self {
        self.context = context;
        self
    }

    pub fn with_tag(mut self, tag: TxTag) -> Self {
        self.tx.tag = tag;
        self
    }

    /// flush 按此标签筛选。
    pub fn with_user_tag(mut self, user_tag: u32) -> Self {
        self.user_tag = user_tag;
        self
    }

    pub(crate) fn received(endpoint: EndpointId, payload: Bytes, seq_no: u8) -> Self {
        let mut packet = Self::new(endpoint, payload);
        packet.status = PacketStatus::Success;
        packet.tx.seq_no = seq_no;
        packet
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn user_tag(&self) -> u32 {
        self.user_tag
    }

    pub fn status(&self) -> PacketStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: PacketStatus) {
        self.status = status;
    }

    pub fn tx_info(&self) -> &TxInfo {
        &self.tx
    }

    pub fn tag(&self) -> TxTag {
        self.tx.tag
    }

    /// 回滚调度器写入的信用与标志，包重新回到发送队列前调用。
    pub(crate) fn reset_admission(&mut self) -> u32 {
        let credits = self.tx.credits_used;
        self.tx.credits_used = 0;
        self.tx.send_flags = 0;
        credits
    }
}
