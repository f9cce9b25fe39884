//! 主机接口总线（HIF）抽象。
//!
//! # 模块定位（Why）
//! - 传输层只关心“把一段字节交给某个管道”与“管道还有多少发送槽位”，
//!   SDIO/USB/PCIe 等具体总线差异全部收敛到 [`HifBus`] 之后；
//! - 完成与接收事件由总线实现主动调用 [`crate::HtcTransport::tx_completion_handler`] 与
//!   [`crate::HtcTransport::rx_completion_handler`] 上报，传输层不持有总线线程。
//!
//! # 契约说明（What）
//! - `send` 返回 `Ok` 后，总线必须在传输结束时恰好上报一次完成；返回 `Err` 则视为从未提交；
//! - 完成回调可以在 `send` 内部同步触发，传输层调用 `send` 时不持有任何内部锁。

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::BusError;
use crate::ids::{EndpointId, PipeId, ServiceId, TransferToken};
use crate::wire::HTC_HDR_LENGTH;

/// 总线类型，决定聚合发送策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Sdio,
    Usb,
    Pcie,
}

/// 服务到物理管道的映射。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeMapping {
    pub ul_pipe: PipeId,
    pub dl_pipe: PipeId,
    /// 上行管道需要主动轮询完成。
    pub ul_polled: bool,
    pub dl_polled: bool,
}

/// 交给总线的一帧数据。
///
/// 单帧的帧头与负载是两个独立片段，调用方的负载缓冲在整个生命周期内不被修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Single {
        header: [u8; HTC_HDR_LENGTH],
        payload: Bytes,
    },
    Bundle(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Single { payload, .. } => HTC_HDR_LENGTH + payload.len(),
            Frame::Bundle(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self, Frame::Bundle(_))
    }

    /// 拼接为连续字节；聚合帧直接返回共享视图。
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Frame::Single { header, payload } => {
                let mut out = BytesMut::with_capacity(self.len());
                out.put_slice(header);
                out.put_slice(payload);
                out.freeze()
            }
            Frame::Bundle(bytes) => bytes.clone(),
        }
    }
}

/// 一次总线发送请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTransfer {
    pub pipe: PipeId,
    pub endpoint: EndpointId,
    pub token: TransferToken,
    pub frame: Frame,
}

pub trait HifBus: Send + Sync {
    fn send(&self, transfer: BusTransfer) -> Result<(), BusError>;

    /// 上行管道当前可用的发送槽位，非信用流控端点以此限流。
    fn free_transfer_slots(&self, pipe: PipeId) -> usize;

    fn map_service_to_pipe(&self, service: ServiceId) -> Result<PipeMapping, BusError>;

    fn bus_type(&self) -> BusType;

    /// 总线是否会把一帧拆成多段上报。
    fn supports_rx_reassembly(&self) -> bool {
        false
    }

    /// 轮询式上行管道在发送前回收已完成的槽位。
    fn send_complete_check(&self, _pipe: PipeId, _force: bool) {}

    /// 获取运行时电源保持；返回 `Err` 表示设备正在恢复，本轮不应继续发送。
    fn pm_runtime_get(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn pm_runtime_put(&self) {}
}
