#![deny(unsafe_code)]
#![doc = r#"
# htc-transport

## 设计动机（Why）
- **定位**：主机与无线固件之间的 HTC（Host-Target Communication）传输层。把控制、WMI、数据等逻辑服务
  复用到少量物理管道上，以信用经济约束发送速率，并支持多包聚合；
- **架构角色**：向下只依赖抽象总线 [`HifBus`]（SDIO/USB/PCIe 的适配由宿主提供），向上通过
  [`EndpointSink`] 把收包与发送完成交还给各服务；
- **核心承诺**：多线程并发收发下不丢包、不漏信用，同一端点的包按提交顺序上线。

## 核心契约（What）
- 一个 [`HtcTransport`] 对应一个目标设备，创建后控制端点（EP0）即可用；
- 初始化顺序：`wait_target` 等待就绪消息 → 逐个 `connect_service` → `start`；
- 每个被接受的发送包恰好收到一次完成回调，状态为成功、取消或资源不足之一；
- 逐帧的接收错误只丢弃该帧并记日志，握手、配置与分配失败才同步返回 [`HtcError`]。

## 实现策略（How）
- **发送**：入队后由排空循环在 TX 锁内做信用准入，放锁后调用总线，失败时把信用与包一起退回队列头部；
- **接收**：可选的分段重组 → 帧头与尾部校验 → 信用回报立即驱动对应端点重新排空 → 分发；
- **诊断**：[`TransportDiagnostics`] 维护信用事件环形历史、路径计数与聚合大小直方图；
- **缓冲**：聚合帧与控制消息从 `htc-buffer` 的容器池借用，完成后回收底层内存。

## 风险与考量（Trade-offs）
- 所有端点共享一把粗粒度 TX 锁，临界区只含队列与计数操作；端点数量很大时可能需要拆分；
- 电源管理钩子 `pm_runtime_get/put` 可能在持锁状态下被调用，总线实现不得在其中回调传输层。
"#]

pub mod bus;
pub mod config;
pub mod credit_history;
pub mod diagnostics;
pub mod endpoint;
pub mod error;
pub mod ids;
pub mod observability;
pub mod packet;
mod recv;
mod send;
mod service;
pub mod sink;
pub mod test_stubs;
mod transport;
pub mod wire;

pub use bus::{BusTransfer, BusType, Frame, HifBus, PipeMapping};
pub use config::{ConfigError, CreditAllocation, HtcConfig, RxReassembly};
pub use credit_history::{CreditEvent, CreditHistory, CreditRecord};
pub use diagnostics::{CounterSnapshot, TransportDiagnostics};
pub use endpoint::{EndpointStats, StatsAction};
pub use error::{BusError, ErrorCategory, HtcError};
pub use ids::{EndpointId, PipeId, ServiceId, TransferToken};
pub use packet::{HtcPacket, PacketQueue, PacketStatus, TxInfo, TxTag};
pub use send::FLUSH_ALL_TAGS;
pub use send::admission::credits_required;
pub use service::{ConnectRequest, ConnectResponse, TargetCapabilities};
pub use sink::{EndpointSink, NoopTargetEvents, SendFullAction, TargetEvents};
pub use transport::HtcTransport;
pub use wire::control::{ConnectionFlags, ServiceStatus};
