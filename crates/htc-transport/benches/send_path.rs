use std::env;
use std::hint::black_box;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use criterion::Criterion;
use htc_transport::test_stubs::{accept, connect_response_frame, credit_report_frame, ready_frame};
use htc_transport::wire::control::ControlMessage;
use htc_transport::{
    BusError, BusTransfer, BusType, ConnectRequest, CreditAllocation, EndpointId, EndpointSink,
    Frame, HifBus, HtcConfig, HtcPacket, HtcTransport, PacketQueue, PipeId, PipeMapping,
    ServiceId,
};
use parking_lot::Mutex;

/// 发送路径基准：准入、组帧、提交总线与完成回调的整体开销。
///
/// # 设计背景（Why）
/// - 每个数据包都要经过 TX 锁内准入、放锁调用总线、完成回调查找在途队列这几步，锁与队列操作是主要成本；
/// - 聚合发送把多个包拼进池化缓冲，需要确认拷贝与容器借还没有抵消减少总线调用带来的收益。
///
/// # 逻辑解析（How）
/// - `LoopbackBus` 同步应答连接请求并在 `send` 内立即回调完成，不记录任何传输，避免基准中内存增长；
/// - 每轮迭代发送后注入一帧信用回报，使余额回到初值，顺带覆盖接收路径的尾部解析。
///
/// # 注意事项（Trade-offs）
/// - 同步完成掩盖了真实总线的异步时序，数值只用于回归对比。
fn main() {
    let quick_mode = env::args().skip(1).any(|arg| arg == "--quick");

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_single_send(&mut criterion);
    bench_bundled_send(&mut criterion);
    criterion.final_summary();
}

const EP2: EndpointId = EndpointId(2);

fn bench_single_send(c: &mut Criterion) {
    let transport = loopback_transport(BusType::Pcie, None);
    let payload = Bytes::from(vec![0x5Au8; 256]);
    let refill = credit_report_frame(EndpointId::CONTROL, &[(EP2, 1)]);
    c.bench_function("send_single_with_credit_return", |b| {
        b.iter(|| {
            let packet = HtcPacket::new(EP2, payload.clone());
            transport.send_pkt(black_box(packet)).ok();
            transport.rx_completion_handler(refill.clone(), PipeId(0));
        });
    });
}

fn bench_bundled_send(c: &mut Criterion) {
    let transport = loopback_transport(BusType::Usb, Some(8));
    let payload = Bytes::from(vec![0xC3u8; 64]);
    let refill = credit_report_frame(EndpointId::CONTROL, &[(EP2, 8)]);
    c.bench_function("send_bundle_of_8_with_credit_return", |b| {
        b.iter(|| {
            let batch: PacketQueue = (0..8)
                .map(|_| HtcPacket::new(EP2, payload.clone()))
                .collect();
            transport.send_pkts_multiple(black_box(batch)).ok();
            transport.rx_completion_handler(refill.clone(), PipeId(0));
        });
    });
}

/// 完成就绪握手并把数据服务连接到 EP2 的传输实例。
fn loopback_transport(bus_type: BusType, max_bundle: Option<u8>) -> Arc<HtcTransport> {
    let bus = Arc::new(LoopbackBus {
        bus_type,
        transport: Mutex::new(Weak::new()),
    });
    let config = HtcConfig {
        credit_allocation: vec![CreditAllocation {
            service_id: ServiceId::WMI_DATA_BE.0,
            credits: 64,
        }],
        ..HtcConfig::default()
    };
    let transport = match HtcTransport::new(config, bus.clone()) {
        Ok(transport) => Arc::new(transport),
        Err(error) => panic!("benchmark transport setup failed: {error}"),
    };
    *bus.transport.lock() = Arc::downgrade(&transport);

    transport.rx_completion_handler(ready_frame(64, 512, 8, max_bundle), PipeId(0));
    let setup = transport.wait_target().and_then(|_| {
        transport.connect_service(ConnectRequest::new(
            ServiceId::WMI_DATA_BE,
            Arc::new(DiscardSink),
        ))
    });
    if let Err(error) = setup {
        panic!("benchmark handshake failed: {error}");
    }
    transport
}

struct LoopbackBus {
    bus_type: BusType,
    transport: Mutex<Weak<HtcTransport>>,
}

impl HifBus for LoopbackBus {
    fn send(&self, transfer: BusTransfer) -> Result<(), BusError> {
        let Some(transport) = self.transport.lock().upgrade() else {
            return Ok(());
        };
        if transfer.endpoint == EndpointId::CONTROL
            && let Frame::Single { payload, .. } = &transfer.frame
            && let Ok(ControlMessage::ConnectService(request)) = ControlMessage::decode(payload)
        {
            let response = accept(&request, EP2, 1024);
            transport.rx_completion_handler(connect_response_frame(&response), transfer.pipe);
        }
        transport.tx_completion_handler(transfer.endpoint, transfer.token);
        Ok(())
    }

    fn free_transfer_slots(&self, _pipe: PipeId) -> usize {
        usize::MAX
    }

    fn map_service_to_pipe(&self, _service: ServiceId) -> Result<PipeMapping, BusError> {
        Ok(PipeMapping::default())
    }

    fn bus_type(&self) -> BusType {
        self.bus_type
    }
}

struct DiscardSink;

impl EndpointSink for DiscardSink {
    fn on_receive(&self, packet: HtcPacket) {
        black_box(packet);
    }

    fn on_send_complete(&self, packet: HtcPacket) {
        black_box(packet);
    }
}
