//! 聚合发送的透明性、容量切分、总线差异与失败回滚测试。
//!
//! # 教案式说明
//! - **意图（Why）**：聚合只是传输优化，目标拆分后看到的成员序列必须与逐包发送完全一致；
//! - **逻辑（How）**：用 `split_bundle` 拆开总线上记录的聚合帧，逐一比对负载、标志与序号；
//! - **契约（What）**：成员按信用大小对齐；USB 不发送末尾填充；失败时成员连同信用回到队列头部。

mod common;

use common::{Harness, config_with_credits, packet};
use htc_transport::test_stubs::RecordingBus;
use htc_transport::wire::{FLAG_SEND_BUNDLE, HTC_HDR_LENGTH, split_bundle};
use htc_transport::{
    BusError, ConnectionFlags, EndpointId, PacketQueue, PacketStatus, PipeId, ServiceId,
    StatsAction,
};
use proptest::prelude::*;

const EP2: EndpointId = EndpointId(2);
const CREDIT_SIZE: u16 = 128;

fn bundling_harness(bus: RecordingBus, max_bundle: u8) -> Harness {
    let harness = Harness::new(bus, config_with_credits(&[(ServiceId::WMI_DATA_BE, 100)]));
    harness.ready(128, CREDIT_SIZE, Some(max_bundle));
    harness
}

fn batch(count: u64, len: usize) -> PacketQueue {
    (0..count).map(|context| packet(EP2, context, len)).collect()
}

#[test]
fn usb_bundle_is_transparent_and_trims_last_pad() {
    let harness = bundling_harness(RecordingBus::usb(), 4);
    let sink = harness.connect(ServiceId::WMI_DATA_BE, EP2);
    let sent = batch(4, 40);
    let payloads: Vec<_> = sent.iter().map(|p| p.payload().clone()).collect();
    harness.transport.send_pkts_multiple(sent).expect("端点已连接");

    let transfers = harness.bus.transfers_for(EP2);
    assert_eq!(transfers.len(), 1);
    assert!(transfers[0].transfer.frame.is_bundle());
    let bytes = transfers[0].bytes();
    assert_eq!(bytes.len(), 3 * CREDIT_SIZE as usize + HTC_HDR_LENGTH + 40);

    let members = split_bundle(&bytes).expect("聚合帧可拆分");
    assert_eq!(members.len(), 4);
    for (index, member) in members.iter().enumerate() {
        assert_eq!(member.payload, payloads[index]);
        assert_ne!(member.header.flags & FLAG_SEND_BUNDLE, 0);
        assert_eq!(member.header.seq(), index as u8);
        assert_eq!(member.header.endpoint, EP2);
    }
    assert_eq!(sink.completions().len(), 4);
    assert!(sink.completions().iter().all(|(_, status)| *status == PacketStatus::Success));
    assert_eq!(harness.transport.bundle_pool_stats().in_use, 0);
}

#[test]
fn sdio_bundle_keeps_full_padding() {
    let harness = bundling_harness(RecordingBus::sdio(), 4);
    harness.connect(ServiceId::WMI_DATA_BE, EP2);
    harness
        .transport
        .send_pkts_multiple(batch(4, 40))
        .expect("端点已连接");
    let transfers = harness.bus.transfers_for(EP2);
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].transfer.frame.len(), 4 * CREDIT_SIZE as usize);
}

#[test]
fn bundles_split_by_member_count_and_leftover_goes_single() {
    let harness = bundling_harness(RecordingBus::usb(), 4);
    harness.connect(ServiceId::WMI_DATA_BE, EP2);
    harness
        .transport
        .send_pkts_multiple(batch(5, 40))
        .expect("端点已连接");

    let kinds: Vec<bool> = harness
        .bus
        .transfers_for(EP2)
        .iter()
        .map(|record| record.transfer.frame.is_bundle())
        .collect();
    assert_eq!(kinds, vec![true, false]);
    assert_eq!(harness.wire_contexts(EP2), vec![0, 1, 2, 3, 4]);

    let histogram = harness.transport.diagnostics().bundle_histogram();
    assert_eq!(histogram[4], 1);
    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    assert_eq!(stats.tx_bundles, 1);
    assert_eq!(stats.tx_packets_bundled, 4);
    assert_eq!(stats.tx_issued, 5);
}

#[test]
fn member_that_overflows_capacity_closes_the_bundle() {
    let harness = bundling_harness(RecordingBus::usb(), 4);
    harness.connect(ServiceId::WMI_DATA_BE, EP2);
    // 每个成员占两个信用单元，容量 4 × 128 只放得下两个。
    harness
        .transport
        .send_pkts_multiple(batch(4, 200))
        .expect("端点已连接");
    let sizes: Vec<usize> = harness
        .bus
        .transfers_for(EP2)
        .iter()
        .map(|record| split_bundle(&record.bytes()).expect("可拆分").len())
        .collect();
    assert_eq!(sizes, vec![2, 2]);
    assert_eq!(harness.transport.diagnostics().bundle_histogram()[2], 2);
}

#[test]
fn too_few_members_fall_back_to_single_frames() {
    let harness = bundling_harness(RecordingBus::usb(), 2);
    harness.connect(ServiceId::WMI_DATA_BE, EP2);
    harness
        .transport
        .send_pkts_multiple(batch(3, 200))
        .expect("端点已连接");
    let transfers = harness.bus.transfers_for(EP2);
    assert_eq!(transfers.len(), 3);
    assert!(transfers.iter().all(|record| !record.transfer.frame.is_bundle()));
    assert_eq!(harness.wire_contexts(EP2), vec![0, 1, 2]);
    assert_eq!(harness.transport.bundle_pool_stats().in_use, 0);
}

#[test]
fn pcie_and_resource_flow_sdio_never_bundle() {
    let pcie = bundling_harness(RecordingBus::pcie(), 8);
    pcie.connect(ServiceId::WMI_DATA_BE, EP2);
    pcie.transport
        .send_pkts_multiple(batch(4, 40))
        .expect("端点已连接");
    assert_eq!(pcie.bus.transfers_for(EP2).len(), 4);

    let sdio = bundling_harness(RecordingBus::sdio(), 8);
    sdio.connect_with(
        ServiceId::WMI_DATA_BE,
        EP2,
        1024,
        ConnectionFlags(ConnectionFlags::DISABLE_CREDIT_FLOW_CTRL),
        None,
    );
    sdio.transport
        .send_pkts_multiple(batch(4, 40))
        .expect("端点已连接");
    assert!(
        sdio.bus
            .transfers_for(EP2)
            .iter()
            .all(|record| !record.transfer.frame.is_bundle())
    );
}

#[test]
fn target_without_bundle_support_gets_single_frames() {
    let harness = Harness::new(
        RecordingBus::usb(),
        config_with_credits(&[(ServiceId::WMI_DATA_BE, 100)]),
    );
    harness.ready(128, CREDIT_SIZE, None);
    harness.connect(ServiceId::WMI_DATA_BE, EP2);
    harness
        .transport
        .send_pkts_multiple(batch(4, 40))
        .expect("端点已连接");
    assert_eq!(harness.bus.transfers_for(EP2).len(), 4);
}

#[test]
fn failed_bundle_restores_every_member() {
    let harness = bundling_harness(RecordingBus::usb(), 4);
    let sink = harness.connect(ServiceId::WMI_DATA_BE, EP2);
    harness.bus.fail_next_sends([BusError::NoResource]);
    harness
        .transport
        .send_pkts_multiple(batch(6, 40))
        .expect("端点已连接");

    assert!(harness.bus.transfers_for(EP2).is_empty());
    assert_eq!(harness.transport.tx_queue_depth(EP2).expect("已连接"), 6);
    assert_eq!(harness.transport.tx_credits(EP2).expect("已连接"), 100);
    assert_eq!(harness.transport.bundle_pool_stats().in_use, 0);
    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    assert_eq!(stats.tx_bundles, 0);
    assert!(sink.completions().is_empty());

    harness.transport.tx_resource_available(PipeId(0));
    assert_eq!(harness.wire_contexts(EP2), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(harness.transport.tx_credits(EP2).expect("已连接"), 94);
}

#[test]
fn more_data_defers_drain_until_final_packet() {
    let harness = bundling_harness(RecordingBus::usb(), 8);
    harness.connect(ServiceId::WMI_DATA_BE, EP2);
    harness
        .transport
        .send_data(packet(EP2, 0, 40), true)
        .expect("入队");
    harness
        .transport
        .send_data(packet(EP2, 1, 40), true)
        .expect("入队");
    assert!(harness.bus.transfers_for(EP2).is_empty());

    harness
        .transport
        .send_data(packet(EP2, 2, 40), false)
        .expect("入队");
    let transfers = harness.bus.transfers_for(EP2);
    assert_eq!(transfers.len(), 1);
    assert_eq!(
        split_bundle(&transfers[0].bytes()).expect("可拆分").len(),
        3
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn bundled_stream_equals_submitted_stream(
        lens in prop::collection::vec(8usize..300, 1..24),
        max_bundle in 2u8..8,
    ) {
        let harness = bundling_harness(RecordingBus::usb(), max_bundle);
        harness.connect(ServiceId::WMI_DATA_BE, EP2);
        harness
            .transport
            .rx_completion_handler(
                htc_transport::test_stubs::credit_report_frame(EndpointId::CONTROL, &[(EP2, 200)]),
                PipeId(0),
            );
        let queue: PacketQueue = lens
            .iter()
            .enumerate()
            .map(|(context, len)| packet(EP2, context as u64, *len))
            .collect();
        let expected: Vec<_> = queue.iter().map(|p| p.payload().clone()).collect();
        harness.transport.send_pkts_multiple(queue).expect("端点已连接");

        let mut on_wire = Vec::new();
        for record in harness.bus.transfers_for(EP2) {
            let bytes = record.bytes();
            if record.transfer.frame.is_bundle() {
                let members = split_bundle(&bytes).expect("可拆分");
                prop_assert!(members.len() <= usize::from(max_bundle));
                prop_assert!(bytes.len() <= usize::from(max_bundle) * usize::from(CREDIT_SIZE));
                on_wire.extend(members.into_iter().map(|member| member.payload));
            } else {
                on_wire.push(bytes.slice(HTC_HDR_LENGTH..));
            }
        }
        prop_assert_eq!(on_wire, expected);
    }
}
