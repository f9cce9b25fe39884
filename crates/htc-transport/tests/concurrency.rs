//! 多线程发送：单排空者、FIFO 与信用守恒在真实线程交错下成立。
//!
//! # 教案式说明
//! - **意图（Why）**：排空循环在持锁准入后放锁调用总线，这段窗口内其他线程可能同时入队；
//!   若两个线程都进入排空，同一端点的包就可能在总线上交错乱序；
//! - **逻辑（How）**：用 `block_next_send` 把第一个排空线程卡在总线内部，其余线程此时提交的包只能入队；
//!   放行后检查所有传输都由第一个线程发出；
//! - **契约（What）**：同一端点任意时刻至多一个排空者；每个线程提交的包按其提交顺序上线。

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{Harness, config_with_credits, context_of, packet};
use htc_transport::test_stubs::{RecordingBus, credit_report_frame};
use htc_transport::wire::HTC_HDR_LENGTH;
use htc_transport::{
    BusError, EndpointId, PacketQueue, PacketStatus, PipeId, ServiceId, StatsAction,
};

const EP2: EndpointId = EndpointId(2);

#[test]
fn second_sender_only_enqueues_while_a_drain_is_running() {
    let harness = Harness::new(
        RecordingBus::sdio(),
        config_with_credits(&[(ServiceId::WMI_DATA_BE, 100)]),
    );
    harness.ready(128, 256, None);
    let sink = harness.connect(ServiceId::WMI_DATA_BE, EP2);

    let gate = harness.bus.block_next_send();
    let transport = Arc::clone(&harness.transport);
    let drainer = thread::spawn(move || {
        transport.send_pkt(packet(EP2, 0, 32)).expect("端点已连接");
        thread::current().id()
    });

    gate.wait_entered();
    for context in 1..4 {
        harness
            .transport
            .send_pkt(packet(EP2, context, 32))
            .expect("端点已连接");
    }
    assert!(harness.bus.transfers_for(EP2).is_empty());
    assert_eq!(harness.transport.tx_queue_depth(EP2).expect("已连接"), 3);

    gate.release();
    let drainer_id = drainer.join().expect("排空线程不应 panic");

    let transfers = harness.bus.transfers_for(EP2);
    assert_eq!(transfers.len(), 4);
    assert!(transfers.iter().all(|record| record.thread == drainer_id));
    assert_eq!(harness.wire_contexts(EP2), vec![0, 1, 2, 3]);
    assert_eq!(sink.completions().len(), 4);
}

#[test]
fn concurrent_senders_and_credit_reports_keep_per_thread_order() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 64;
    const INITIAL: u32 = 6;

    let harness = Harness::new(
        RecordingBus::sdio(),
        config_with_credits(&[(ServiceId::WMI_DATA_BE, INITIAL)]),
    );
    harness.ready(128, 256, None);
    let sink = harness.connect_with(
        ServiceId::WMI_DATA_BE,
        EP2,
        256,
        htc_transport::ConnectionFlags::default(),
        Some(usize::MAX),
    );

    let senders: Vec<_> = (0..THREADS)
        .map(|thread_index| {
            let transport = Arc::clone(&harness.transport);
            thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    let context = (thread_index << 32) | seq;
                    transport
                        .send_pkt(packet(EP2, context, 24 + (seq as usize % 200)))
                        .expect("端点已连接");
                }
            })
        })
        .collect();

    let total = (THREADS * PER_THREAD) as usize;
    let deadline = Instant::now() + Duration::from_secs(20);
    while sink.completions().len() < total {
        assert!(Instant::now() < deadline, "信用回报后所有包都应完成");
        harness.transport.rx_completion_handler(
            credit_report_frame(EndpointId::CONTROL, &[(EP2, 3)]),
            PipeId(0),
        );
        thread::yield_now();
    }
    for sender in senders {
        sender.join().expect("发送线程不应 panic");
    }

    let mut last_seen: HashMap<u64, u64> = HashMap::new();
    for record in harness.bus.transfers_for(EP2) {
        let context = context_of(&record.bytes().slice(HTC_HDR_LENGTH..));
        let (thread_index, seq) = (context >> 32, context & 0xFFFF_FFFF);
        if let Some(previous) = last_seen.insert(thread_index, seq) {
            assert!(previous < seq, "线程 {thread_index} 的包乱序：{previous} 之后出现 {seq}");
        }
    }
    assert_eq!(last_seen.len(), THREADS as usize);

    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    let balance = u64::from(harness.transport.tx_credits(EP2).expect("已连接"));
    assert_eq!(
        balance + stats.tx_credits_consumed,
        u64::from(INITIAL) + stats.tx_credits_returned
    );
    assert_eq!(stats.tx_completed, total as u64);
    assert_eq!(harness.transport.tx_queue_depth(EP2).expect("已连接"), 0);
}

/// 在总线调用期间执行 `work`，随后放行并让这次发送被总线拒绝。
fn refuse_send_after<F>(harness: &Harness, packets: PacketQueue, work: F)
where
    F: FnOnce(&Harness),
{
    harness.bus.fail_next_sends([BusError::NoResource]);
    let gate = harness.bus.block_next_send();
    let transport = Arc::clone(&harness.transport);
    let sender = thread::spawn(move || transport.send_pkts_multiple(packets));

    gate.wait_entered();
    work(harness);
    gate.release();
    sender
        .join()
        .expect("发送线程不应 panic")
        .expect("端点已连接");
}

#[test]
fn stats_cleared_during_a_refused_send_stay_consistent() {
    let harness = Harness::new(
        RecordingBus::sdio(),
        config_with_credits(&[(ServiceId::WMI_DATA_BE, 4)]),
    );
    harness.ready(64, 256, None);
    let sink = harness.connect(ServiceId::WMI_DATA_BE, EP2);

    refuse_send_after(&harness, PacketQueue::from([packet(EP2, 0, 40)]), |harness| {
        harness
            .transport
            .endpoint_stats(EP2, StatsAction::Clear)
            .expect("端点存在");
    });

    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    assert_eq!(stats.tx_issued, 0);
    assert_eq!(harness.transport.tx_queue_depth(EP2).expect("已连接"), 1);
    assert_eq!(harness.transport.in_flight(EP2).expect("已连接"), 0);

    harness.transport.tx_resource_available(PipeId(0));
    assert_eq!(harness.wire_contexts(EP2), vec![0]);
    assert_eq!(sink.completions(), vec![(0, PacketStatus::Success)]);
    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    assert_eq!(stats.tx_issued, 1);
}

#[test]
fn bundle_stats_cleared_during_a_refused_send_stay_consistent() {
    let harness = Harness::new(
        RecordingBus::usb(),
        config_with_credits(&[(ServiceId::WMI_DATA_BE, 100)]),
    );
    harness.ready(128, 128, Some(8));
    let sink = harness.connect(ServiceId::WMI_DATA_BE, EP2);

    let packets: PacketQueue = (0..4).map(|context| packet(EP2, context, 40)).collect();
    refuse_send_after(&harness, packets, |harness| {
        harness
            .transport
            .endpoint_stats(EP2, StatsAction::SampleAndClear)
            .expect("端点存在");
    });

    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    assert_eq!(stats.tx_bundles, 0);
    assert_eq!(stats.tx_packets_bundled, 0);
    assert_eq!(stats.tx_issued, 0);
    assert_eq!(harness.transport.tx_queue_depth(EP2).expect("已连接"), 4);

    harness.transport.tx_resource_available(PipeId(0));
    assert_eq!(harness.wire_contexts(EP2), vec![0, 1, 2, 3]);
    assert_eq!(sink.completions().len(), 4);
    let stats = harness
        .transport
        .endpoint_stats(EP2, StatsAction::Sample)
        .expect("端点存在");
    assert_eq!(stats.tx_bundles, 1);
    assert_eq!(stats.tx_issued, 4);
}

#[test]
fn stop_during_a_refused_send_cancels_the_returned_packet() {
    let harness = Harness::new(
        RecordingBus::sdio(),
        config_with_credits(&[(ServiceId::WMI_DATA_BE, 4)]),
    );
    harness.ready(64, 256, None);
    let sink = harness.connect(ServiceId::WMI_DATA_BE, EP2);

    refuse_send_after(&harness, PacketQueue::from([packet(EP2, 7, 40)]), |harness| {
        harness.transport.stop();
    });

    assert_eq!(sink.completions(), vec![(7, PacketStatus::Canceled)]);
    assert_eq!(harness.transport.tx_queue_depth(EP2).expect("已连接"), 0);

    harness.transport.tx_resource_available(PipeId(0));
    harness.transport.kick_queues();
    assert_eq!(sink.completions().len(), 1);
    assert!(harness.wire_contexts(EP2).is_empty());
}
