//! 传输实例级诊断：信用历史、路径计数与聚合分布。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use spin::Mutex;

use crate::config::HTC_MAX_MSG_PER_BUNDLE_TX;
use crate::credit_history::{CreditEvent, CreditHistory, CreditRecord};
use crate::ids::EndpointId;

/// 诊断计数快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub bus_sends: u64,
    pub bus_send_failures: u64,
    pub tx_completions: u64,
    /// 完成回调找不到对应在途条目的次数。
    pub unmatched_completions: u64,
    /// 完成匹配退化为线性扫描的次数。
    pub lookup_scans: u64,
    pub rx_frames: u64,
    pub rx_dropped: u64,
    pub rx_empty: u64,
    pub rx_reassembled: u64,
    pub lookaheads: u64,
    pub unknown_records: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) bus_sends: AtomicU64,
    pub(crate) bus_send_failures: AtomicU64,
    pub(crate) tx_completions: AtomicU64,
    pub(crate) unmatched_completions: AtomicU64,
    pub(crate) lookup_scans: AtomicU64,
    pub(crate) rx_frames: AtomicU64,
    pub(crate) rx_dropped: AtomicU64,
    pub(crate) rx_empty: AtomicU64,
    pub(crate) rx_reassembled: AtomicU64,
    pub(crate) lookaheads: AtomicU64,
    pub(crate) unknown_records: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// 由传输实例独占持有的诊断对象。
///
/// # 契约说明（What）
/// - 信用历史的追加与导出共用一把锁，导出结果按时间从旧到新，且恰好包含最近 `capacity` 条；
/// - 计数器只做单调累加，读取时不保证多个字段之间的瞬时一致。
pub struct TransportDiagnostics {
    epoch: Instant,
    history: Mutex<CreditHistory>,
    pub(crate) counters: Counters,
    bundle_sizes: Mutex<[u64; HTC_MAX_MSG_PER_BUNDLE_TX + 1]>,
}

impl TransportDiagnostics {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            epoch: Instant::now(),
            history: Mutex::new(CreditHistory::with_capacity(history_capacity)),
            counters: Counters::default(),
            bundle_sizes: Mutex::new([0; HTC_MAX_MSG_PER_BUNDLE_TX + 1]),
        }
    }

    pub fn record(&self, event: CreditEvent, endpoint: EndpointId, balance: u32, depth: usize) {
        let record = CreditRecord {
            event,
            endpoint,
            timestamp: self.epoch.elapsed(),
            balance,
            queue_depth: depth,
        };
        self.history.lock().push(record);
    }

    pub fn credit_history(&self) -> Vec<CreditRecord> {
        self.history.lock().snapshot()
    }

    /// 每条信用事件一行文本。
    pub fn dump(&self) -> Vec<String> {
        self.credit_history()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CounterSnapshot {
            bus_sends: load(&c.bus_sends),
            bus_send_failures: load(&c.bus_send_failures),
            tx_completions: load(&c.tx_completions),
            unmatched_completions: load(&c.unmatched_completions),
            lookup_scans: load(&c.lookup_scans),
            rx_frames: load(&c.rx_frames),
            rx_dropped: load(&c.rx_dropped),
            rx_empty: load(&c.rx_empty),
            rx_reassembled: load(&c.rx_reassembled),
            lookaheads: load(&c.lookaheads),
            unknown_records: load(&c.unknown_records),
        }
    }

    pub(crate) fn record_bundle(&self, members: usize) {
        let mut sizes = self.bundle_sizes.lock();
        let slot = members.min(HTC_MAX_MSG_PER_BUNDLE_TX);
        sizes[slot] += 1;
    }

    /// 下标为聚合包成员数，值为出现次数。
    pub fn bundle_histogram(&self) -> Vec<u64> {
        self.bundle_sizes.lock().to_vec()
    }
}
