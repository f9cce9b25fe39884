//! `pool_contract` 集成测试：从外部 crate 视角验证 `ContainerPool` 的租借、归还与统计契约。
//!
//! # 测试目标（Why）
//! - 池耗尽时必须扩容而非阻塞，且未命中次数可观测；
//! - 过期句柄、重复归还必须被拒绝，不能让同一容器被两个队列同时持有；
//! - 任意租借/归还序列下统计字段保持守恒。

use std::sync::Arc;
use std::thread;

use bytes::BytesMut;
use htc_buffer::{ArenaError, ContainerPool};
use proptest::prelude::*;

/// 预分配耗尽后继续租借会扩容并记录未命中。
#[test]
fn exhaustion_grows_instead_of_blocking() {
    let pool = ContainerPool::with_capacity(2, || BytesMut::with_capacity(64));
    let handles: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
    let stats = pool.stats();
    assert_eq!(stats.capacity, 5);
    assert_eq!(stats.in_use, 5);
    assert_eq!(stats.misses, 3);
    for handle in handles {
        pool.release(handle).expect("归还合法句柄");
    }
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.free, 5);
    assert_eq!(stats.released, 5);
}

/// 归还后的句柄再次使用会得到 `StaleHandle` 或 `NotLeased`。
#[test]
fn stale_handle_is_rejected() {
    let pool = ContainerPool::with_capacity(1, Vec::<u8>::new);
    let handle = pool.acquire();
    pool.release(handle).expect("首次归还成功");
    assert!(matches!(
        pool.release(handle),
        Err(ArenaError::NotLeased { .. })
    ));
    let reused = pool.acquire();
    assert!(matches!(
        pool.with(handle, |buf| buf.push(1)),
        Err(ArenaError::StaleHandle { .. })
    ));
    pool.with(reused, |buf| buf.push(1)).expect("新句柄有效");
}

/// 多线程并发租借/归还后统计回到初始状态。
#[test]
fn concurrent_lease_cycles_balance_out() {
    let pool = Arc::new(ContainerPool::with_capacity(4, || BytesMut::with_capacity(32)));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..200 {
                    let handle = pool.acquire();
                    pool.with(handle, |buf| buf.extend_from_slice(&[0xAA; 8]))
                        .expect("租出期间句柄有效");
                    pool.release(handle).expect("归还成功");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.acquired, 800);
    assert_eq!(stats.released, 800);
    assert_eq!(stats.free, stats.capacity);
}

proptest! {
    /// 任意租借/归还交错下：`in_use` 等于未归还句柄数，`capacity = 预分配 + misses`。
    #[test]
    fn prop_stats_stay_consistent(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
        let pool = ContainerPool::with_capacity(3, Vec::<u32>::new);
        let mut live = Vec::new();
        for acquire in ops {
            if acquire || live.is_empty() {
                live.push(pool.acquire());
            } else if let Some(handle) = live.pop() {
                pool.release(handle).expect("归还合法句柄");
            }
            let stats = pool.stats();
            prop_assert_eq!(stats.in_use, live.len());
            prop_assert_eq!(stats.capacity, 3 + stats.misses);
            prop_assert_eq!(stats.free + stats.in_use, stats.capacity);
        }
    }
}
