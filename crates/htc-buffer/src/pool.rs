use core::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use spin::Mutex;

use crate::arena::{Arena, ArenaError, Handle};

/// 容器归还池时执行的清理动作。
///
/// 清理后容器应处于“可被任意调用方重新填充”的状态，但可以保留已分配容量。
pub trait Recycle {
    fn recycle(&mut self);
}

impl Recycle for BytesMut {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// `ContainerPool` 在 [`Arena`] 之上提供线程安全的容器租借与统计。
///
/// # 模块角色（Why）
/// - 为发送路径提供预分配的聚合缓冲与控制消息缓冲，避免热路径频繁触发堆分配；
/// - 池耗尽时不阻塞调用方，而是扩容并累计 `misses`，保证发送路径永不因池而停顿。
///
/// # 核心机制（How）
/// - 内部使用 `spin::Mutex<Arena<T>>` 作为自由链表，临界区只包含下标操作，持锁时间极短；
/// - `PoolMetrics` 通过原子计数跟踪 `acquired`/`released`/`misses`，`stats` 读取快照时无需持锁；
/// - 归还时调用 [`Recycle::recycle`] 清理内容但保留容量。
///
/// # 契约说明（What）
/// - **线程安全**：满足 `Send + Sync`，可被多个发送线程共享；
/// - **句柄校验**：`release`/`with` 对过期句柄返回 [`ArenaError`]，不会静默破坏自由链表；
/// - **后置条件**：`acquire` 总能返回句柄，`stats().in_use` 与未归还句柄数一致。
///
/// # 设计权衡（Trade-offs）
/// - 自由链表操作只有几条指令，选用 `spin::Mutex` 而非阻塞锁；
/// - 扩容后的槽位不会收缩，峰值内存在池生命周期内保持驻留。
pub struct ContainerPool<T> {
    arena: Mutex<Arena<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    metrics: PoolMetrics,
}

impl<T: Recycle> ContainerPool<T> {
    /// 预分配 `prealloc` 个容器的池。
    pub fn with_capacity<F>(prealloc: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut arena = Arena::new();
        for _ in 0..prealloc {
            arena.insert_free(factory());
        }
        Self {
            arena: Mutex::new(arena),
            factory: Box::new(factory),
            metrics: PoolMetrics::default(),
        }
    }

    /// 租借一个容器；自由链表为空时扩容并记一次未命中。
    pub fn acquire(&self) -> Handle {
        let mut arena = self.arena.lock();
        let handle = match arena.try_lease() {
            Some(handle) => handle,
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                let value = (self.factory)();
                arena.lease_new(value)
            }
        };
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        self.metrics.in_use.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// 归还容器并执行清理。
    pub fn release(&self, handle: Handle) -> Result<(), ArenaError> {
        let mut arena = self.arena.lock();
        let value = arena.release(handle)?;
        value.recycle();
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        self.metrics.in_use.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// 在持锁状态下访问容器内容。
    ///
    /// 闭包内不得回调本池，否则会自旋死锁。
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Result<R, ArenaError> {
        let mut arena = self.arena.lock();
        let value = arena.get_mut(handle)?;
        Ok(f(value))
    }

    pub fn stats(&self) -> PoolStats {
        let (capacity, free) = {
            let arena = self.arena.lock();
            (arena.capacity(), arena.free_len())
        };
        PoolStats {
            capacity,
            free,
            in_use: self.metrics.in_use.load(Ordering::Relaxed),
            acquired: self.metrics.acquired.load(Ordering::Relaxed),
            released: self.metrics.released.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
        }
    }
}

/// 池统计快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_use: usize,
    pub acquired: usize,
    pub released: usize,
    /// 自由链表为空导致扩容的次数。
    pub misses: usize,
}

#[derive(Default)]
struct PoolMetrics {
    in_use: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    misses: AtomicUsize,
}
