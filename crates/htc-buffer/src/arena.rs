use thiserror::Error;

/// 指向 [`Arena`] 槽位的分代句柄。
///
/// # 契约说明（What）
/// - `index` 定位槽位，`generation` 记录该槽位被分配时的代数；
/// - 槽位释放后代数自增，旧句柄因代数不匹配而失效，从而捕获重复释放与释放后使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// 槽位下标，仅用于日志与诊断。
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// 句柄校验失败的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("handle index {index} is out of range")]
    OutOfRange { index: u32 },
    #[error("stale handle: slot {index} expected generation {expected}, got {actual}")]
    StaleHandle {
        index: u32,
        expected: u32,
        actual: u32,
    },
    #[error("slot {index} is not leased")]
    NotLeased { index: u32 },
}

struct Slot<T> {
    generation: u32,
    leased: bool,
    value: T,
}

/// 以分代句柄寻址的槽位数组。
///
/// # 设计动机（Why）
/// - 容器需要在“空闲 → 发送队列 → 在途 → 空闲”之间流转，
///   以句柄代替引用可以让所有权转移在类型系统中保持简单，同时不引入 `unsafe`。
///
/// # 核心机制（How）
/// - `slots` 保存值本体与代数，`free` 为空闲槽位栈（后进先出，复用最近归还的缓存热块）；
/// - 空闲栈为空时调用方提供的工厂函数扩容，由上层统计未命中次数。
///
/// # 契约说明（What）
/// - **前置条件**：`release`/`get_mut` 只接受本 Arena 签发且尚未释放的句柄；
/// - **后置条件**：`release` 成功后该句柄永久失效，即使槽位被重新分配也不会通过校验。
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// 预先放入一个空闲值，不产生句柄。
    pub fn insert_free(&mut self, value: T) {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            leased: false,
            value,
        });
        self.free.push(index);
    }

    /// 从空闲栈取出一个槽位；返回 `None` 表示需要调用方扩容。
    pub fn try_lease(&mut self) -> Option<Handle> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.leased = true;
        Some(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// 追加一个新槽位并直接租出。
    pub fn lease_new(&mut self, value: T) -> Handle {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            leased: true,
            value,
        });
        Handle {
            index,
            generation: 0,
        }
    }

    /// 归还槽位，返回其中的值的可变引用以便调用方执行清理。
    pub fn release(&mut self, handle: Handle) -> Result<&mut T, ArenaError> {
        self.check(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.leased = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(&mut slot.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, ArenaError> {
        self.check(handle)?;
        Ok(&mut self.slots[handle.index as usize].value)
    }

    pub fn get(&self, handle: Handle) -> Result<&T, ArenaError> {
        self.check(handle)?;
        Ok(&self.slots[handle.index as usize].value)
    }

    /// 槽位总数（空闲 + 租出）。
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    fn check(&self, handle: Handle) -> Result<(), ArenaError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(ArenaError::OutOfRange {
                index: handle.index,
            })?;
        if slot.generation != handle.generation {
            return Err(ArenaError::StaleHandle {
                index: handle.index,
                expected: slot.generation,
                actual: handle.generation,
            });
        }
        if !slot.leased {
            return Err(ArenaError::NotLeased {
                index: handle.index,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_handle_is_rejected_after_reuse() {
        let mut arena = Arena::new();
        arena.insert_free(1u32);
        let first = arena.try_lease().expect("预填充槽位应可租出");
        arena.release(first).expect("首次释放必须成功");
        let second = arena.try_lease().expect("槽位应被复用");
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(matches!(
            arena.get_mut(first),
            Err(ArenaError::StaleHandle { .. })
        ));
        assert_eq!(*arena.get(second).expect("新句柄有效"), 1);
    }

    #[test]
    fn double_release_is_detected() {
        let mut arena = Arena::new();
        let handle = arena.lease_new(String::from("bundle"));
        arena.release(handle).expect("首次释放必须成功");
        assert!(arena.release(handle).is_err());
        assert_eq!(arena.free_len(), 1);
    }

    #[test]
    fn empty_arena_requires_growth() {
        let mut arena: Arena<u8> = Arena::new();
        assert!(arena.try_lease().is_none());
        let handle = arena.lease_new(7);
        assert_eq!(arena.capacity(), 1);
        assert_eq!(*arena.get(handle).expect("新增槽位有效"), 7);
    }
}
