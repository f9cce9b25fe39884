#![deny(unsafe_code)]

//! `htc-buffer` 为 HTC 传输层提供“预分配 + 分代句柄”的容器池。
//!
//! # 模块定位（Why）
//! - 发送路径在热循环中需要反复取用聚合（bundle）缓冲与控制消息缓冲，
//!   频繁走堆分配会放大尾延迟，因此在初始化阶段预先分配固定数量的容器；
//! - 容器在多个队列之间流转，传统裸指针链表难以在 Rust 中表达，
//!   这里改用 `Arena + Handle` 表示所有权转移，并以代数（generation）捕获重复释放与悬垂句柄。
//!
//! # 设计概要（How）
//! - [`Arena`] 是单线程的槽位数组，负责句柄分配、代数校验与槽位复用；
//! - [`ContainerPool`] 在 `Arena` 外包一层 `spin::Mutex` 自由链表，并以原子计数维护统计；
//! - [`Recycle`] 约定容器归还时的清理动作，`BytesMut`/`Vec<T>` 已内置实现。
//!
//! # 命名约定（Consistency）
//! - `acquire`/`release` 与传输层术语保持一致，统计结构统一命名为 [`PoolStats`]。

mod arena;
mod pool;

pub use arena::{Arena, ArenaError, Handle};
pub use pool::{ContainerPool, PoolStats, Recycle};
