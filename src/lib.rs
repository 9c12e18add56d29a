#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod latch;
#[cfg(feature = "logging")]
pub mod logging;
mod pool;
mod spinlock;
mod store;
mod task;

pub use crate::error::SpawnError;
pub use crate::latch::Latch;
pub use crate::pool::{PoolBuilder, PoolStats, ThreadPool};
pub use crate::spinlock::{SpinLock, SpinLockGuard};
pub use crate::task::{Priority, TaskContext, TaskDesc, TaskId};
