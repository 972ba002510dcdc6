//! xv6 缓冲区缓存
//!
//! 内核文件系统与块设备驱动之间的块缓存层：固定数量的缓冲块按 `(dev, blockno)`
//! 散列到多个哈希桶，每个桶一把自旋锁；未命中时按最近一次释放的时钟滴答回收最久未使用的缓冲块。
//!
//! 锁原语与调度器通过 [`process::Hart`] 解耦，内核注册自己的实现；
//! 启用 `std` 特性时以宿主线程模拟硬件线程，便于在宿主机上测试。

#![no_std]
#![warn(rust_2018_idioms)]

#[cfg(any(feature = "std", test))]
extern crate std;

extern crate alloc;

#[macro_use]
pub mod printf;

pub mod clock;
pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{BlockDevice, RamDisk, DISK};
pub use fs::{BlockId, Bcache, BcacheStats, Buf, BufData, BCACHE};
