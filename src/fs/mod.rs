//! 文件系统模块：缓冲区缓存

mod bio;
mod bucket;

pub use bio::{Bcache, BcacheStats, Buf, BufData};
pub use bucket::BlockId;

use crate::clock::TICKS;
use crate::driver::{BlockDevice, DISK};

/// 内核全局的缓冲区缓存，读写 [`DISK`]，按 [`TICKS`] 计时
pub static BCACHE: Bcache<'static> = Bcache::new(&DISK, &TICKS);

/// 注册磁盘驱动并初始化全局缓冲区缓存
///
/// # 安全性
/// 必须在系统启动时调用一次，且早于任何 `BCACHE.bread`
pub fn binit(driver: &'static dyn BlockDevice) {
    DISK.init(driver);
    BCACHE.binit();
}
