//! 设备驱动模块：块设备接口与内存盘

use core::sync::atomic::AtomicBool;

use spin::Once;

use crate::fs::Buf;

pub mod ramdisk;

pub use ramdisk::RamDisk;

/// 用于表示是否有任何硬件线程触发了 panic。
pub(crate) static PANICKED: AtomicBool = AtomicBool::new(false);

/// 当前执行流是否正处于 panic 过程中（宿主环境下为当前线程是否正在展开）
pub(crate) fn panicking() -> bool {
    #[cfg(feature = "std")]
    {
        std::thread::panicking()
    }
    #[cfg(not(feature = "std"))]
    {
        PANICKED.load(core::sync::atomic::Ordering::Relaxed)
    }
}

/// 块设备驱动的读写接口。
pub trait BlockDevice: Sync {
    /// 同步地在 `buf` 与磁盘块 `(buf.dev(), buf.blockno())` 之间传输一个块。
    ///
    /// `writing` 为 `false` 时把磁盘内容读入 `buf`，为 `true` 时把 `buf` 写回磁盘。
    /// 调用者持有 `buf` 的睡眠锁；函数返回时传输已经完成，期间调用进程可以休眠。
    /// 设备故障由驱动自行处理（通常直接 panic）。
    fn rw(&self, buf: &mut Buf<'_>, writing: bool);
}

/// 内核的磁盘：转发到启动时注册的块设备驱动。
///
/// 缓冲区缓存是常量初始化的全局变量，而磁盘驱动要到启动后才就绪，
/// 因此全局缓存引用的是这个转发器。
pub struct Disk {
    driver: Once<&'static dyn BlockDevice>,
}

pub static DISK: Disk = Disk::new();

impl Disk {
    const fn new() -> Self {
        Self { driver: Once::new() }
    }

    /// 注册磁盘驱动，只有第一次调用生效
    pub fn init(&self, driver: &'static dyn BlockDevice) {
        self.driver.call_once(|| driver);
    }
}

impl BlockDevice for Disk {
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        match self.driver.get() {
            Some(driver) => driver.rw(buf, writing),
            None => panic!("disk: no block device installed"),
        }
    }
}
