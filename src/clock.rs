//! 时钟滴答计数
//!
//! 时钟中断处理程序每次到来时把全局计数加一。缓冲区缓存用它给空闲缓冲块打上
//! 最近使用时间戳，因此只要求单调，不要求与真实时间对应。

use core::num::Wrapping;

use crate::spinlock::SpinLock;

/// 单调递增的逻辑时钟
pub trait Clock: Sync {
    /// 读取当前滴答数
    fn ticks(&self) -> usize;
}

/// 由时钟中断推进的滴答计数器（自旋锁保护）
pub struct Ticks(SpinLock<Wrapping<usize>>);

impl Ticks {
    pub const fn new() -> Self {
        Self(SpinLock::new(Wrapping(0), "time"))
    }

    /// 处理一次时钟中断：计数加一
    pub fn clock_intr(&self) {
        let mut guard = self.0.lock();
        *guard += Wrapping(1);
        drop(guard);
    }

    /// 读取当前时钟计数值
    pub fn read(&self) -> usize {
        self.0.lock().0
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for Ticks {
    fn ticks(&self) -> usize {
        self.read()
    }
}

/// 全局时钟计数器
pub static TICKS: Ticks = Ticks::new();

/// 时钟中断入口，由陷阱处理程序在每次定时器中断时调用
pub fn clock_intr() {
    TICKS.clock_intr();
}

/// 系统启动以来的时钟周期数
pub fn clock_read() -> usize {
    TICKS.read()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance() {
        let ticks = Ticks::new();
        assert_eq!(ticks.ticks(), 0);
        ticks.clock_intr();
        ticks.clock_intr();
        assert_eq!(ticks.read(), 2);
    }

    #[test]
    fn global_clock_is_monotonic() {
        let before = clock_read();
        clock_intr();
        assert!(clock_read() > before);
    }
}
