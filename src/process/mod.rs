//! 处理器与进程的执行环境
//!
//! 自旋锁需要关闭中断并记录持有锁的 CPU，睡眠锁需要让当前进程休眠、在释放时唤醒等待者，
//! 并记录持有锁的进程。这些能力都来自调度器，这里用 [`Hart`] 抽象出来：
//! 内核在启动早期通过 [`install`] 注册自己的实现；启用 `std` 特性时，
//! 若未注册则退回到以宿主线程模拟的 [`host::HostHart`]。

use spin::Once;

use crate::spinlock::SpinLockGuard;

#[cfg(feature = "std")]
pub mod host;

/// 一个硬件线程（hart）及其上正在运行的进程所提供的调度能力。
pub trait Hart: Sync {
    /// 当前 CPU 的编号。
    ///
    /// 必须在中断关闭（`push_off`）期间调用，
    /// 以防止与进程被迁移到另一个 CPU 时出现竞争条件。
    fn cpu_id(&self) -> usize;

    /// 当前进程的进程号，0 保留表示“没有进程”。
    fn pid(&self) -> usize;

    /// 关闭当前 CPU 的中断，并记录关闭的嵌套次数。
    fn push_off(&self);

    /// 撤销一次 `push_off`，嵌套次数归零时恢复原来的中断状态。
    ///
    /// 与 `push_off` 次数不匹配时 panic。
    fn pop_off(&self);

    /// 当前 CPU 上 `push_off` 的嵌套次数，亦即当前持有的自旋锁数量。
    fn noff(&self) -> usize;

    /// 原子地释放 `guard` 并让当前进程在 `channel` 上休眠，直到有人调用 `wakeup(channel)`。
    ///
    /// 返回时不会重新获取传入的锁。允许虚假唤醒，调用者需在循环中重新检查等待条件。
    fn sleep(&self, channel: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在 `channel` 上休眠的进程。调用时不得持有任何进程的锁。
    fn wakeup(&self, channel: usize);
}

static HART: Once<&'static dyn Hart> = Once::new();

/// 注册内核的调度器实现。只有第一次调用生效，应在任何锁被使用之前完成。
pub fn install(hart: &'static dyn Hart) {
    HART.call_once(|| hart);
}

/// 返回当前生效的 [`Hart`] 实现。
pub fn hart() -> &'static dyn Hart {
    match HART.get() {
        Some(hart) => *hart,
        None => fallback(),
    }
}

#[cfg(feature = "std")]
fn fallback() -> &'static dyn Hart {
    &host::HOST_HART
}

#[cfg(not(feature = "std"))]
fn fallback() -> &'static dyn Hart {
    panic!("hart: no scheduler installed")
}

/// 见 [`Hart::push_off`]
#[inline]
pub fn push_off() {
    hart().push_off();
}

/// 见 [`Hart::pop_off`]
#[inline]
pub fn pop_off() {
    hart().pop_off();
}
