//! 以宿主操作系统线程模拟 hart 与进程
//!
//! 每个线程既是一个 hart 也是一个进程，`cpu_id` 与 `pid` 都取线程第一次使用时分配的序号（从 1 开始）。
//! 没有真正的中断可关，`push_off`/`pop_off` 只维护嵌套计数。
//!
//! 休眠与唤醒用一把全局互斥锁和条件变量实现：休眠者先拿到互斥锁再释放传入的自旋锁，
//! 唤醒者总是在持有同一把自旋锁时调用 `wakeup`，因而必须等休眠者进入等待后才能通知，唤醒不会丢失。

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use std::sync::{Condvar, Mutex, PoisonError};

use super::Hart;
use crate::spinlock::SpinLockGuard;

/// 启用 `std` 特性且内核未注册调度器时使用的实现。
pub static HOST_HART: HostHart = HostHart::new();

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    static NOFF: Cell<usize> = const { Cell::new(0) };
}

pub struct HostHart {
    waiting: Mutex<()>,
    wake: Condvar,
}

impl HostHart {
    const fn new() -> Self {
        Self {
            waiting: Mutex::new(()),
            wake: Condvar::new(),
        }
    }
}

impl Hart for HostHart {
    fn cpu_id(&self) -> usize {
        ID.with(|id| *id)
    }

    fn pid(&self) -> usize {
        ID.with(|id| *id)
    }

    fn push_off(&self) {
        NOFF.with(|noff| noff.set(noff.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|noff| match noff.get().checked_sub(1) {
            Some(n) => noff.set(n),
            None => panic!("pop_off(): count not match"),
        });
    }

    fn noff(&self) -> usize {
        NOFF.with(|noff| noff.get())
    }

    fn sleep(&self, _channel: usize, guard: SpinLockGuard<'_, ()>) {
        let waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        drop(self.wake.wait(waiting).unwrap_or_else(PoisonError::into_inner));
    }

    fn wakeup(&self, _channel: usize) {
        let _waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }
}
