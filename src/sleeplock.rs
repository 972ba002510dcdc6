//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::process::hart;
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁，
/// 例如在持锁期间进行磁盘 I/O。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`pid`状态
/// - `locked`: 表示锁是否已被占用
/// - `pid`: 持有锁的进程号，0 表示无人持有
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: AtomicBool,
    pid: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: AtomicBool::new(false),
            pid: AtomicUsize::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 功能说明
    /// 尝试获取睡眠锁。如果锁已被占用，当前进程将进入休眠状态，
    /// 直到锁被释放后被唤醒。返回守卫对象提供对数据的访问。
    ///
    /// # 流程解释
    /// 1. 确认当前 CPU 没有持有任何自旋锁，持有自旋锁时休眠会使其他 CPU 永远自旋；
    /// 2. 获取内部自旋锁保护临界区
    /// 3. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前进程休眠
    ///   - 如果未锁定：设置`locked=true`，记录持有者并返回守卫
    /// 4. 释放内部自旋锁（因已设置locked状态）
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let hart = hart();
        if hart.noff() != 0 {
            panic!("sleeplock {} acquire while holding spinlock", self.name);
        }

        // 获取内部自旋锁（保护locked状态）
        let mut guard = self.lock.lock();

        // 当锁已被占用时循环等待
        while self.locked.load(Ordering::Relaxed) {
            // 让当前进程休眠，等待锁释放
            hart.sleep(self.channel(), guard);
            // 被唤醒后重新获取内部锁
            guard = self.lock.lock();
        }

        self.locked.store(true, Ordering::Relaxed);
        self.pid.store(hart.pid(), Ordering::Relaxed);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前进程是否持有该锁
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let held =
            self.locked.load(Ordering::Relaxed) && self.pid.load(Ordering::Relaxed) == hart().pid();
        drop(guard);
        held
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁
    /// 2. 设置`locked=false`表示锁已释放
    /// 3. 唤醒等待该锁的进程
    /// 4. 释放内部自旋锁
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.store(false, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        hart().wakeup(self.channel());
        drop(guard);
    }

    /// 休眠与唤醒所用的等待通道：`locked` 字段的地址
    fn channel(&self) -> usize {
        &self.locked as *const AtomicBool as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被某个进程持有。进程可能在持锁期间被调度到其他 CPU，
/// 因此守卫可以随进程在线程间移动；是否由当前进程持有可用 [`SleepLockGuard::holding`] 检查。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前进程是否是该锁的持有者
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁
    ///
    /// 通过调用关联睡眠锁的`unlock()`方法实现：
    /// 1. 标记锁为可用状态
    /// 2. 唤醒等待该锁的进程
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
