//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use crate::process::{hart, pop_off, push_off};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的CPU将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的CPU ID，用于调试和死锁检测，并统计获取次数与自旋次数。
///
/// 持有自旋锁期间不得休眠：睡眠锁在获取时会检查这一点。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和统计；
/// - `cpuid`: 当前持有锁的CPU ID（-1表示无CPU持有）；
/// - `nacquire`/`nspin`: 获取次数与获取时失败的测试并设置次数；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    nacquire: AtomicUsize,
    nspin: AtomicUsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试与统计。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            nacquire: AtomicUsize::new(0),
            nspin: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断（防止死锁）；
    /// 2. 检查是否已持有锁（防止重入）；
    /// 3. 通过原子操作忙等待直到获取锁，期间累计自旋次数；
    /// 4. 设置内存屏障确保操作顺序；
    /// 5. 记录当前CPU ID；
    /// 6. 返回守卫对象。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 检查当前CPU是否持有此锁。
    ///
    /// 只有在中断关闭的上下文中结果才可靠，否则当前进程可能随时被迁移到别的CPU。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == hart().cpu_id() as isize
    }

    /// 锁的名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 读取该锁迄今为止的统计信息
    pub fn stat(&self) -> LockStat {
        LockStat {
            name: self.name,
            nacquire: self.nacquire.load(Ordering::Relaxed),
            nspin: self.nspin.load(Ordering::Relaxed),
        }
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 注意
    /// 在同一CPU上重复获取同一把锁必然死锁，因此直接 panic。
    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        self.nacquire.fetch_add(1, Ordering::Relaxed);
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.nspin.fetch_add(1, Ordering::Relaxed);
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(hart().cpu_id() as isize, Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 验证当前CPU确实持有锁；
    /// 2. 清除CPU ID记录；
    /// 3. 设置内存屏障确保操作顺序；
    /// 4. 原子存储`false`释放锁；
    /// 5. 调用`pop_off()`恢复中断状态。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有，并且当前CPU的中断处于关闭状态。
/// 守卫绑定在获取它的CPU上，不能被发送到其他线程（`!Send`）。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁，并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 检查当前CPU是否持有此锁，用于调试验证。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

/// 一把或一组自旋锁的竞争统计。
///
/// `nspin` 是获取锁时失败的测试并设置（test-and-set）次数，
/// 与 `nacquire` 的比值反映了锁的竞争程度。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStat {
    pub name: &'static str,
    pub nacquire: usize,
    pub nspin: usize,
}

impl LockStat {
    /// 合并同类锁的统计，名称取 `self` 的
    pub fn merge(self, other: LockStat) -> LockStat {
        LockStat {
            name: self.name,
            nacquire: self.nacquire + other.nacquire,
            nspin: self.nspin + other.nspin,
        }
    }
}

impl fmt::Display for LockStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock: {}: #test-and-set {} #acquire() {}",
            self.name, self.nspin, self.nacquire
        )
    }
}
