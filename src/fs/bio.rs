//! 缓存层
//!
//! 缓冲区缓存保存磁盘块内容的内存副本，既减少了磁盘读取，
//! 也为被多个进程同时使用的磁盘块提供了同步点。
//!
//! 缓冲块按 `(dev, blockno)` 散列到 `NBUCKET` 个哈希桶，每个桶有自己的桶锁，
//! 不同块的查找不会串行在同一把全局锁上。
//!
//! 接口：
//! - 调用 `bread` 获取某个磁盘块的缓冲块；
//! - 修改数据后调用 `bwrite` 写回磁盘；
//! - 用完后调用 `brelse`，或直接让 `Buf` 离开作用域；
//! - `brelse` 之后不得再使用该缓冲块；
//! - 同一时刻只有一个进程能使用某个缓冲块，不要长时间持有。
//!
//! 锁的顺序：驱逐锁在前，桶锁在后，多个桶锁按下标升序获取；
//! 缓冲块的睡眠锁只在放开所有自旋锁之后获取。

use array_macro::array;

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arrayvec::ArrayVec;

use super::bucket::{BlockId, Bucket, Chain, Slot};
use crate::clock::Clock;
use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::{panicking, BlockDevice};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{LockStat, SpinLockGuard};

/// 缓冲区缓存（Buffer Cache），位于文件系统与块设备驱动之间。
///
/// `Bcache` 提供固定大小的缓冲块池：每个磁盘块至多有一个缓存副本；
/// 缓存未命中时，在全部桶中回收最久未使用（按释放时的时钟滴答计）的空闲缓冲块。
///
/// 内核使用常量初始化的全局实例 [`BCACHE`](super::BCACHE)，
/// 也可以针对任意块设备与时钟另行构造。构造后必须先调用一次 [`Bcache::binit`]。
pub struct Bcache<'a> {
    disk: &'a dyn BlockDevice,
    clock: &'a dyn Clock,

    /// 哈希桶，每个缓冲块任一时刻恰好属于其中一个
    buckets: [Bucket; NBUCKET],

    /// 缓冲块数组，下标即缓冲块的编号
    bufs: [BufInner; NBUF],

    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl<'a> Bcache<'a> {
    /// 构造一个空的缓冲区缓存。
    ///
    /// # 参数
    /// - `disk`: 缓存未命中与写回时使用的块设备；
    /// - `clock`: 为释放的缓冲块打时间戳的时钟。
    ///
    /// # 返回值
    /// 尚未初始化的 `Bcache`，全部缓冲块都不在任何桶中，使用前须调用 [`Bcache::binit`]。
    pub const fn new(disk: &'a dyn BlockDevice, clock: &'a dyn Clock) -> Self {
        Self {
            disk,
            clock,
            buckets: array![_ => Bucket::new(); NBUCKET],
            bufs: array![_ => BufInner::new(); NBUF],
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    /// 初始化缓冲区缓存。
    ///
    /// # 功能说明
    /// 把全部 `NBUF` 个缓冲块挂到 0 号桶上，它们没有对应的磁盘块，时间戳为 0，
    /// 之后由缓存未命中逐个回收并迁移到各自的目标桶。
    ///
    /// # 可能的错误
    /// 重复调用会 panic（`"binit: already initialized"`）。
    ///
    /// # 安全性
    /// 只能在启动阶段调用一次，且早于任何 `bget`/`bread`。
    pub fn binit(&self) {
        let mut chain = self.buckets[0].chain.lock();
        if !chain.is_empty() {
            panic!("binit: already initialized");
        }
        for index in 0..NBUF {
            chain.push(Slot::new(index));
        }
        drop(chain);

        #[cfg(feature = "verbose_init_info")]
        println!("bcache: {} buffers of {} bytes in {} buckets", NBUF, BSIZE, NBUCKET);
    }

    /// 获取指定设备与块号对应的缓冲块，返回时调用者已持有其睡眠锁。
    ///
    /// # 流程解释
    /// 1. 锁住目标桶查找，命中则增加引用计数，放锁后获取睡眠锁返回；
    /// 2. 未命中则先放开桶锁，再获取目标桶的驱逐锁。
    ///    一边持有桶锁一边去锁其他桶可能形成循环等待，所以必须先放开；
    /// 3. 放开桶锁的空隙里其他 CPU 可能已经为同一块分配了缓冲块，
    ///    持有驱逐锁后再查一次，避免同一块出现两个缓存副本；
    /// 4. 仍未命中则调用 `evict`，在所有桶中按下标升序找出最久未使用的空闲缓冲块，
    ///    重新散列到目标桶并分配给该块。
    ///
    /// 数据是否有效由调用者通过 `bread` 处理，此函数不做磁盘读写。
    ///
    /// # 参数
    /// - `dev`: 设备号；
    /// - `blockno`: 块号。
    ///
    /// # 返回值
    /// 已加锁的 `Buf`，其引用计数已经算上调用者。
    ///
    /// # 可能的错误
    /// 所有缓冲块都在使用中时 panic（`"bget: no buffers"`）。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let id = BlockId::new(dev, blockno);
        let key = id.bucket();
        let bucket = &self.buckets[key];

        // 这个块是否已经在缓存中？
        let mut chain = bucket.chain.lock();
        if let Some(index) = chain.hold(id) {
            drop(chain);
            self.hits.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "trace_bcache")]
            println!("bcache: hit dev {} blockno {} buf {}", dev, blockno, index);
            return self.locked(index, id);
        }
        drop(chain);
        self.misses.fetch_add(1, Ordering::Relaxed);

        // 持有驱逐锁期间，没有其他 CPU 会往这个桶里为同一下标分配缓冲块
        let eviction = bucket.eviction.lock();

        let mut chain = bucket.chain.lock();
        if let Some(index) = chain.hold(id) {
            drop(chain);
            drop(eviction);
            #[cfg(feature = "trace_bcache")]
            println!("bcache: raced dev {} blockno {} buf {}", dev, blockno, index);
            return self.locked(index, id);
        }
        drop(chain);

        let index = self.evict(key, id);
        drop(eviction);
        self.locked(index, id)
    }

    /// 回收最久未使用的空闲缓冲块并分配给 `id`，返回缓冲块下标。
    ///
    /// 调用时必须持有 `key` 桶的驱逐锁，且不持有任何桶锁。
    /// 扫描期间最多同时持有两把桶锁：当前最优候选所在的桶，以及正在检查的桶，
    /// 并且总是按下标升序获取，所以不会与其他 CPU 的扫描形成循环等待。
    fn evict(&self, key: usize, id: BlockId) -> usize {
        // (所在桶, 所在桶的锁, 在桶内的位置, 时间戳)
        let mut best: Option<(usize, SpinLockGuard<'_, Chain>, usize, usize)> = None;

        for (i, bucket) in self.buckets.iter().enumerate() {
            let chain = bucket.chain.lock();
            let found = chain.victim();
            match found {
                Some((pos, last_use)) if best.as_ref().map_or(true, |b| last_use < b.3) => {
                    // 旧候选所在桶的锁随之释放
                    best = Some((i, chain, pos, last_use));
                }
                _ => drop(chain),
            }
        }

        let (donor, mut chain, pos, _) = match best {
            Some(best) => best,
            None => panic!("bget: no buffers"),
        };

        let index = if donor == key {
            let index = chain.assign(pos, id);
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            drop(chain);
            index
        } else {
            // 从原来的桶摘下，重新散列到目标桶。
            // 摘下时已经置引用计数为 1，在途期间任何扫描都看不到它。
            let index = chain.assign(pos, id);
            let slot = chain.take(pos);
            drop(chain);
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            self.buckets[key].chain.lock().push(slot);
            index
        };

        self.evictions.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "trace_bcache")]
        println!(
            "bcache: evict buf {} for dev {} blockno {} (bucket {} -> {})",
            index, id.dev, id.blockno, donor, key
        );
        index
    }

    /// 在不持有任何自旋锁的情况下获取缓冲块的睡眠锁，构造 `Buf`
    fn locked(&self, index: usize, id: BlockId) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            id,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 流程解释
    /// 1. 调用 `bget` 获取已加锁的缓冲块；
    /// 2. 若缓冲块的数据尚未从磁盘加载（`valid` 为假），则同步读取一次并标记为有效；
    ///    已经有效的缓冲块不做任何磁盘访问。
    ///
    /// # 参数
    /// - `dev`: 设备号；
    /// - `blockno`: 块号。
    ///
    /// # 返回值
    /// 持有睡眠锁、内容与磁盘一致（或包含尚未写回的修改）的 `Buf`。
    ///
    /// # 可能的错误
    /// 同 `bget`；设备故障由块设备驱动自行处理。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 释放一个引用。调用者已经放开了缓冲块的睡眠锁。
    ///
    /// 引用计数归零时记下当前时钟滴答，之后该缓冲块才可能被回收。
    fn brelse(&self, index: usize, id: BlockId) {
        let mut chain = self.buckets[id.bucket()].chain.lock();
        let _left = chain.release(index, self.clock.ticks());
        drop(chain);

        #[cfg(feature = "trace_bcache")]
        println!("bcache: release buf {} refcnt {}", index, _left);
    }

    fn bpin(&self, index: usize, id: BlockId) {
        self.buckets[id.bucket()].chain.lock().pin(index);
    }

    fn bunpin(&self, index: usize, id: BlockId) {
        self.buckets[id.bucket()].chain.lock().unpin(index);
    }

    /// 查询某个磁盘块当前是否在缓存中。
    ///
    /// # 功能说明
    /// 只锁住该块散列到的桶查找，不改变引用计数，也不获取睡眠锁。
    /// 放开桶锁之后结果随时可能过时，仅供统计与测试参考。
    ///
    /// # 返回值
    /// 在缓存中时返回缓冲块下标，否则返回 `None`。
    pub fn resident(&self, dev: u32, blockno: u32) -> Option<usize> {
        let id = BlockId::new(dev, blockno);
        let chain = self.buckets[id.bucket()].chain.lock();
        let index = chain.iter().find(|s| s.id == Some(id)).map(|s| s.index);
        drop(chain);
        index
    }

    /// 检查缓冲区缓存的结构是否一致，发现问题时 panic。
    ///
    /// 依次按下标升序获取全部驱逐锁与全部桶锁，此时没有缓冲块处于迁移途中：
    /// - 每个缓冲块恰好出现在一个桶中；
    /// - 任意两个缓冲块缓存的不是同一个磁盘块；
    /// - 每个缓冲块都在其磁盘块散列到的桶中。
    pub fn bcheck(&self) {
        let evictions: ArrayVec<SpinLockGuard<'_, ()>, NBUCKET> =
            self.buckets.iter().map(|b| b.eviction.lock()).collect();
        let chains: ArrayVec<SpinLockGuard<'_, Chain>, NBUCKET> =
            self.buckets.iter().map(|b| b.chain.lock()).collect();

        let mut seen = [false; NBUF];
        let mut ids: ArrayVec<BlockId, NBUF> = ArrayVec::new();
        for (key, chain) in chains.iter().enumerate() {
            for slot in chain.iter() {
                if seen[slot.index] {
                    panic!("bcheck: buf {} in two buckets", slot.index);
                }
                seen[slot.index] = true;
                if let Some(id) = slot.id {
                    if id.bucket() != key {
                        panic!("bcheck: buf {} hashed to bucket {} found in {}", slot.index, id.bucket(), key);
                    }
                    if ids.contains(&id) {
                        panic!("bcheck: dev {} blockno {} cached twice", id.dev, id.blockno);
                    }
                    ids.push(id);
                }
            }
        }
        if let Some(index) = seen.iter().position(|s| !s) {
            panic!("bcheck: buf {} lost", index);
        }

        drop(chains);
        drop(evictions);
    }

    /// 读取命中率与锁竞争统计。
    ///
    /// # 功能说明
    /// 命中、未命中与回收次数来自缓存自身的计数器；
    /// 桶锁与驱逐锁的统计分别把 `NBUCKET` 把同类锁的 [`LockStat`] 合并为一条。
    /// 各计数器分别读取，并发运行时彼此之间不保证是同一时刻的快照。
    ///
    /// # 返回值
    /// 一份 [`BcacheStats`]。
    pub fn stats(&self) -> BcacheStats {
        let bucket = self
            .buckets
            .iter()
            .map(|b| b.chain.stat())
            .fold(LockStat { name: "bcache_bucket", ..LockStat::default() }, LockStat::merge);
        let eviction = self
            .buckets
            .iter()
            .map(|b| b.eviction.stat())
            .fold(LockStat { name: "bcache_eviction", ..LockStat::default() }, LockStat::merge);
        BcacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bucket,
            eviction,
        }
    }

    /// 在控制台打印 [`Bcache::stats`] 的结果。
    ///
    /// 启用 `kernel_warning` 特性时，桶锁的自旋次数超过获取次数会额外打印一条警告。
    pub fn report(&self) {
        let stats = self.stats();
        println!("{}", stats);

        #[cfg(feature = "kernel_warning")]
        {
            if stats.bucket.nspin > stats.bucket.nacquire {
                println!("warning: bcache bucket locks heavily contended");
            }
        }
    }
}

/// [`Bcache::stats`] 的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BcacheStats {
    pub hits: usize,
    pub misses: usize,
    /// 为未命中而回收缓冲块的次数
    pub evictions: usize,
    /// 全部桶锁的合计
    pub bucket: LockStat,
    /// 全部驱逐锁的合计
    pub eviction: LockStat,
}

impl fmt::Display for BcacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- bcache stats")?;
        writeln!(
            f,
            "bcache: hits {} misses {} evictions {}",
            self.hits, self.misses, self.evictions
        )?;
        writeln!(f, "{}", self.bucket)?;
        write!(f, "{}", self.eviction)
    }
}

/// 已加锁的缓冲块，代表某个 `(dev, blockno)` 的缓存副本。
///
/// `Buf` 持有缓冲块数据的睡眠锁，可以像 `[u8; BSIZE]` 一样读写。
/// 离开作用域（或调用 [`Buf::brelse`]）时先释放睡眠锁，再归还引用计数。
pub struct Buf<'a> {
    cache: &'a Bcache<'a>,

    /// 缓冲块在缓冲数组中的下标
    index: usize,

    id: BlockId,

    /// 缓冲数据的睡眠锁守卫。
    ///
    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// 在 `Drop` 中先取出释放，再归还引用计数。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    /// 缓冲块对应的设备号
    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    /// 缓冲块对应的块号
    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }

    /// 缓冲块编号，在缓存的整个生命周期内稳定，可用来判断两个 `Buf` 是否是同一个缓冲块
    pub fn index(&self) -> usize {
        self.index
    }

    /// 把缓冲块的内容同步写回磁盘。
    ///
    /// # 功能说明
    /// 通过块设备把整块数据写到 `(dev, blockno)`，函数返回时写入已经完成。
    /// 不改变引用计数，也不释放睡眠锁。
    ///
    /// # 可能的错误
    /// 当前进程不是该缓冲块睡眠锁的持有者时 panic（`"bwrite"`），
    /// 例如 `Buf` 被移交给了另一个线程。
    pub fn bwrite(&mut self) {
        if !self.holding() {
            panic!("bwrite");
        }
        let disk = self.cache.disk;
        disk.rw(self, true);
    }

    /// 释放缓冲块，等同于丢弃 `Buf`。
    ///
    /// # 流程解释
    /// 1. 确认当前进程持有睡眠锁；
    /// 2. 释放睡眠锁，唤醒等待该缓冲块的进程；
    /// 3. 锁住所在的桶，引用计数减一，归零时记下当前时钟滴答作为最近使用时间。
    ///
    /// # 可能的错误
    /// 当前进程不是睡眠锁的持有者时 panic（`"brelse"`）。
    pub fn brelse(self) {
        drop(self);
    }

    /// 将缓冲块的引用计数加一，表示“钉住”该块，防止其被回收。
    ///
    /// 日志层用它在事务提交前让块常驻内存，即使期间没有进程持有该缓冲块。
    /// 不涉及睡眠锁，需与 `unpin` 配对使用。
    ///
    /// # 流程解释
    /// 锁住缓冲块所在的桶，引用计数加一。调用者持有 `Buf`，缓冲块不会在此期间迁移。
    pub fn pin(&self) {
        self.cache.bpin(self.index, self.id);
    }

    /// 将缓冲块的引用计数减一，撤销一次 `pin`。
    ///
    /// # 流程解释
    /// 锁住缓冲块所在的桶，引用计数减一。调用者自己的引用不受影响，
    /// 直到 `Buf` 被释放后缓冲块才可能成为回收对象。
    ///
    /// # 可能的错误
    /// 次数多于 `pin` 时 panic（`"buf unpin not match"`）。
    pub fn unpin(&self) {
        self.cache.bunpin(self.index, self.id);
    }

    fn holding(&self) -> bool {
        self.data.as_ref().map_or(false, |guard| guard.holding())
    }
}

impl<'a> Deref for Buf<'a> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data.as_ref().unwrap()
    }
}

impl<'a> DerefMut for Buf<'a> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap()
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if !self.holding() {
            // 已经因别的错误在 panic，只放开睡眠锁，引用计数不再归还
            if panicking() {
                return;
            }
            panic!("brelse");
        }
        drop(self.data.take());
        self.cache.brelse(self.index, self.id);
    }
}

/// 缓冲块的数据部分及其有效性标志。
///
/// 与桶中的 [`Slot`] 通过下标一一对应。
struct BufInner {
    /// 缓冲块的内容是否与磁盘一致。
    ///
    /// 分配给新的磁盘块时在桶锁保护下清除，之后只在持有 `data` 睡眠锁时访问。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护。
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
#[derive(Clone)]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}
