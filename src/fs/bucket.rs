//! 缓冲区缓存的哈希桶
//!
//! 每个桶保存当前散列到它的缓冲块的控制信息（[`Slot`]），由桶锁保护；
//! 缓冲块在桶之间迁移时，控制信息随之整体移动。

use arrayvec::ArrayVec;

use crate::consts::fs::{NBUCKET, NBUF};
use crate::spinlock::SpinLock;

/// 磁盘块的标识：设备号与块号
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockId {
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }

    /// 该块散列到的哈希桶下标。设备号左移后溢出的高位直接丢弃。
    pub const fn bucket(&self) -> usize {
        ((self.dev << 27) | self.blockno) as usize % NBUCKET
    }
}

/// 一个哈希桶：缓冲块链及两把锁。
pub(super) struct Bucket {
    /// 桶锁，保护链的增删以及链上缓冲块的引用计数
    pub chain: SpinLock<Chain>,

    /// 驱逐锁，串行化同一个桶下标上的缓存未命中处理，与桶锁相互独立
    pub eviction: SpinLock<()>,
}

impl Bucket {
    pub const fn new() -> Self {
        Self {
            chain: SpinLock::new(Chain::new(), "bcache_bucket"),
            eviction: SpinLock::new((), "bcache_eviction"),
        }
    }
}

/// 缓冲块控制信息，不含块数据。
#[derive(Debug, Clone, Copy)]
pub(super) struct Slot {
    /// 缓冲块在全局缓冲数组中的下标，终生不变
    pub index: usize,

    /// 当前缓存的磁盘块，从未分配过时为 `None`。引用计数大于零时不可改变。
    pub id: Option<BlockId>,

    /// 持有者数量（包括 pin）。为 0 时可被回收。
    pub refcnt: usize,

    /// 引用计数最后一次降为 0 时的时钟滴答，仅在 `refcnt == 0` 时有意义
    pub last_use: usize,
}

impl Slot {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            id: None,
            refcnt: 0,
            last_use: 0,
        }
    }
}

/// 一个桶里的缓冲块集合。最坏情况下所有缓冲块都散列到同一个桶，因此容量为 `NBUF`。
pub(super) struct Chain {
    slots: ArrayVec<Slot, NBUF>,
}

impl Chain {
    const fn new() -> Self {
        Self {
            slots: ArrayVec::new_const(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn push(&mut self, slot: Slot) {
        self.slots.push(slot);
    }

    /// 从链上摘下位于 `pos` 的缓冲块
    pub fn take(&mut self, pos: usize) -> Slot {
        self.slots.remove(pos)
    }

    /// 若 `id` 已缓存在本桶中，增加其引用计数并返回缓冲块下标。
    ///
    /// # 返回值
    /// 命中时返回 `Some(index)`，未命中时返回 `None` 且不改动任何缓冲块。
    pub fn hold(&mut self, id: BlockId) -> Option<usize> {
        let slot = self.slots.iter_mut().find(|s| s.id == Some(id))?;
        slot.refcnt += 1;
        Some(slot.index)
    }

    /// 本桶中引用计数为 0 且最久未使用的缓冲块，返回其位置与时间戳。
    ///
    /// # 功能说明
    /// 从未使用过的缓冲块时间戳为 0，与在第一个时钟滴答之前释放的缓冲块相同；
    /// 时间戳相同时取链上靠前的一个。
    ///
    /// # 返回值
    /// `Some((pos, last_use))`，`pos` 为在链上的位置；没有空闲缓冲块时返回 `None`。
    pub fn victim(&self) -> Option<(usize, usize)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.refcnt == 0)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(pos, s)| (pos, s.last_use))
    }

    /// 把位于 `pos` 的空闲缓冲块分配给 `id`，引用计数置 1
    pub fn assign(&mut self, pos: usize, id: BlockId) -> usize {
        let slot = &mut self.slots[pos];
        debug_assert_eq!(slot.refcnt, 0);
        slot.id = Some(id);
        slot.refcnt = 1;
        slot.index
    }

    /// 增加下标为 `index` 的缓冲块的引用计数
    pub fn pin(&mut self, index: usize) {
        self.slot_mut(index, "bpin").refcnt += 1;
    }

    /// 减少下标为 `index` 的缓冲块的引用计数。调用者自己还持有一个引用，因此计数不能因此归零。
    pub fn unpin(&mut self, index: usize) {
        let slot = self.slot_mut(index, "bunpin");
        if slot.refcnt <= 1 {
            panic!("buf unpin not match");
        }
        slot.refcnt -= 1;
    }

    /// 释放一个引用；计数归零时记录时间戳 `now`。
    ///
    /// # 返回值
    /// 剩余的引用计数。
    ///
    /// # 可能的错误
    /// 引用计数已经为 0 时 panic（`"brelse: refcnt underflow"`）；
    /// 缓冲块不在本桶中时 panic。
    pub fn release(&mut self, index: usize, now: usize) -> usize {
        let slot = self.slot_mut(index, "brelse");
        slot.refcnt = match slot.refcnt.checked_sub(1) {
            Some(n) => n,
            None => panic!("brelse: refcnt underflow"),
        };
        if slot.refcnt == 0 {
            slot.last_use = now;
        }
        slot.refcnt
    }

    /// 被引用的缓冲块不会离开所在的桶，找不到说明调用者传错了缓冲块
    fn slot_mut(&mut self, index: usize, who: &str) -> &mut Slot {
        match self.slots.iter_mut().find(|s| s.index == index) {
            Some(slot) => slot,
            None => panic!("{}: buf {} not in its bucket", who, index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(slots: &[(usize, Option<BlockId>, usize, usize)]) -> Chain {
        let mut chain = Chain::new();
        for &(index, id, refcnt, last_use) in slots {
            chain.push(Slot { index, id, refcnt, last_use });
        }
        chain
    }

    #[test]
    fn hash_matches_xv6_layout() {
        assert_eq!(BlockId::new(0, 0).bucket(), 0);
        assert_eq!(BlockId::new(1, 5).bucket(), ((1u32 << 27) | 5) as usize % NBUCKET);
        assert_eq!(BlockId::new(0, 14).bucket(), 1);
        // 设备号的高位被移出 u32
        assert_eq!(BlockId::new(1 << 5, 3).bucket(), BlockId::new(0, 3).bucket());
    }

    #[test]
    fn hold_counts_references() {
        let id = BlockId::new(1, 2);
        let mut c = chain(&[(0, None, 0, 0), (4, Some(id), 0, 9)]);
        assert_eq!(c.hold(id), Some(4));
        assert_eq!(c.hold(id), Some(4));
        assert_eq!(c.hold(BlockId::new(1, 3)), None);
        assert_eq!(c.iter().find(|s| s.index == 4).unwrap().refcnt, 2);
    }

    #[test]
    fn victim_is_oldest_free_slot() {
        let mut c = chain(&[
            (0, Some(BlockId::new(1, 1)), 1, 0),
            (1, Some(BlockId::new(1, 2)), 0, 7),
            (2, Some(BlockId::new(1, 3)), 0, 3),
            (3, Some(BlockId::new(1, 4)), 0, 3),
        ]);
        assert_eq!(c.victim(), Some((2, 3)));
        c.pin(2);
        assert_eq!(c.victim(), Some((3, 3)));
    }

    #[test]
    fn no_victim_when_all_referenced() {
        let c = chain(&[(0, None, 1, 0), (1, None, 2, 0)]);
        assert_eq!(c.victim(), None);
        assert_eq!(Chain::new().victim(), None);
    }

    #[test]
    fn release_stamps_last_use_at_zero() {
        let mut c = chain(&[(5, Some(BlockId::new(1, 1)), 2, 0)]);
        assert_eq!(c.release(5, 10), 1);
        assert_eq!(c.iter().next().unwrap().last_use, 0);
        assert_eq!(c.release(5, 11), 0);
        assert_eq!(c.iter().next().unwrap().last_use, 11);
    }

    #[test]
    fn released_before_first_tick_ties_with_unused() {
        let mut c = chain(&[(0, Some(BlockId::new(1, 1)), 1, 0), (1, None, 0, 0)]);
        assert_eq!(c.release(0, 0), 0);
        assert_eq!(c.victim(), Some((0, 0)));

        let mut c = chain(&[(1, None, 0, 0), (0, Some(BlockId::new(1, 1)), 1, 0)]);
        c.release(0, 0);
        assert_eq!(c.victim(), Some((0, 0)));
        assert_eq!(c.iter().next().unwrap().id, None);
    }

    #[test]
    fn assign_and_take() {
        let id = BlockId::new(2, 9);
        let mut c = chain(&[(0, None, 0, 0), (1, None, 0, 0)]);
        assert_eq!(c.assign(1, id), 1);
        let slot = c.take(1);
        assert_eq!((slot.id, slot.refcnt), (Some(id), 1));
        assert_eq!(c.iter().count(), 1);
    }

    #[test]
    #[should_panic(expected = "buf unpin not match")]
    fn unpin_below_holder_panics() {
        let mut c = chain(&[(0, Some(BlockId::new(1, 1)), 1, 0)]);
        c.unpin(0);
    }
}
