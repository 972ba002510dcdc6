//! 内存盘：以内存模拟的块设备
//!
//! 按 `(dev, blockno)` 稀疏地保存块内容，从未写过的块读出来全为零。
//! 记录读写次数，便于观察缓存是否真的省掉了磁盘访问。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::BlockDevice;
use crate::consts::fs::BSIZE;
use crate::fs::{BlockId, Buf, BufData};
use crate::spinlock::SpinLock;

pub struct RamDisk {
    blocks: SpinLock<BTreeMap<BlockId, Box<BufData>>>,
    /// 每个设备的块数，块号越界视为设备故障
    nblocks: u32,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub const fn new(nblocks: u32) -> Self {
        Self {
            blocks: SpinLock::new(BTreeMap::new(), "ramdisk"),
            nblocks,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 迄今为止从磁盘读取的块数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 迄今为止写入磁盘的块数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接读出磁盘上的块内容，不计入读次数
    pub fn peek(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        let blocks = self.blocks.lock();
        match blocks.get(&BlockId::new(dev, blockno)) {
            Some(data) => ***data,
            None => [0; BSIZE],
        }
    }

    /// 绕过缓存直接改写磁盘上的块内容，`bytes` 不足一块时其余部分清零
    pub fn poke(&self, dev: u32, blockno: u32, bytes: &[u8]) {
        self.check(blockno);
        let mut data = Box::new(BufData::new());
        data[..bytes.len()].copy_from_slice(bytes);
        self.blocks.lock().insert(BlockId::new(dev, blockno), data);
    }

    fn check(&self, blockno: u32) {
        if blockno >= self.nblocks {
            panic!("ramdisk: blockno out of range");
        }
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        self.check(buf.blockno());
        let id = BlockId::new(buf.dev(), buf.blockno());

        if writing {
            self.writes.fetch_add(1, Ordering::Relaxed);
            let mut data = Box::new(BufData::new());
            data.copy_from_slice(&buf[..]);
            self.blocks.lock().insert(id, data);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let blocks = self.blocks.lock();
            match blocks.get(&id) {
                Some(data) => buf.copy_from_slice(&data[..]),
                None => buf.fill(0),
            }
            drop(blocks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_blocks_read_as_zero() {
        let disk = RamDisk::new(8);
        assert_eq!(disk.peek(1, 3), [0; BSIZE]);
        assert_eq!(disk.reads(), 0);
    }

    #[test]
    fn poke_then_peek() {
        let disk = RamDisk::new(8);
        disk.poke(1, 3, b"hello");
        let data = disk.peek(1, 3);
        assert_eq!(&data[..5], b"hello");
        assert!(data[5..].iter().all(|&b| b == 0));
        assert_eq!(disk.peek(2, 3), [0; BSIZE]);
    }

    #[test]
    #[should_panic(expected = "ramdisk: blockno out of range")]
    fn out_of_range() {
        let disk = RamDisk::new(8);
        disk.poke(1, 8, b"x");
    }
}
