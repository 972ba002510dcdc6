//! 集成测试共用的内存盘与时钟

#![allow(dead_code)]

use xv6_bcache::clock::Ticks;
use xv6_bcache::{Bcache, RamDisk};

/// 每个测试各自的磁盘与时钟，缓存借用它们
pub struct Fixture {
    pub disk: RamDisk,
    pub ticks: Ticks,
}

impl Fixture {
    pub fn new(nblocks: u32) -> Self {
        Self {
            disk: RamDisk::new(nblocks),
            ticks: Ticks::new(),
        }
    }

    /// 构造并初始化一个新的缓冲区缓存
    pub fn cache(&self) -> Bcache<'_> {
        let bcache = Bcache::new(&self.disk, &self.ticks);
        bcache.binit();
        bcache
    }

    pub fn tick(&self) {
        self.ticks.clock_intr();
    }
}

/// xorshift 伪随机数，测试可复现
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
