//! 内核常量

pub mod fs {
    /// 缓冲区缓存中的缓冲块数量
    pub const NBUF: usize = 30;

    /// 缓冲区缓存的哈希桶数量，取素数以使块号分布更均匀
    pub const NBUCKET: usize = 13;

    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;
}
