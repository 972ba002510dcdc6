mod common;

use std::sync::{Barrier, Mutex};
use std::thread;
use std::time::Duration;

use common::{Fixture, Rng};
use xv6_bcache::consts::fs::NBUF;

const DEV: u32 = 1;

#[test]
fn concurrent_gets_share_one_buffer() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();
    let start = Barrier::new(8);
    let seen = Mutex::new(Vec::new());

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                start.wait();
                let b = bcache.bget(DEV, 42);
                seen.lock().unwrap().push(b.index());
                thread::sleep(Duration::from_millis(1));
                drop(b);
            });
        }
    });

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 8);
    assert!(seen.iter().all(|&i| i == seen[0]));
    assert_eq!(bcache.stats().misses + bcache.stats().hits, 8);
    bcache.bcheck();
}

#[test]
fn concurrent_readers_of_uncached_block() {
    let fx = Fixture::new(64);
    fx.disk.poke(DEV, 5, b"block five");
    let bcache = fx.cache();
    let start = Barrier::new(2);
    let seen = Mutex::new(Vec::new());

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                start.wait();
                let b = bcache.bread(DEV, 5);
                assert_eq!(&b[..10], b"block five");
                seen.lock().unwrap().push(b.index());
            });
        }
    });

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen[0], seen[1]);
    assert_eq!(fx.disk.reads(), 1);
}

#[test]
fn hit_returns_written_payload_without_io() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();

    let mut b = bcache.bread(DEV, 9);
    b[..6].copy_from_slice(b"cached");
    b.bwrite();
    b.brelse();

    let b = bcache.bread(DEV, 9);
    assert_eq!(&b[..6], b"cached");
    drop(b);
    assert_eq!(fx.disk.reads(), 1);
    assert_eq!(fx.disk.writes(), 1);
    assert_eq!(&fx.disk.peek(DEV, 9)[..6], b"cached");
}

#[test]
fn earliest_released_block_is_evicted() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();

    for blockno in 1..=NBUF as u32 {
        fx.tick();
        drop(bcache.bget(DEV, blockno));
    }
    drop(bcache.bget(DEV, NBUF as u32 + 1));

    assert_eq!(bcache.resident(DEV, 1), None);
    for blockno in 2..=NBUF as u32 + 1 {
        assert!(bcache.resident(DEV, blockno).is_some(), "block {} evicted", blockno);
    }
}

#[test]
fn eviction_follows_release_order_not_request_order() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();

    let held: Vec<_> = (1..=NBUF as u32).map(|blockno| bcache.bget(DEV, blockno)).collect();
    // 按请求的逆序释放：最后请求的块最早释放
    for b in held.into_iter().rev() {
        fx.tick();
        drop(b);
    }

    let b = bcache.bget(DEV, 100);
    assert_eq!(bcache.resident(DEV, NBUF as u32), None);
    assert!(bcache.resident(DEV, 1).is_some());
    drop(b);

    drop(bcache.bget(DEV, 101));
    assert_eq!(bcache.resident(DEV, NBUF as u32 - 1), None);
    assert!(bcache.resident(DEV, 1).is_some());
    bcache.bcheck();
}

#[test]
fn pinned_buffer_is_never_evicted() {
    let fx = Fixture::new(256);
    let bcache = fx.cache();

    // 从未释放过，时间戳保持为全局最小
    let b = bcache.bread(DEV, 7);
    let index = b.index();
    b.pin();
    drop(b);

    for blockno in 100..200 {
        fx.tick();
        drop(bcache.bget(DEV, blockno));
    }
    assert_eq!(bcache.resident(DEV, 7), Some(index));

    let b = bcache.bread(DEV, 7);
    assert_eq!(b.index(), index);
    b.unpin();
    drop(b);
    assert_eq!(fx.disk.reads(), 1);

    for blockno in 100..100 + NBUF as u32 {
        fx.tick();
        drop(bcache.bget(DEV, blockno));
    }
    assert_eq!(bcache.resident(DEV, 7), None);
}

#[test]
#[should_panic(expected = "bget: no buffers")]
fn exhausted_pool_panics() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();
    let _held: Vec<_> = (0..NBUF as u32).map(|blockno| bcache.bget(DEV, blockno)).collect();
    bcache.bget(DEV, NBUF as u32);
}

#[test]
fn release_by_another_thread_is_rejected() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();

    let b = bcache.bread(DEV, 7);
    let result = thread::scope(|s| s.spawn(move || drop(b)).join());
    let err = result.unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"brelse"));
}

#[test]
fn write_by_another_thread_is_rejected() {
    let fx = Fixture::new(64);
    let bcache = fx.cache();

    let b = bcache.bread(DEV, 8);
    let result = thread::scope(|s| {
        s.spawn(move || {
            let mut b = b;
            b.bwrite();
        })
        .join()
    });
    let err = result.unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"bwrite"));
    assert_eq!(fx.disk.writes(), 0);
}

#[test]
fn random_load_keeps_blocks_consistent() {
    const THREADS: u64 = 8;
    const OPS: usize = 1500;
    const BLOCKS: u64 = 64;

    let fx = Fixture::new(BLOCKS as u32);
    let bcache = fx.cache();
    let start = Barrier::new(THREADS as usize);
    let total = Mutex::new(0u64);

    thread::scope(|s| {
        for t in 0..THREADS {
            let (fx, bcache, start, total) = (&fx, &bcache, &start, &total);
            s.spawn(move || {
                let mut rng = Rng::new(t + 1);
                let mut pinned = Vec::new();
                let mut increments = 0u64;
                start.wait();

                for _ in 0..OPS {
                    fx.tick();
                    let blockno = rng.below(BLOCKS) as u32;
                    match rng.below(10) {
                        0..=5 => {
                            let mut b = bcache.bread(DEV, blockno);
                            let mut counter = [0u8; 8];
                            counter.copy_from_slice(&b[..8]);
                            let next = u64::from_le_bytes(counter) + 1;
                            b[..8].copy_from_slice(&next.to_le_bytes());
                            b.bwrite();
                            increments += 1;
                        }
                        6..=7 => drop(bcache.bget(DEV, blockno)),
                        8 if pinned.len() < 2 => {
                            let b = bcache.bget(DEV, blockno);
                            b.pin();
                            pinned.push(blockno);
                        }
                        9 => {
                            if let Some(blockno) = pinned.pop() {
                                bcache.bget(DEV, blockno).unpin();
                            }
                        }
                        _ => thread::yield_now(),
                    }
                    if rng.below(100) == 0 {
                        bcache.bcheck();
                    }
                }

                for blockno in pinned {
                    bcache.bget(DEV, blockno).unpin();
                }
                *total.lock().unwrap() += increments;
            });
        }
    });

    bcache.bcheck();

    let on_disk: u64 = (0..BLOCKS as u32)
        .map(|blockno| {
            let mut counter = [0u8; 8];
            counter.copy_from_slice(&fx.disk.peek(DEV, blockno)[..8]);
            u64::from_le_bytes(counter)
        })
        .sum();
    assert_eq!(on_disk, total.into_inner().unwrap());

    // 没有遗留的引用：整个缓冲池都能同时分配出去
    let held: Vec<_> = (0..NBUF as u32).map(|blockno| bcache.bget(DEV, blockno)).collect();
    assert_eq!(held.len(), NBUF);
}
