use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tempfile::TempDir;

use tundradb::common::types::{LockMode, PageId};
use tundradb::storage::disk::{FileTablespace, WriteKind};
use tundradb::transaction::concurrency::{IsolationLevel, MemoryTable, TransactionManager};
use tundradb::transaction::wal::MemorySpillStore;
use tundradb::{BufferCache, BufferPoolError, ErrorClass, PageType};

mod common;
use common::{create_test_cache, create_test_log, generate_test_data, test_config, TABLESPACE};

fn page(number: u32) -> PageId {
    PageId::new(TABLESPACE, number)
}

// Allocate a data page whose body starts with `fill` and release it dirty
fn allocate_page(cache: &BufferCache, number: u32, fill: &[u8]) -> Result<()> {
    let mut guard = cache.allocate_fresh(page(number), PageType::Data, 1)?;
    guard.body_mut()?[..fill.len()].copy_from_slice(fill);
    Ok(())
}

#[test]
fn test_write_then_fetch_is_byte_identical() -> Result<()> {
    let config = test_config(8);
    let (cache, tablespace) = create_test_cache(&config)?;
    let data = generate_test_data(1000);

    {
        let mut guard = cache.allocate_fresh(page(4), PageType::Data, 1)?;
        guard.body_mut()?[..data.len()].copy_from_slice(&data);
        cache.write(&guard, WriteKind::Force)?;
        assert!(!guard.is_dirty());
    }
    drop(cache);

    // A fresh cache must read the page back from the tablespace
    let cache = BufferCache::new(&config)?;
    cache.register_tablespace(tablespace)?;
    let guard = cache.fetch(page(4), Some(PageType::Data), LockMode::Shared)?;
    assert_eq!(&guard.body()[..data.len()], &data[..]);
    assert_eq!(cache.stats().misses, 1);
    Ok(())
}

#[test]
fn test_file_tablespace_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(4);
    let path = dir.path().join("round_trip.tbs");
    let data = generate_test_data(300);

    {
        let cache = BufferCache::new(&config)?;
        cache.register_tablespace(Arc::new(FileTablespace::open(TABLESPACE, &path, config.page_size)?))?;
        allocate_page(&cache, 2, &data)?;
        cache.shutdown()?;
    }

    let cache = BufferCache::new(&config)?;
    cache.register_tablespace(Arc::new(FileTablespace::open(TABLESPACE, &path, config.page_size)?))?;
    let guard = cache.fetch(page(2), Some(PageType::Data), LockMode::Shared)?;
    assert_eq!(&guard.body()[..data.len()], &data[..]);
    Ok(())
}

#[test]
fn test_shared_fetches_hold_their_own_pins() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(4))?;
    allocate_page(&cache, 1, b"shared page")?;

    let first = cache.fetch(page(1), None, LockMode::Shared)?;
    let second = cache.fetch(page(1), None, LockMode::Shared)?;
    assert_eq!(first.data(), second.data());
    assert_eq!(cache.frame_info(page(1)).map(|f| f.use_count), Some(2));

    drop(first);
    // The remaining reader still holds both its pin and its latch
    assert_eq!(cache.frame_info(page(1)).map(|f| f.use_count), Some(1));
    assert!(cache.try_fetch(page(1), LockMode::Exclusive)?.is_none());
    assert_eq!(&second.body()[..11], b"shared page");

    drop(second);
    assert_eq!(cache.frame_info(page(1)).map(|f| f.use_count), Some(0));
    assert!(cache.try_fetch(page(1), LockMode::Exclusive)?.is_some());
    Ok(())
}

#[test]
fn test_crash_before_write_loses_dirty_change() -> Result<()> {
    let config = test_config(4);
    let (cache, tablespace) = create_test_cache(&config)?;

    {
        let mut guard = cache.allocate_fresh(page(5), PageType::Data, 1)?;
        guard.body_mut()?[..9].copy_from_slice(b"committed");
        cache.write(&guard, WriteKind::Force)?;
    }
    {
        let mut guard = cache.fetch(page(5), Some(PageType::Data), LockMode::Exclusive)?;
        cache.mark_dirty(&guard, 2)?;
        guard.body_mut()?[..9].copy_from_slice(b"uncommitt");
    }
    // Crash: the cache goes away without writing
    drop(cache);

    let cache = BufferCache::new(&config)?;
    cache.register_tablespace(tablespace)?;
    let guard = cache.fetch(page(5), Some(PageType::Data), LockMode::Shared)?;
    assert_eq!(&guard.body()[..9], b"committed");
    Ok(())
}

#[test]
fn test_mutation_requires_mark_dirty() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(4))?;
    allocate_page(&cache, 3, b"x")?;
    {
        let guard = cache.fetch(page(3), None, LockMode::Exclusive)?;
        cache.write(&guard, WriteKind::Force)?;
    }

    let mut guard = cache.fetch(page(3), None, LockMode::Exclusive)?;
    assert!(guard.body_mut().is_err());
    cache.mark_dirty(&guard, 9)?;
    guard.body_mut()?[0] = b'y';
    assert_eq!(cache.frame_info(page(3)).map(|f| f.dirty_txn), Some(9));

    let shared = {
        drop(guard);
        cache.fetch(page(3), None, LockMode::Shared)?
    };
    assert!(matches!(
        cache.mark_dirty(&shared, 9),
        Err(BufferPoolError::InvalidOperation(_))
    ));
    Ok(())
}

#[test]
fn test_explicit_write_honors_precedence() -> Result<()> {
    let (cache, tablespace) = create_test_cache(&test_config(8))?;
    allocate_page(&cache, 2, b"follow")?;
    {
        let mut guard = cache.allocate_fresh(page(1), PageType::Data, 1)?;
        guard.body_mut()?[..7].copy_from_slice(b"precede");
        cache.add_precedence(&guard, 2)?;
    }
    assert!(cache.exists_dependency(page(1), page(2)));
    assert!(!cache.exists_dependency(page(2), page(1)));

    assert!(cache.write_page_by_id(page(2), WriteKind::Force)?);
    let first = tablespace.first_write_of(1).expect("page 1 written");
    let second = tablespace.first_write_of(2).expect("page 2 written");
    assert!(first < second);
    assert_eq!(tablespace.write_history()[first].kind, WriteKind::Precedence);
    assert!(!cache.exists_dependency(page(1), page(2)));
    Ok(())
}

#[test]
fn test_precedence_cycle_is_broken_by_writing() -> Result<()> {
    let (cache, tablespace) = create_test_cache(&test_config(8))?;
    allocate_page(&cache, 1, b"a")?;
    allocate_page(&cache, 2, b"b")?;
    {
        let guard = cache.fetch(page(1), None, LockMode::Exclusive)?;
        cache.add_precedence(&guard, 2)?;
    }

    // 2 before 1 would close a cycle: page 1 goes to disk first
    {
        let guard = cache.fetch(page(2), None, LockMode::Exclusive)?;
        cache.add_precedence(&guard, 1)?;
    }
    assert!(tablespace.first_write_of(1).is_some());
    assert!(tablespace.first_write_of(2).is_none());
    assert!(!cache.exists_dependency(page(1), page(2)));
    assert!(cache.exists_dependency(page(2), page(1)));
    assert_eq!(cache.stats().live_edges, 1);
    Ok(())
}

#[test]
fn test_clean_page_adds_no_precedence() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(8))?;
    allocate_page(&cache, 1, b"a")?;
    allocate_page(&cache, 2, b"b")?;
    cache.write_page_by_id(page(1), WriteKind::Force)?;

    let guard = cache.fetch(page(1), None, LockMode::Shared)?;
    cache.add_precedence(&guard, 2)?;
    cache.add_precedence(&guard, 77)?;
    assert!(!cache.exists_dependency(page(1), page(2)));
    Ok(())
}

#[test]
fn test_self_precedence_is_ignored() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(8))?;
    allocate_page(&cache, 3, b"c")?;

    let guard = cache.fetch(page(3), None, LockMode::Shared)?;
    assert!(guard.is_dirty());
    cache.add_precedence(&guard, 3)?;
    assert_eq!(cache.stats().live_edges, 0);
    Ok(())
}

#[test]
fn test_eviction_writes_predecessors_first() -> Result<()> {
    let (cache, tablespace) = create_test_cache(&test_config(2))?;
    allocate_page(&cache, 2, b"follow")?;
    {
        let mut guard = cache.allocate_fresh(page(1), PageType::Data, 1)?;
        guard.body_mut()?[0] = 1;
        cache.add_precedence(&guard, 2)?;
    }

    // Both frames are dirty; reading page 3 forces a reuse write
    let _third = cache.fetch(page(3), None, LockMode::Shared)?;
    let first = tablespace.first_write_of(1).expect("predecessor written for reuse");
    if let Some(second) = tablespace.first_write_of(2) {
        assert!(first < second);
    }
    assert!(tablespace.write_history().iter().all(|w| w.kind == WriteKind::Reuse || w.kind == WriteKind::Precedence));
    assert_eq!(cache.stats().evictions, 1);
    Ok(())
}

#[test]
fn test_pinned_pool_is_exhausted() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(2))?;
    let _a = cache.fetch(page(1), None, LockMode::Shared)?;
    let _b = cache.fetch(page(2), None, LockMode::Shared)?;

    let err = cache.fetch(page(3), None, LockMode::Shared).err().expect("no free frame");
    assert!(matches!(err, BufferPoolError::PoolExhausted));
    assert_eq!(err.class(), ErrorClass::ResourceExhaustion);
    assert!(err.is_retryable());

    // Rebinding only happens once a frame's use-count is zero
    drop(_a);
    let _c = cache.fetch(page(3), None, LockMode::Shared)?;
    assert!(cache.frame_info(page(1)).is_none());
    assert_eq!(cache.frame_info(page(2)).map(|f| f.use_count), Some(1));
    Ok(())
}

#[test]
fn test_latch_wait_times_out() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(4))?;
    let _writer = cache.fetch(page(1), None, LockMode::Exclusive)?;

    let result = crossbeam::thread::scope(|s| {
        s.spawn(|_| cache.fetch(page(1), None, LockMode::Shared).map(|_| ()))
            .join()
            .expect("reader thread panicked")
    })
    .expect("scope failed");
    let err = result.err().expect("reader must time out");
    assert!(matches!(err, BufferPoolError::LockTimeout(p) if p == page(1)));
    assert_eq!(err.class(), ErrorClass::LockTimeout);
    Ok(())
}

#[test]
fn test_corrupt_page_is_not_cached() -> Result<()> {
    let config = test_config(4);
    let (cache, tablespace) = create_test_cache(&config)?;
    {
        let guard = cache.allocate_fresh(page(9), PageType::Data, 1)?;
        cache.write(&guard, WriteKind::Force)?;
    }
    drop(cache);

    let mut image = tablespace.stored_page(9).expect("page 9 on disk");
    image[config.page_size - 1] ^= 0xff;
    tablespace.put_raw(9, &image);

    let cache = BufferCache::new(&config)?;
    cache.register_tablespace(tablespace.clone())?;
    let err = cache.fetch(page(9), None, LockMode::Shared).err().expect("checksum mismatch");
    assert!(matches!(err, BufferPoolError::Corruption { .. }));
    assert!(err.class().is_fatal());
    assert!(cache.frame_info(page(9)).is_none());
    Ok(())
}

#[test]
fn test_wrong_page_type() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(4))?;
    allocate_page(&cache, 6, b"data")?;
    let err = cache
        .fetch(page(6), Some(PageType::Inventory), LockMode::Shared)
        .err()
        .expect("type mismatch");
    assert!(matches!(
        err,
        BufferPoolError::WrongPageType {
            expected: PageType::Inventory,
            found: PageType::Data,
            ..
        }
    ));
    Ok(())
}

#[test]
fn test_wrong_page_type_on_miss_is_not_cached() -> Result<()> {
    let config = test_config(4);
    let (cache, tablespace) = create_test_cache(&config)?;
    {
        let guard = cache.allocate_fresh(page(6), PageType::Data, 1)?;
        cache.write(&guard, WriteKind::Force)?;
    }
    drop(cache);

    let cache = BufferCache::new(&config)?;
    cache.register_tablespace(tablespace)?;
    let err = cache
        .fetch(page(6), Some(PageType::Inventory), LockMode::Shared)
        .err()
        .expect("type mismatch");
    assert!(matches!(err, BufferPoolError::WrongPageType { .. }));
    assert!(cache.frame_info(page(6)).is_none());
    assert_eq!(cache.stats().in_use, 0);

    // Read again under the right type
    let guard = cache.fetch(page(6), Some(PageType::Data), LockMode::Shared)?;
    assert_eq!(guard.page_type()?, PageType::Data);
    assert_eq!(cache.stats().misses, 2);
    Ok(())
}

#[test]
fn test_probe_ignores_uncached_and_free_pages() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(4))?;
    assert!(cache.probe(page(1), LockMode::Shared)?.is_none());

    // Never written: read back as an unformatted free page
    drop(cache.fetch(page(1), None, LockMode::Shared)?);
    assert!(cache.probe(page(1), LockMode::Shared)?.is_none());

    allocate_page(&cache, 2, b"p")?;
    assert!(cache.probe(page(2), LockMode::Shared)?.is_some());
    Ok(())
}

#[test]
fn test_free_page_drops_edges() -> Result<()> {
    let (cache, tablespace) = create_test_cache(&test_config(4))?;
    allocate_page(&cache, 2, b"b")?;
    {
        let guard = cache.allocate_fresh(page(1), PageType::Data, 1)?;
        cache.add_precedence(&guard, 2)?;
    }
    assert!(cache.free_page(page(1))?);
    assert!(!cache.exists_dependency(page(1), page(2)));

    cache.write_page_by_id(page(2), WriteKind::Force)?;
    assert!(tablespace.first_write_of(1).is_none());
    Ok(())
}

#[test]
fn test_concurrent_fetches_never_alias_frames() -> Result<()> {
    let (cache, _tablespace) = create_test_cache(&test_config(6))?;
    let pages = 20u32;
    for number in 1..=pages {
        allocate_page(&cache, number, &number.to_le_bytes())?;
    }

    crossbeam::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|_| {
                let mut rng = rand::thread_rng();
                for _ in 0..200 {
                    let number = rng.gen_range(1..=pages);
                    match cache.fetch(page(number), Some(PageType::Data), LockMode::Shared) {
                        Ok(guard) => {
                            assert_eq!(guard.page_id(), page(number));
                            assert_eq!(&guard.body()[..4], &number.to_le_bytes());
                        }
                        Err(e) => assert!(e.is_retryable(), "unexpected error {}", e),
                    }
                }
            });
        }
    })
    .expect("reader thread panicked");

    let mut owners: HashMap<u32, PageId> = HashMap::new();
    for number in 1..=pages {
        if let Some(info) = cache.frame_info(page(number)) {
            assert_eq!(info.use_count, 0);
            assert!(owners.insert(info.frame_id, info.page_id).is_none());
        }
    }
    Ok(())
}

#[test]
fn test_checkpoint_with_flush_threads() -> Result<()> {
    let config = test_config(16).with_flush_threads(2);
    let (cache, tablespace) = create_test_cache(&config)?;
    for number in (0..10).rev() {
        let guard = {
            let mut guard = cache.allocate_fresh(page(number), PageType::Data, 3)?;
            guard.body_mut()?[0] = number as u8;
            guard
        };
        if number < 9 {
            cache.add_precedence(&guard, number + 1)?;
        }
    }

    let waiter = cache.flush_all(42);
    assert_eq!(waiter.token(), 42);
    assert_eq!(waiter.wait(Duration::from_secs(10))?, 42);
    assert!(cache.dirty_pages().is_empty());
    for number in 0..9 {
        assert!(tablespace.first_write_of(number) < tablespace.first_write_of(number + 1));
    }
    cache.shutdown()?;
    Ok(())
}

#[test]
fn test_failed_write_keeps_page_dirty() -> Result<()> {
    let (cache, tablespace) = create_test_cache(&test_config(4))?;
    allocate_page(&cache, 1, b"a")?;
    tablespace.set_fail_writes(true);
    let err = cache.write_page_by_id(page(1), WriteKind::Force).err().expect("write fails");
    assert_eq!(err.class(), ErrorClass::Io);
    assert_eq!(cache.dirty_pages().len(), 1);

    tablespace.set_fail_writes(false);
    cache.write_page_by_id(page(1), WriteKind::Force)?;
    assert!(cache.dirty_pages().is_empty());
    Ok(())
}

#[test]
fn test_panic_shutdown_refuses_new_faults() -> Result<()> {
    let (cache, tablespace) = create_test_cache(&test_config(4))?;
    allocate_page(&cache, 1, b"a")?;
    cache.shutdown_now();
    assert!(cache.is_panicking());
    assert!(tablespace.first_write_of(1).is_some());
    assert!(matches!(
        cache.fetch(page(2), None, LockMode::Shared),
        Err(BufferPoolError::PanicShutdown)
    ));
    Ok(())
}

#[test]
fn test_commits_wait_for_flush_thread_writes() -> Result<()> {
    let config = test_config(8)
        .with_flush_threads(1)
        .with_lock_wait_timeout(Duration::from_secs(5));
    let (cache, tablespace) = create_test_cache(&config)?;
    let (log, _dir) = create_test_log()?;
    let manager = TransactionManager::new(&config, log, Arc::new(MemorySpillStore::new()), Some(cache.clone()));
    let table = Arc::new(MemoryTable::new(1));

    let mut first = manager.begin(IsolationLevel::ReadCommitted)?;
    table.store(&mut first, 1, b"one".to_vec())?;
    {
        let mut guard = cache.allocate_fresh(page(5), PageType::Data, first.id())?;
        guard.body_mut()?[0] = 1;
    }
    let first_flush = cache.flush_all(1);

    // The same page dirtied again while the first flush may still be writing it
    let mut second = manager.begin(IsolationLevel::ReadCommitted)?;
    table.store(&mut second, 2, b"two".to_vec())?;
    {
        let mut guard = cache.fetch(page(5), Some(PageType::Data), LockMode::Exclusive)?;
        cache.mark_dirty(&guard, second.id())?;
        guard.body_mut()?[0] = 2;
    }
    let second_flush = cache.flush_all(2);

    let started = Instant::now();
    first.commit()?;
    second.commit()?;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!cache.has_pending_writes(first.id()));
    assert!(!cache.has_pending_writes(second.id()));

    assert_eq!(first_flush.wait(Duration::from_secs(5))?, 1);
    assert_eq!(second_flush.wait(Duration::from_secs(5))?, 2);
    assert_eq!(cache.stats().dirty, 0);
    cache.shutdown()?;

    // The second image is the one on disk
    let reader = BufferCache::new(&test_config(4))?;
    reader.register_tablespace(tablespace)?;
    let guard = reader.fetch(page(5), Some(PageType::Data), LockMode::Shared)?;
    assert_eq!(guard.body()[0], 2);
    Ok(())
}
