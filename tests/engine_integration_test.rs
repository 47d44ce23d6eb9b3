// Integration tests for the request routing and IO paths

#[cfg(test)]
mod engine_integration_tests {
    use cascade::btree::iter::BtreeIter;
    use cascade::btree::BtreeId;
    use cascade::core::keys::Bpos;
    use cascade::device::{BlockBackend, DeviceConfig, MemBackend};
    use cascade::io::{Bio, BioFlags};
    use cascade::journal::JournalRecord;
    use cascade::request::{BlockdevVolume, CacheMode, CachedDev};
    use cascade::set::{CacheSet, CacheSetConfig};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_set(ndevs: usize, nbuckets: u64, bucket_sectors: u32) -> (Arc<CacheSet>, Vec<Arc<MemBackend>>) {
        init_logging();
        let c = CacheSet::open(CacheSetConfig::default());
        let mut backends = Vec::new();
        for _ in 0..ndevs {
            let backend = Arc::new(MemBackend::new(nbuckets * bucket_sectors as u64, true));
            let cfg = DeviceConfig {
                nbuckets,
                bucket_sectors,
                first_bucket: 1,
                ..DeviceConfig::default()
            };
            c.add_device(cfg, Arc::clone(&backend) as Arc<dyn cascade::device::BlockBackend>)
                .unwrap();
            backends.push(backend);
        }
        c.start().unwrap();
        (c, backends)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// First extent at or after (inode, sector), if any
    fn peek_extent(c: &Arc<CacheSet>, inode: u64, sector: u64) -> Option<cascade::core::keys::BkeyI> {
        let mut iter = BtreeIter::new(Arc::clone(c), BtreeId::Extents, Bpos::new(inode, sector), 0);
        let k = iter.peek_with_holes().unwrap();
        iter.unlock_all();
        k.filter(|k| k.is_data())
    }

    #[test]
    fn test_volume_write_read_roundtrip() {
        let (c, _b) = new_set(1, 512, 64);
        let vol = BlockdevVolume::create(Arc::clone(&c), 4096).unwrap();

        let data = pattern(128 * 512, 7);
        let mut w = Bio::write(0, data.clone());
        vol.make_request(&mut w).unwrap();

        let mut r = Bio::read(0, 128);
        vol.make_request(&mut r).unwrap();
        assert_eq!(r.data, data);

        // Unwritten ranges read as zeroes.
        let mut hole = Bio::read(1024, 16);
        vol.make_request(&mut hole).unwrap();
        assert!(hole.data.iter().all(|&b| b == 0));

        // Discarded ranges read back as zeroes too.
        let mut d = Bio::discard(0, 64);
        vol.make_request(&mut d).unwrap();
        let mut after = Bio::read(0, 128);
        vol.make_request(&mut after).unwrap();
        assert!(after.data[..64 * 512].iter().all(|&b| b == 0));
        assert_eq!(&after.data[64 * 512..], &data[64 * 512..]);

        c.stop();
    }

    #[test]
    fn test_volume_write_is_journalled_at_flush() {
        let (c, _b) = new_set(1, 512, 64);
        let vol = BlockdevVolume::create(Arc::clone(&c), 4096).unwrap();

        let mut w = Bio::write(64, pattern(8 * 512, 1)).with_flags(BioFlags::FUA);
        vol.make_request(&mut w).unwrap();

        let inserted = c.journal.durable_entries().into_iter().any(|e| {
            matches!(
                e.record,
                JournalRecord::KeyInsert { ref key, .. }
                    if key.is_data() && key.k.start().offset == 64 && key.k.p.inode == vol.inode
            )
        });
        assert!(inserted, "flushed journal must contain the insert");
        c.stop();
    }

    #[test]
    fn test_volume_reservation_enospc() {
        let (c, _b) = new_set(1, 64, 32);
        // The volume is larger than the set can hold.
        let vol = BlockdevVolume::create(Arc::clone(&c), 8192).unwrap();
        let mut w = Bio::write(0, vec![0u8; 4096 * 512]);
        let res = vol.make_request(&mut w);
        assert!(matches!(res, Err(cascade::EngineError::NoSpace(_))));
        c.stop();
    }

    #[test]
    fn test_writeback_completes_before_backing_io() {
        let (c, _b) = new_set(1, 512, 128);
        let backing = Arc::new(MemBackend::new(8192, true));
        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writeback,
        );
        dc.set_writeback_running(false);

        let data = pattern(128 * 512, 3);
        let mut w = Bio::write(0, data.clone()).with_flags(BioFlags::SYNC);
        dc.make_request(&mut w).unwrap();

        // Completed with no backing-device IO.
        let mut raw = vec![0u8; 128 * 512];
        backing.read_sectors(0, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0));

        // The extent is in the tree, dirty.
        let k = peek_extent(&c, dc.inode, 0).expect("dirty extent present");
        assert!(!k.is_cached());

        // The allocated bucket accounts all 128 sectors as dirty.
        let ptr = k.v.ptrs[0];
        let dev = c.device(ptr.dev).unwrap();
        assert_eq!(dev.bucket_for_sector(ptr.offset).mark().dirty_sectors, 128);

        // Resume writeback and wait for the copy-out.
        dc.set_writeback_running(true);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let clean = peek_extent(&c, dc.inode, 0).is_some_and(|k| k.is_cached());
            if clean && dc.writeback_keys.is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "writeback did not drain");
            std::thread::sleep(Duration::from_millis(10));
        }

        backing.read_sectors(0, &mut raw).unwrap();
        assert_eq!(raw, data);
        assert_eq!(dev.bucket_for_sector(ptr.offset).mark().dirty_sectors, 0);

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_sequential_bypass_after_cutoff() {
        let (c, _b) = new_set(1, 512, 64);
        let backing = Arc::new(MemBackend::new(16384, true));
        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writethrough,
        );
        dc.set_sequential_cutoff(256 * 1024);

        // 1 MiB of sequential 64 KiB writes.
        for i in 0..16u64 {
            let mut w = Bio::write(i * 128, pattern(128 * 512, i as u8));
            dc.make_request(&mut w).unwrap();
        }

        // The run reaches the cutoff on the fourth chunk: the first
        // 192 KiB land in the cache, the remaining 832 KiB bypass.
        assert!(peek_extent(&c, dc.inode, 0).is_some());
        assert!(peek_extent(&c, dc.inode, 256).is_some_and(|k| k.k.start().offset < 384));
        let tail = peek_extent(&c, dc.inode, 600);
        assert!(
            tail.is_none() || tail.unwrap().k.start().offset >= 2048,
            "bypassed chunks must not be cached"
        );
        assert_eq!(c.stats_snapshot().sectors_bypassed, 13 * 128);

        // Everything is on the backing device regardless.
        let mut raw = vec![0u8; 128 * 512];
        backing.read_sectors(15 * 128, &mut raw).unwrap();
        assert_eq!(raw, pattern(128 * 512, 15));

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_unaligned_write_bypasses_entirely() {
        let (c, _b) = new_set(1, 512, 64);
        let backing = Arc::new(MemBackend::new(8192, true));
        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writethrough,
        );

        // Offset 3 is not aligned to the 8-sector block size.
        let mut w = Bio::write(3, pattern(8 * 512, 9));
        dc.make_request(&mut w).unwrap();

        assert!(peek_extent(&c, dc.inode, 0).is_none(), "no partial cache insertion");
        assert!(c.stats_snapshot().sectors_bypassed >= 8);

        let mut raw = vec![0u8; 8 * 512];
        backing.read_sectors(3, &mut raw).unwrap();
        assert_eq!(raw, pattern(8 * 512, 9));

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_flush_only_bio_touches_no_cache() {
        let (c, _b) = new_set(1, 512, 64);
        let backing = Arc::new(MemBackend::new(8192, true));
        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writeback,
        );

        let seq_before = c.journal.seq();
        let mut f = Bio::flush();
        dc.make_request(&mut f).unwrap();

        assert!(c.journal.flushed_seq() >= seq_before);
        assert!(peek_extent(&c, dc.inode, 0).is_none());

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_read_miss_promotes_then_hits() {
        let (c, _b) = new_set(1, 512, 64);
        let backing = Arc::new(MemBackend::new(8192, true));
        let data = pattern(64 * 512, 21);
        backing.write_sectors(0, &data).unwrap();

        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writethrough,
        );

        let mut r = Bio::read(0, 64);
        dc.make_request(&mut r).unwrap();
        assert_eq!(r.data, data);

        // The miss promoted the range into the cache as a clean copy.
        let k = peek_extent(&c, dc.inode, 0).expect("promoted extent");
        assert!(k.is_cached());

        // Mutate the backing device out of band; a cache hit still sees
        // the promoted bytes.
        backing.write_sectors(0, &pattern(64 * 512, 99)).unwrap();
        let mut again = Bio::read(0, 64);
        dc.make_request(&mut again).unwrap();
        assert_eq!(again.data, data);

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_stale_pointer_read_retries_from_backing() {
        let (c, _b) = new_set(1, 512, 64);
        let backing = Arc::new(MemBackend::new(8192, true));
        let data = pattern(64 * 512, 5);
        backing.write_sectors(0, &data).unwrap();

        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writethrough,
        );

        // Promote, then invalidate the bucket behind the cache's back.
        let mut r = Bio::read(0, 64);
        dc.make_request(&mut r).unwrap();
        let k = peek_extent(&c, dc.inode, 0).expect("promoted extent");
        let ptr = k.v.ptrs[0];
        let dev = c.device(ptr.dev).unwrap();
        dev.bucket_for_sector(ptr.offset).bump_gen();

        let races_before = c.stats_snapshot().cache_read_races;
        backing.write_sectors(0, &pattern(64 * 512, 77)).unwrap();

        let mut again = Bio::read(0, 64);
        dc.make_request(&mut again).unwrap();
        assert_eq!(again.data, pattern(64 * 512, 77), "read must fall back to backing");
        assert_eq!(c.stats_snapshot().cache_read_races, races_before + 1);

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_discard_invalidates_cached_copy() {
        let (c, _b) = new_set(1, 512, 64);
        // Backing without discard support: the discard is dropped there
        // but the cached range must still be invalidated.
        let backing = Arc::new(MemBackend::new(8192, false));
        let old = pattern(64 * 512, 11);
        backing.write_sectors(0, &old).unwrap();

        let dc = CachedDev::attach(
            Arc::clone(&c),
            Arc::clone(&backing) as Arc<dyn cascade::device::BlockBackend>,
            CacheMode::Writethrough,
        );

        let mut r = Bio::read(0, 64);
        dc.make_request(&mut r).unwrap();
        assert!(peek_extent(&c, dc.inode, 0).is_some());

        let newer = pattern(64 * 512, 42);
        backing.write_sectors(0, &newer).unwrap();

        let mut d = Bio::discard(0, 64);
        dc.make_request(&mut d).unwrap();
        assert!(peek_extent(&c, dc.inode, 0).is_none(), "cached copy invalidated");
        // Backing content untouched (device cannot discard).
        let mut raw = vec![0u8; 64 * 512];
        backing.read_sectors(0, &mut raw).unwrap();
        assert_eq!(raw, newer);

        let mut after = Bio::read(0, 64);
        dc.make_request(&mut after).unwrap();
        assert_eq!(after.data, newer);

        dc.detach();
        c.stop();
    }

    #[test]
    fn test_replicated_write_survives_one_device_failure() {
        init_logging();
        let c = CacheSet::open(CacheSetConfig {
            data_replicas: 3,
            required_replicas: 2,
            ..CacheSetConfig::default()
        });
        let mut backends = Vec::new();
        for _ in 0..3 {
            let backend = Arc::new(MemBackend::new(512 * 64, true));
            let cfg = DeviceConfig {
                nbuckets: 512,
                bucket_sectors: 64,
                first_bucket: 1,
                ..DeviceConfig::default()
            };
            c.add_device(cfg, Arc::clone(&backend) as Arc<dyn cascade::device::BlockBackend>)
                .unwrap();
            backends.push(backend);
        }
        c.start().unwrap();

        backends[1].set_fail_writes(true);

        let vol = BlockdevVolume::create(Arc::clone(&c), 4096).unwrap();
        let data = pattern(64 * 512, 33);
        let mut w = Bio::write(0, data.clone());
        vol.make_request(&mut w).unwrap();

        let k = peek_extent(&c, vol.inode, 0).expect("extent committed");
        assert_eq!(k.v.ptrs.len(), 2, "failed replica stripped");
        assert!(k.v.ptrs.iter().all(|p| p.dev != 1));
        assert!(c.device(1).unwrap().io_errors.load(std::sync::atomic::Ordering::Relaxed) >= 1);

        let mut r = Bio::read(0, 64);
        vol.make_request(&mut r).unwrap();
        assert_eq!(r.data, data);

        backends[1].set_fail_writes(false);
        c.stop();
    }

    #[test]
    fn test_replica_shortfall_fails_instead_of_degrading() {
        init_logging();
        let c = CacheSet::open(CacheSetConfig {
            data_replicas: 3,
            required_replicas: 2,
            ..CacheSetConfig::default()
        });
        // Only two devices: three replicas can never be seated.
        for _ in 0..2 {
            let backend = Arc::new(MemBackend::new(512 * 64, true));
            let cfg = DeviceConfig {
                nbuckets: 512,
                bucket_sectors: 64,
                first_bucket: 1,
                ..DeviceConfig::default()
            };
            c.add_device(cfg, backend as Arc<dyn cascade::device::BlockBackend>)
                .unwrap();
        }
        c.start().unwrap();

        let vol = BlockdevVolume::create(Arc::clone(&c), 4096).unwrap();
        let mut w = Bio::write(0, pattern(64 * 512, 50));
        let res = vol.make_request(&mut w);
        assert!(
            matches!(res, Err(cascade::EngineError::NoSpace(_))),
            "under-replicated allocation must fail loudly, got {:?}",
            res
        );
        // Nothing half-written made it into the tree.
        assert!(peek_extent(&c, vol.inode, 0).is_none());
        c.stop();
    }

    #[test]
    fn test_concurrent_writers_disjoint_ranges() {
        let (c, _b) = new_set(1, 1024, 64);
        let vol = BlockdevVolume::create(Arc::clone(&c), 1 << 16).unwrap();

        std::thread::scope(|scope| {
            for t in 0..2u64 {
                let vol = Arc::clone(&vol);
                scope.spawn(move || {
                    for i in 0..32u64 {
                        let sector = (i * 2 + t) * 16;
                        let mut w = Bio::write(sector, pattern(16 * 512, (t * 100 + i) as u8));
                        vol.make_request(&mut w).unwrap();
                    }
                });
            }
        });

        for t in 0..2u64 {
            for i in 0..32u64 {
                let sector = (i * 2 + t) * 16;
                let mut r = Bio::read(sector, 16);
                vol.make_request(&mut r).unwrap();
                assert_eq!(r.data, pattern(16 * 512, (t * 100 + i) as u8));
            }
        }
        c.stop();
    }
}
