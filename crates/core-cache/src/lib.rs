//! Write-through sector cache between the filesystem drivers and the block
//! device.
//!
//! A fixed pool of buffers holds one sector each. Lookup goes through a
//! sector map; reuse follows MRU order. Blocks handed out are pinned by a
//! use count and unpinned when the guard drops.
//!
//! Invariants:
//! * At most one in-memory copy of any sector.
//! * A block that is mid-flush is never evicted or handed back to the free
//!   pool.
//! * Eviction requires `use_count == 0` and a clean buffer.
//! * `dirty_count` equals the number of blocks with the DIRTY flag.
//!
//! A background flusher thread writes dirty blocks back once their count
//! crosses the watermark, so bursts of metadata writes do not stall the
//! filesystem thread.

use ahash::AHashMap;
use bitflags::bitflags;
use core_vfs::{BlockDevice, FsError, FsResult};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Size of one pooled buffer. Large enough for every supported FAT sector
/// size (512, 1024 and 2048 bytes).
pub const BUFFER_BLOCK_SIZE: usize = 2048;
pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = BUFFER_BLOCK_SIZE;

/// Transfers of at least this many sectors bypass the pooled buffers and go
/// straight to the device.
pub const BYPASS_SECTOR_COUNT: usize = 8;

const DEFAULT_POOL_BLOCKS: usize = 128;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BlockFlags: u32 {
        const DIRTY       = 0x01;
        const IS_FLUSHING = 0x02;
    }
}

struct CacheBlock {
    sector: u64,
    use_count: u32,
    flags: BlockFlags,
    buffer: Vec<u8>,
}

struct CacheState {
    blocks: Vec<CacheBlock>,
    map: AHashMap<u64, usize>,
    /// Front is most recently used; only indexes present in `map` appear.
    mru: VecDeque<usize>,
    free: Vec<usize>,
    dirty_count: usize,
    shutdown: bool,
}

struct CacheShared {
    state: Mutex<CacheState>,
    cond: Condvar,
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    block_count: u64,
    flush_watermark: usize,
}

pub struct BlockCache {
    shared: Arc<CacheShared>,
    flusher: Option<JoinHandle<()>>,
}

/// Pinned reference to one cached sector. Dropping it releases the pin.
pub struct BlockGuard {
    shared: Arc<CacheShared>,
    index: usize,
    sector: u64,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, block_count: u64, block_size: usize) -> FsResult<Self> {
        Self::with_pool(device, block_count, block_size, DEFAULT_POOL_BLOCKS)
    }

    pub fn with_pool(
        device: Arc<dyn BlockDevice>,
        block_count: u64,
        block_size: usize,
        pool_blocks: usize,
    ) -> FsResult<Self> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || pool_blocks == 0 {
            return Err(FsError::InvalidArg);
        }
        let blocks = (0..pool_blocks)
            .map(|_| CacheBlock {
                sector: 0,
                use_count: 0,
                flags: BlockFlags::empty(),
                buffer: vec![0; block_size],
            })
            .collect();
        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                blocks,
                map: AHashMap::new(),
                mru: VecDeque::new(),
                free: (0..pool_blocks).rev().collect(),
                dirty_count: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            device,
            block_size,
            block_count,
            flush_watermark: pool_blocks / 2,
        });
        let flusher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("cache-flusher".into())
                .spawn(move || flusher_main(&shared))
                .map_err(|_| FsError::IoError)?
        };
        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.shared.block_count
    }

    /// Pin the buffer for `sector`, loading it from the device unless
    /// `do_load` is false (callers about to overwrite the whole sector).
    pub fn get_block(&self, sector: u64, do_load: bool) -> FsResult<BlockGuard> {
        if sector >= self.shared.block_count {
            return Err(FsError::InvalidArg);
        }
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();

        if let Some(&index) = state.map.get(&sector) {
            state.blocks[index].use_count += 1;
            relink_front(&mut state.mru, index);
            drop(state);
            trace!(target: "cache", sector, "hit");
            return Ok(BlockGuard {
                shared: Arc::clone(shared),
                index,
                sector,
            });
        }

        let index = loop {
            if let Some(index) = state.free.pop() {
                break index;
            }
            if let Some(index) = find_eviction_candidate(&state) {
                let old_sector = state.blocks[index].sector;
                state.map.remove(&old_sector);
                remove_from_mru(&mut state.mru, index);
                trace!(target: "cache", evicted = old_sector, "evict clean block");
                break index;
            }
            // Everything is pinned, dirty or mid-flush. Flush one dirty
            // block inline when nothing else will make progress for us.
            if state.blocks.iter().any(|b| b.flags.contains(BlockFlags::IS_FLUSHING)) {
                state = shared.cond.wait(state).unwrap();
                continue;
            }
            let Some(index) = state
                .mru
                .iter()
                .rev()
                .copied()
                .find(|&i| state.blocks[i].use_count == 0 && state.blocks[i].flags.contains(BlockFlags::DIRTY))
            else {
                // All blocks pinned: genuine pool exhaustion.
                return Err(FsError::NoSpace);
            };
            let (reacquired, result) = flush_one(shared, state, index);
            state = reacquired;
            result?;
        };

        if do_load {
            let offset = sector * shared.block_size as u64;
            // Drop the lock for the device read; the block is not yet
            // published in the map so nobody can observe it half-loaded.
            drop(state);
            let mut buffer = vec![0; shared.block_size];
            let read = shared
                .device
                .read_at(offset, &mut buffer)
                .map_err(FsError::from)?;
            if read != shared.block_size {
                error!(target: "cache", sector, read, "short read");
                let mut state = shared.state.lock().unwrap();
                state.free.push(index);
                return Err(FsError::IoError);
            }
            state = shared.state.lock().unwrap();
            state.blocks[index].buffer.copy_from_slice(&buffer);
        } else {
            state.blocks[index].buffer.fill(0);
        }

        let block = &mut state.blocks[index];
        block.sector = sector;
        block.use_count = 1;
        block.flags = BlockFlags::empty();
        state.map.insert(sector, index);
        state.mru.push_front(index);
        Ok(BlockGuard {
            shared: Arc::clone(shared),
            index,
            sector,
        })
    }

    /// Flag a cached sector dirty. Fails with `NoEntry` when the sector is
    /// not resident.
    pub fn mark_block_dirty(&self, sector: u64) -> FsResult<()> {
        let mut state = self.shared.state.lock().unwrap();
        let Some(&index) = state.map.get(&sector) else {
            return Err(FsError::NoEntry);
        };
        mark_dirty_locked(&self.shared, &mut state, index);
        Ok(())
    }

    /// Copy `count` sectors starting at `sector` into `buffer`. Transfers of
    /// `BYPASS_SECTOR_COUNT` sectors or more go straight to the device after
    /// any overlapping dirty blocks have been written back.
    pub fn cached_read(&self, sector: u64, buffer: &mut [u8], count: usize) -> FsResult<()> {
        let bs = self.shared.block_size;
        assert!(buffer.len() >= count * bs);
        if sector + count as u64 > self.shared.block_count {
            return Err(FsError::InvalidArg);
        }
        if count >= BYPASS_SECTOR_COUNT {
            self.flush_range(sector, count)?;
            let read = self
                .shared
                .device
                .read_at(sector * bs as u64, &mut buffer[..count * bs])
                .map_err(FsError::from)?;
            if read != count * bs {
                return Err(FsError::IoError);
            }
            return Ok(());
        }
        for i in 0..count {
            let guard = self.get_block(sector + i as u64, true)?;
            guard.with(|data| buffer[i * bs..(i + 1) * bs].copy_from_slice(data));
        }
        Ok(())
    }

    /// Copy `count` sectors from `buffer` to the cache (and through it, the
    /// device). Large transfers write the device directly and refresh any
    /// resident copies so the single-copy invariant holds.
    pub fn cached_write(&self, sector: u64, buffer: &[u8], count: usize) -> FsResult<()> {
        let bs = self.shared.block_size;
        assert!(buffer.len() >= count * bs);
        if sector + count as u64 > self.shared.block_count {
            return Err(FsError::InvalidArg);
        }
        if count >= BYPASS_SECTOR_COUNT {
            let written = self
                .shared
                .device
                .write_at(sector * bs as u64, &buffer[..count * bs])
                .map_err(FsError::from)?;
            if written != count * bs {
                return Err(FsError::IoError);
            }
            let mut state = self.shared.state.lock().unwrap();
            for i in 0..count {
                let s = sector + i as u64;
                if let Some(&index) = state.map.get(&s) {
                    let was_dirty = state.blocks[index].flags.contains(BlockFlags::DIRTY);
                    state.blocks[index]
                        .buffer
                        .copy_from_slice(&buffer[i * bs..(i + 1) * bs]);
                    if was_dirty {
                        state.blocks[index].flags.remove(BlockFlags::DIRTY);
                        state.dirty_count -= 1;
                    }
                }
            }
            return Ok(());
        }
        for i in 0..count {
            let guard = self.get_block(sector + i as u64, false)?;
            guard.with_mut(|data| data.copy_from_slice(&buffer[i * bs..(i + 1) * bs]));
            guard.mark_dirty();
        }
        Ok(())
    }

    /// Write every dirty block back to the device.
    pub fn flush(&self) -> FsResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        loop {
            let Some(index) = state
                .blocks
                .iter()
                .position(|b| b.flags.contains(BlockFlags::DIRTY) && !b.flags.contains(BlockFlags::IS_FLUSHING))
            else {
                break;
            };
            let (reacquired, result) = flush_one(shared, state, index);
            state = reacquired;
            result?;
        }
        // Wait out flushes started by the background thread.
        while state.blocks.iter().any(|b| b.flags.contains(BlockFlags::IS_FLUSHING)) {
            state = shared.cond.wait(state).unwrap();
        }
        Ok(())
    }

    pub fn dirty_block_count(&self) -> usize {
        self.shared.state.lock().unwrap().dirty_count
    }

    fn flush_range(&self, sector: u64, count: usize) -> FsResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        loop {
            let candidate = (0..count).find_map(|i| {
                let s = sector + i as u64;
                state.map.get(&s).copied().filter(|&index| {
                    state.blocks[index].flags.contains(BlockFlags::DIRTY)
                        && !state.blocks[index].flags.contains(BlockFlags::IS_FLUSHING)
                })
            });
            match candidate {
                Some(index) => {
                    let (reacquired, result) = flush_one(shared, state, index);
                    state = reacquired;
                    result?;
                }
                None => break,
            }
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(target: "cache", ?err, "flush on shutdown failed");
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

impl BlockGuard {
    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.shared.state.lock().unwrap();
        f(&state.blocks[self.index].buffer)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.shared.state.lock().unwrap();
        f(&mut state.blocks[self.index].buffer)
    }

    /// Copy of the whole sector.
    pub fn read(&self) -> Vec<u8> {
        self.with(|data| data.to_vec())
    }

    pub fn mark_dirty(&self) {
        let mut state = self.shared.state.lock().unwrap();
        mark_dirty_locked(&self.shared, &mut state, self.index);
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        let block = &mut state.blocks[self.index];
        debug_assert!(block.use_count > 0);
        block.use_count -= 1;
    }
}

fn relink_front(mru: &mut VecDeque<usize>, index: usize) {
    remove_from_mru(mru, index);
    mru.push_front(index);
}

fn remove_from_mru(mru: &mut VecDeque<usize>, index: usize) {
    if let Some(pos) = mru.iter().position(|&i| i == index) {
        mru.remove(pos);
    }
}

fn find_eviction_candidate(state: &CacheState) -> Option<usize> {
    state
        .mru
        .iter()
        .rev()
        .copied()
        .find(|&i| state.blocks[i].use_count == 0 && state.blocks[i].flags.is_empty())
}

fn mark_dirty_locked(shared: &CacheShared, state: &mut CacheState, index: usize) {
    if !state.blocks[index].flags.contains(BlockFlags::DIRTY) {
        state.blocks[index].flags.insert(BlockFlags::DIRTY);
        state.dirty_count += 1;
        if state.dirty_count > shared.flush_watermark {
            shared.cond.notify_all();
        }
    }
}

/// Write one dirty block, releasing the state lock for the device IO. The
/// IS_FLUSHING flag keeps the block pinned while the lock is dropped.
/// Returns the reacquired lock together with the IO outcome.
fn flush_one<'a>(
    shared: &'a CacheShared,
    mut state: std::sync::MutexGuard<'a, CacheState>,
    index: usize,
) -> (std::sync::MutexGuard<'a, CacheState>, FsResult<()>) {
    let sector = state.blocks[index].sector;
    let data = state.blocks[index].buffer.clone();
    state.blocks[index].flags.insert(BlockFlags::IS_FLUSHING);
    drop(state);

    let result = shared
        .device
        .write_at(sector * shared.block_size as u64, &data);

    let mut state = shared.state.lock().unwrap();
    let block = &mut state.blocks[index];
    block.flags.remove(BlockFlags::IS_FLUSHING);
    let outcome = match result {
        Ok(written) if written == shared.block_size => {
            if block.flags.contains(BlockFlags::DIRTY) {
                block.flags.remove(BlockFlags::DIRTY);
                state.dirty_count -= 1;
            }
            trace!(target: "cache", sector, "flushed");
            Ok(())
        }
        Ok(written) => {
            error!(target: "cache", sector, written, "short write");
            Err(FsError::IoError)
        }
        Err(err) => {
            error!(target: "cache", sector, ?err, "write failed");
            Err(FsError::IoError)
        }
    };
    shared.cond.notify_all();
    (state, outcome)
}

fn flusher_main(shared: &CacheShared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        while !state.shutdown && state.dirty_count <= shared.flush_watermark {
            state = shared.cond.wait(state).unwrap();
        }
        if state.shutdown {
            return;
        }
        debug!(target: "cache", dirty = state.dirty_count, "background flush");
        loop {
            let Some(index) = state
                .blocks
                .iter()
                .position(|b| b.flags.contains(BlockFlags::DIRTY) && !b.flags.contains(BlockFlags::IS_FLUSHING))
            else {
                break;
            };
            let (reacquired, result) = flush_one(shared, state, index);
            state = reacquired;
            if result.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_vfs::MemDevice;

    fn cache(pool: usize) -> (Arc<MemDevice>, BlockCache) {
        let dev = Arc::new(MemDevice::new(512, 64));
        let cache =
            BlockCache::with_pool(Arc::clone(&dev) as Arc<dyn BlockDevice>, 64, 512, pool).unwrap();
        (dev, cache)
    }

    #[test]
    fn dirty_blocks_reach_device_after_flush() {
        let (dev, cache) = cache(8);
        {
            let guard = cache.get_block(3, true).unwrap();
            guard.with_mut(|data| data[0..4].copy_from_slice(b"pada"));
            guard.mark_dirty();
        }
        assert_eq!(cache.dirty_block_count(), 1);
        cache.flush().unwrap();
        assert_eq!(cache.dirty_block_count(), 0);
        let mut buf = [0u8; 4];
        dev.read_at(3 * 512, &mut buf).unwrap();
        assert_eq!(&buf, b"pada");
    }

    #[test]
    fn single_copy_per_sector() {
        let (_dev, cache) = cache(8);
        let a = cache.get_block(5, true).unwrap();
        a.with_mut(|data| data[0] = 0xaa);
        let b = cache.get_block(5, true).unwrap();
        b.with(|data| assert_eq!(data[0], 0xaa));
    }

    #[test]
    fn eviction_prefers_clean_lru() {
        let (dev, cache) = cache(2);
        dev.write_at(0, &[1; 512]).unwrap();
        dev.write_at(512, &[2; 512]).unwrap();
        dev.write_at(1024, &[3; 512]).unwrap();
        cache.get_block(0, true).unwrap();
        cache.get_block(1, true).unwrap();
        // Pool is full of clean unpinned blocks; next get evicts the LRU.
        let c = cache.get_block(2, true).unwrap();
        c.with(|data| assert_eq!(data[0], 3));
    }

    #[test]
    fn pool_exhaustion_with_pins_is_reported() {
        let (_dev, cache) = cache(2);
        let _a = cache.get_block(0, true).unwrap();
        let _b = cache.get_block(1, true).unwrap();
        assert!(matches!(cache.get_block(2, true), Err(FsError::NoSpace)));
    }

    #[test]
    fn dirty_block_is_not_evicted_silently() {
        let (dev, cache) = cache(2);
        for sector in 0..2u64 {
            let guard = cache.get_block(sector, true).unwrap();
            guard.with_mut(|data| data[0] = 0x5a + sector as u8);
            guard.mark_dirty();
        }
        // Every buffer is dirty; making room must write one out, not drop
        // it.
        cache.get_block(2, true).unwrap();
        let mut buf = [0u8; 1];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x5a);
    }

    #[test]
    fn cached_read_and_write_small_transfers() {
        let (_dev, cache) = cache(8);
        let payload = vec![0x42u8; 1024];
        cache.cached_write(4, &payload, 2).unwrap();
        let mut out = vec![0u8; 1024];
        cache.cached_read(4, &mut out, 2).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn large_write_bypasses_but_stays_coherent() {
        let (dev, cache) = cache(16);
        // Make sector 10 resident and dirty first.
        {
            let guard = cache.get_block(10, true).unwrap();
            guard.with_mut(|data| data[0] = 0x11);
            guard.mark_dirty();
        }
        let payload = vec![0x77u8; BYPASS_SECTOR_COUNT * 512];
        cache.cached_write(8, &payload, BYPASS_SECTOR_COUNT).unwrap();
        // The resident copy was refreshed and is no longer dirty.
        assert_eq!(cache.dirty_block_count(), 0);
        let guard = cache.get_block(10, true).unwrap();
        guard.with(|data| assert_eq!(data[0], 0x77));
        let mut buf = [0u8; 1];
        dev.read_at(10 * 512, &mut buf).unwrap();
        assert_eq!(buf[0], 0x77);
    }

    #[test]
    fn large_read_sees_dirty_data() {
        let (_dev, cache) = cache(16);
        {
            let guard = cache.get_block(8, true).unwrap();
            guard.with_mut(|data| data[0] = 0x99);
            guard.mark_dirty();
        }
        let mut out = vec![0u8; BYPASS_SECTOR_COUNT * 512];
        cache.cached_read(8, &mut out, BYPASS_SECTOR_COUNT).unwrap();
        assert_eq!(out[0], 0x99);
    }
}
