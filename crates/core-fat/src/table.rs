//! FAT entry access and chain bookkeeping.
//!
//! The iterator keeps up to two adjacent cache blocks pinned: a FAT12 entry
//! that lands on the last byte of a sector straddles into the next one.
//! Writes go to the active FAT and are mirrored into the others when the
//! volume mirrors its FATs.

use crate::inode::{self, FatInode};
use crate::volume::FatVolume;
use crate::{BAD_FAT_ENTRY, CHAIN_TERMINATOR, END_FAT_ENTRY, FIRST_DATA_CLUSTER};
use core_cache::BlockGuard;
use core_vfs::{FsError, FsResult};
use tracing::{error, info, trace, warn};

pub struct FatTableIterator {
    current_cluster: u32,
    current_sector: u64,
    offset_in_sector: usize,
    block1: Option<BlockGuard>,
    loaded_sector1: Option<u64>,
    block2: Option<BlockGuard>,
    loaded_sector2: Option<u64>,
}

impl FatTableIterator {
    pub fn new(vol: &FatVolume, start_cluster: u32) -> Self {
        let mut iter = Self {
            current_cluster: 0,
            current_sector: 0,
            offset_in_sector: 0,
            block1: None,
            loaded_sector1: None,
            block2: None,
            loaded_sector2: None,
        };
        iter.set_cluster(vol, start_cluster);
        iter
    }

    pub fn current_cluster(&self) -> u32 {
        self.current_cluster
    }

    pub fn set_cluster(&mut self, vol: &FatVolume, cluster: u32) {
        let info = vol.info();
        self.current_cluster = cluster;
        let bit_offset = cluster as u64 * info.fat_bits as u64;
        let byte_offset = bit_offset / 8;
        self.current_sector = info.reserved_sectors as u64
            + info.active_fat as u64 * info.sectors_per_fat as u64
            + byte_offset / info.bytes_per_sector as u64;
        self.offset_in_sector = (byte_offset % info.bytes_per_sector as u64) as usize;
    }

    /// Step to the next cluster's entry, wrapping from the last data
    /// cluster back to the first.
    pub fn increment(&mut self, vol: &FatVolume) {
        let next = self.current_cluster + 1;
        if next == vol.info().total_clusters + FIRST_DATA_CLUSTER {
            self.set_cluster(vol, FIRST_DATA_CLUSTER);
        } else {
            self.set_cluster(vol, next);
        }
    }

    /// Make sure the block(s) covering the current entry are pinned.
    fn update(&mut self, vol: &FatVolume) -> FsResult<()> {
        if self.loaded_sector1 == Some(self.current_sector) {
            // A FAT12 iterator can move between straddling and
            // non-straddling offsets within one sector.
            if self.needs_second_block(vol) && self.loaded_sector2.is_none() {
                self.block2 = Some(vol.cache.get_block(self.current_sector + 1, true)?);
                self.loaded_sector2 = Some(self.current_sector + 1);
            }
            return Ok(());
        }
        if self.loaded_sector2 == Some(self.current_sector) {
            self.block1 = self.block2.take();
            self.loaded_sector1 = self.loaded_sector2.take();
        } else {
            self.block1 = Some(vol.cache.get_block(self.current_sector, true)?);
            self.loaded_sector1 = Some(self.current_sector);
            self.block2 = None;
            self.loaded_sector2 = None;
        }
        if self.needs_second_block(vol) {
            self.block2 = Some(vol.cache.get_block(self.current_sector + 1, true)?);
            self.loaded_sector2 = Some(self.current_sector + 1);
        }
        Ok(())
    }

    fn needs_second_block(&self, vol: &FatVolume) -> bool {
        vol.info().fat_bits == 12
            && self.offset_in_sector == vol.info().bytes_per_sector as usize - 1
    }

    /// Raw entry value with the 12/16-bit end sentinels widened into the
    /// 32-bit space.
    pub fn get_entry(&mut self, vol: &FatVolume) -> FsResult<u32> {
        self.update(vol)?;
        let block1 = self.block1.as_ref().ok_or(FsError::IoError)?;
        let off = self.offset_in_sector;
        match vol.info().fat_bits {
            12 => {
                let lo = block1.with(|data| data[off]);
                let hi = if self.needs_second_block(vol) {
                    self.block2.as_ref().ok_or(FsError::IoError)?.with(|data| data[0])
                } else {
                    block1.with(|data| data[off + 1])
                };
                let mut val = lo as u32 | ((hi as u32) << 8);
                if self.current_cluster & 1 != 0 {
                    val >>= 4;
                } else {
                    val &= 0xfff;
                }
                if val > 0xff0 {
                    val |= 0x0fff_f000;
                }
                Ok(val)
            }
            16 => {
                let val = block1.with(|data| u16::from_le_bytes([data[off], data[off + 1]])) as u32;
                Ok(if val > 0xfff0 { val | 0x0fff_0000 } else { val })
            }
            32 => {
                let val = block1.with(|data| {
                    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
                });
                Ok(val & 0x0fff_ffff)
            }
            bits => {
                error!(target: "fat.table", bits, "unsupported FAT width");
                Err(FsError::IoError)
            }
        }
    }

    pub fn set_entry(&mut self, vol: &FatVolume, value: u32) -> FsResult<()> {
        self.update(vol)?;
        let off = self.offset_in_sector;
        let block1 = self.block1.as_ref().ok_or(FsError::IoError)?;
        match vol.info().fat_bits {
            12 => {
                let odd = self.current_cluster & 1 != 0;
                let packed = if odd { (value & 0xfff) << 4 } else { value & 0xfff };
                let keep_lo: u8 = if odd { 0x0f } else { 0x00 };
                let keep_hi: u8 = if odd { 0x00 } else { 0xf0 };
                block1.with_mut(|data| {
                    data[off] = (data[off] & keep_lo) | (packed & 0xff) as u8;
                });
                if self.needs_second_block(vol) {
                    let block2 = self.block2.as_ref().ok_or(FsError::IoError)?;
                    block2.with_mut(|data| {
                        data[0] = (data[0] & keep_hi) | (packed >> 8) as u8;
                    });
                    block2.mark_dirty();
                    mirror_fat(vol, self.current_sector + 1, &block2.read())?;
                } else {
                    block1.with_mut(|data| {
                        data[off + 1] = (data[off + 1] & keep_hi) | (packed >> 8) as u8;
                    });
                }
                block1.mark_dirty();
                mirror_fat(vol, self.current_sector, &block1.read())?;
                Ok(())
            }
            16 => {
                block1.with_mut(|data| {
                    data[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
                });
                block1.mark_dirty();
                mirror_fat(vol, self.current_sector, &block1.read())?;
                Ok(())
            }
            32 => {
                debug_assert_eq!(value & 0xf000_0000, 0);
                block1.with_mut(|data| {
                    // The top nibble of a FAT32 entry is reserved and must
                    // be preserved.
                    let high = data[off + 3] & 0xf0;
                    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
                    data[off + 3] |= high;
                });
                block1.mark_dirty();
                mirror_fat(vol, self.current_sector, &block1.read())?;
                Ok(())
            }
            bits => {
                error!(target: "fat.table", bits, "unsupported FAT width");
                Err(FsError::IoError)
            }
        }
    }
}

/// Replicate a dirty FAT sector into the non-active FATs.
fn mirror_fat(vol: &FatVolume, sector: u64, buffer: &[u8]) -> FsResult<()> {
    let info = vol.info();
    if !info.fat_mirrored {
        return Ok(());
    }
    let relative = sector - info.active_fat as u64 * info.sectors_per_fat as u64;
    for i in 0..info.fat_count {
        if i == info.active_fat {
            continue;
        }
        vol.cache
            .cached_write(i as u64 * info.sectors_per_fat as u64 + relative, buffer, 1)?;
    }
    Ok(())
}

/// Read one FAT entry with the value canonicalized: 0, a data cluster,
/// `END_FAT_ENTRY` or `BAD_FAT_ENTRY`. Anything else is corruption.
pub fn get_entry(vol: &FatVolume, cluster: u32) -> FsResult<u32> {
    let mut iter = FatTableIterator::new(vol, cluster);
    let value = iter.get_entry(vol)?;
    if value == 0 || vol.is_data_cluster(value) {
        return Ok(value);
    }
    if value >= END_FAT_ENTRY {
        return Ok(END_FAT_ENTRY);
    }
    if value >= BAD_FAT_ENTRY {
        return Ok(BAD_FAT_ENTRY);
    }
    error!(target: "fat.table", value, cluster, "invalid FAT entry");
    Err(FsError::IoError)
}

pub fn set_entry(vol: &FatVolume, cluster: u32, value: u32) -> FsResult<()> {
    let mut iter = FatTableIterator::new(vol, cluster);
    iter.set_entry(vol, value)
}

/// Walk `index` next-pointers from `chain_start`. Fails when the chain
/// runs out early.
pub fn get_chain_entry(vol: &FatVolume, chain_start: u32, index: u32) -> FsResult<u32> {
    trace!(target: "fat.table", chain_start, index, "get_chain_entry");
    let mut cluster = chain_start;
    let mut remaining = index;
    while remaining > 0 {
        remaining -= 1;
        cluster = get_entry(vol, cluster)?;
        if !vol.is_data_cluster(cluster) {
            break;
        }
    }
    if cluster == 0 {
        error!(target: "fat.table", chain_start, index, "chain ended early");
        return Err(FsError::IoError);
    }
    Ok(cluster)
}

/// Number of clusters in the chain starting at `cluster`. Detects cycles by
/// bounding the walk at the volume's cluster count.
pub fn get_chain_length(vol: &FatVolume, cluster: u32) -> FsResult<usize> {
    if !vol.is_data_cluster(cluster) {
        error!(target: "fat.table", cluster, "chain length of invalid cluster");
        return Err(FsError::IoError);
    }
    let mut count = 0usize;
    let mut cluster = cluster;
    while vol.is_data_cluster(cluster) {
        count += 1;
        if count == vol.info().total_clusters as usize {
            error!(target: "fat.table", "circular FAT chain detected");
            return Err(FsError::IoError);
        }
        cluster = get_entry(vol, cluster)?;
    }
    if cluster == END_FAT_ENTRY {
        Ok(count)
    } else {
        error!(target: "fat.table", end = cluster, "chain terminated improperly");
        Err(FsError::IoError)
    }
}

/// Full linear scan of the FAT. O(total clusters).
pub fn count_free_clusters(vol: &FatVolume) -> FsResult<u32> {
    let mut iter = FatTableIterator::new(vol, FIRST_DATA_CLUSTER);
    let mut count = 0;
    for _ in 0..vol.info().total_clusters {
        if iter.get_entry(vol)? == 0 {
            count += 1;
        }
        iter.increment(vol);
    }
    Ok(count)
}

/// Allocate `count` clusters linked into one terminated chain, scanning
/// forward from the last allocation point. A partial allocation is rolled
/// back before the error is returned.
pub fn allocate_clusters(vol: &FatVolume, count: usize) -> FsResult<u32> {
    info!(target: "fat.table", count, "allocate_clusters");
    let start = {
        let state = vol.state.lock().unwrap();
        if vol.is_data_cluster(state.last_allocated_cluster) {
            state.last_allocated_cluster
        } else {
            FIRST_DATA_CLUSTER
        }
    };

    let mut first = 0u32;
    let mut last = 0u32;
    let mut found = 0usize;

    let result = (|| -> FsResult<()> {
        let mut iter = FatTableIterator::new(vol, start);
        for _ in 0..vol.info().total_clusters {
            if iter.get_entry(vol)? == 0 {
                iter.set_entry(vol, CHAIN_TERMINATOR)?;
                vol.state.lock().unwrap().free_clusters -= 1;
                let cluster = iter.current_cluster();
                if found == 0 {
                    first = cluster;
                } else {
                    set_entry(vol, last, cluster)?;
                }
                last = cluster;
                vol.state.lock().unwrap().last_allocated_cluster = cluster;
                found += 1;
                if found == count {
                    break;
                }
            }
            iter.increment(vol);
        }
        Ok(())
    })();

    if let Err(err) = result {
        if first != 0 {
            let _ = clear_fat_chain(vol, first);
        }
        return Err(err);
    }
    vol.update_fs_info()?;
    if found != count {
        warn!(target: "fat.table", requested = count, found, "allocation failed, not enough free clusters");
        if first != 0 {
            clear_fat_chain(vol, first)?;
        }
        return Err(FsError::NoSpace);
    }
    Ok(first)
}

/// Zero every entry of the chain starting at `cluster`, returning the
/// clusters to the free pool.
pub fn clear_fat_chain(vol: &FatVolume, cluster: u32) -> FsResult<()> {
    if !vol.is_data_cluster(cluster) {
        error!(target: "fat.table", cluster, "clear_fat_chain on invalid cluster");
        return Err(FsError::IoError);
    }
    info!(target: "fat.table", cluster, "clearing fat chain");
    let mut cluster = cluster;
    while vol.is_data_cluster(cluster) {
        let next = get_entry(vol, cluster)?;
        set_entry(vol, cluster, 0)?;
        vol.state.lock().unwrap().free_clusters += 1;
        cluster = next;
    }
    if cluster != END_FAT_ENTRY {
        error!(target: "fat.table", end = cluster, "chain terminated improperly while clearing");
    }
    vol.update_fs_info()?;
    Ok(())
}

/// Resize `node`'s chain to exactly `clusters` clusters, keeping the inode
/// and (optionally) the ID-map rebinding in step with the on-disk state.
pub fn set_chain_length(
    vol: &FatVolume,
    node: &mut FatInode,
    clusters: u32,
    update_id_map: bool,
) -> FsResult<()> {
    info!(
        target: "fat.table",
        inode = format_args!("{:#x}", node.inode_id),
        clusters,
        start = node.start_cluster,
        "set_chain_length"
    );
    if crate::is_fixed_root(node.start_cluster)
        || (node.start_cluster != 0 && !vol.is_data_cluster(node.start_cluster))
    {
        error!(target: "fat.table", cluster = node.start_cluster, "set_chain_length on invalid cluster");
        return Err(FsError::IoError);
    }

    let dir_cluster = inode::cluster_of(node.parent_inode_id);

    if clusters == 0 {
        if node.start_cluster == 0 {
            return Ok(());
        }
        let chain = node.start_cluster;
        node.start_cluster = 0;
        node.end_cluster = 0;
        clear_fat_chain(vol, chain)?;
        if update_id_map {
            vol.set_inode_location(
                node.inode_id,
                inode::dir_index_id(dir_cluster, node.dir_start_index.unwrap_or(0)),
            );
        }
        node.flush_to_disk(vol)?;
        return Ok(());
    }

    if node.start_cluster == 0 {
        let chain = allocate_clusters(vol, clusters as usize)?;
        node.start_cluster = chain;
        node.end_cluster = get_chain_entry(vol, chain, clusters - 1)?;
        if update_id_map {
            vol.set_inode_location(
                node.inode_id,
                inode::dir_cluster_id(dir_cluster, node.start_cluster),
            );
        }
        node.flush_to_disk(vol)?;
        return Ok(());
    }

    let bytes_per_cluster = vol.bytes_per_cluster() as u64;
    let current = ((node.size + bytes_per_cluster - 1) / bytes_per_cluster) as u32;
    if current == clusters {
        return Ok(());
    }

    if clusters > current {
        let grown = allocate_clusters(vol, (clusters - current) as usize)?;
        let prev_end = node.end_cluster;
        node.end_cluster = get_chain_entry(vol, grown, clusters - current - 1)?;
        set_entry(vol, prev_end, grown)?;
        return Ok(());
    }

    // Shrink: walk to the new final cluster, terminate there, free the
    // tail.
    let mut cluster = node.start_cluster;
    let mut tail = get_entry(vol, cluster)?;
    for _ in 1..clusters {
        if !vol.is_data_cluster(tail) {
            break;
        }
        cluster = tail;
        tail = get_entry(vol, cluster)?;
    }
    if tail == END_FAT_ENTRY {
        // Chain was already the requested length.
        node.end_cluster = cluster;
        return Ok(());
    }
    if !vol.is_data_cluster(tail) {
        return Err(FsError::IoError);
    }
    set_entry(vol, cluster, END_FAT_ENTRY)?;
    node.end_cluster = cluster;
    clear_fat_chain(vol, tail)?;
    Ok(())
}

/// Log the chain starting at `cluster`, for device_control diagnostics.
pub fn dump_chain(vol: &FatVolume, cluster: u32) {
    let mut cluster = cluster;
    info!(target: "fat.table", start = cluster, "FAT chain");
    while vol.is_data_cluster(cluster) {
        match get_entry(vol, cluster) {
            Ok(next) => {
                info!(target: "fat.table", cluster, next, "chain link");
                cluster = next;
            }
            Err(_) => break,
        }
    }
}
