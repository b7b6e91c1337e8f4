//! Cluster/sector cursor over a file or directory chain.
//!
//! Positions are (cluster, sector-within-cluster) pairs. The FAT12/16 fixed
//! root directory is addressed through the `FIXED_ROOT_CLUSTER` sentinel
//! and spans plain sectors outside the cluster area.

use crate::volume::FatVolume;
use crate::{table, FIRST_DATA_CLUSTER};
use core_cache::BlockGuard;
use core_vfs::{FsError, FsResult};

#[derive(Debug)]
pub struct ClusterSectorIterator {
    pub current_cluster: u32,
    /// Sector within the current cluster. `None` once the cursor has walked
    /// off the end of the chain.
    current_sector: Option<u32>,
}

fn is_valid_position(vol: &FatVolume, cluster: u32, sector: u32) -> bool {
    if vol.info().fat_bits != 32 && crate::is_fixed_root(cluster) {
        return sector < vol.info().root_sector_count;
    }
    sector < vol.info().sectors_per_cluster && vol.is_data_cluster(cluster)
}

impl ClusterSectorIterator {
    pub fn new(vol: &FatVolume, cluster: u32, sector: u32) -> FsResult<Self> {
        if !is_valid_position(vol, cluster, sector) {
            return Err(FsError::IoError);
        }
        Ok(Self {
            current_cluster: cluster,
            current_sector: Some(sector),
        })
    }

    pub fn set(&mut self, vol: &FatVolume, cluster: u32, sector: u32) -> FsResult<()> {
        if !is_valid_position(vol, cluster, sector) {
            return Err(FsError::IoError);
        }
        self.current_cluster = cluster;
        self.current_sector = Some(sector);
        Ok(())
    }

    /// Absolute device sector for the current position.
    fn device_sector(&self, vol: &FatVolume) -> FsResult<u64> {
        let sector = self.current_sector.ok_or(FsError::IoError)?;
        if crate::is_fixed_root(self.current_cluster) {
            return Ok(vol.info().root_start as u64 + sector as u64);
        }
        Ok(vol.info().first_data_sector as u64
            + (self.current_cluster - FIRST_DATA_CLUSTER) as u64
                * vol.info().sectors_per_cluster as u64
            + sector as u64)
    }

    /// Advance by `sectors`, following the FAT chain across cluster
    /// boundaries. Walking past the end of the chain invalidates the cursor
    /// and reports `IoError`.
    pub fn advance(&mut self, vol: &FatVolume, sectors: u32) -> FsResult<()> {
        let Some(current) = self.current_sector else {
            return Err(FsError::IoError);
        };
        if sectors == 0 {
            return Ok(());
        }
        let target = current + sectors;
        if crate::is_fixed_root(self.current_cluster) {
            if target < vol.info().root_sector_count {
                self.current_sector = Some(target);
                return Ok(());
            }
        } else {
            let per_cluster = vol.info().sectors_per_cluster;
            if target < per_cluster {
                self.current_sector = Some(target);
                return Ok(());
            }
            let next = table::get_chain_entry(vol, self.current_cluster, target / per_cluster)?;
            if vol.is_data_cluster(next) {
                self.current_cluster = next;
                self.current_sector = Some(target % per_cluster);
                return Ok(());
            }
        }
        self.current_sector = None;
        Err(FsError::IoError)
    }

    /// Pin the cache block for the current sector.
    pub fn get_block(&self, vol: &FatVolume, do_load: bool) -> FsResult<BlockGuard> {
        let sector = self.device_sector(vol)?;
        vol.cache.get_block(sector, do_load)
    }

    pub fn mark_block_dirty(&self, vol: &FatVolume) -> FsResult<()> {
        let sector = self.device_sector(vol)?;
        vol.cache.mark_block_dirty(sector)
    }

    pub fn read_block(&self, vol: &FatVolume, buffer: &mut [u8]) -> FsResult<()> {
        let sector = self.device_sector(vol)?;
        vol.cache.cached_read(sector, buffer, 1)
    }

    pub fn write_block(&self, vol: &FatVolume, buffer: &[u8]) -> FsResult<()> {
        let sector = self.device_sector(vol)?;
        vol.cache.cached_write(sector, buffer, 1)
    }

    /// Whether the cursor still points at a real sector.
    pub fn is_valid(&self) -> bool {
        self.current_sector.is_some()
    }
}
