//! Per-mount volume state.
//!
//! Lock order, outermost first: the per-volume operation lock, then the
//! inode-ID map lock, then the block-cache mutex. Nothing ever takes them
//! in the opposite direction.

use crate::inode::{self, DosAttribs, FatInode};
use crate::super_block::{self, SuperBlockInfo};
use crate::{dir_iter, table, FIRST_DATA_CLUSTER};
use ahash::AHashMap;
use core_cache::BlockCache;
use core_vfs::{BlockDevice, FsError, FsResult, InodeId, VolumeFlags};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{error, info, warn};

/// Where the volume label lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelLocation {
    /// No label anywhere.
    None,
    /// In the BPB's extended boot record.
    Bpb,
    /// A volume-attribute entry at this index in the root directory.
    RootIndex(u32),
}

#[derive(Debug)]
pub struct VolumeState {
    pub free_clusters: u32,
    pub last_allocated_cluster: u32,
    pub volume_label: [u8; 11],
    pub label_location: LabelLocation,
}

#[derive(Debug, Default)]
pub struct InodeMaps {
    inode_to_location: AHashMap<InodeId, InodeId>,
    location_to_inode: AHashMap<InodeId, InodeId>,
    /// Directory start cluster -> inode ID of that directory.
    directory_map: AHashMap<u32, InodeId>,
    current_artificial_id: InodeId,
}

pub struct FatVolume {
    pub(crate) cache: BlockCache,
    pub(crate) device_path: String,
    pub(crate) flags: VolumeFlags,
    pub(crate) info: SuperBlockInfo,
    /// Serializes every VFS operation against this volume. Internal helpers
    /// never take it; only the public entry points do.
    pub(crate) op_lock: Mutex<()>,
    pub(crate) state: Mutex<VolumeState>,
    pub(crate) maps: RwLock<InodeMaps>,
    /// Live inodes by ID, so every open path to one file shares state.
    inode_cache: Mutex<AHashMap<InodeId, Weak<Mutex<FatInode>>>>,
    root_inode: Arc<Mutex<FatInode>>,
}

impl FatVolume {
    /// Bring up a volume whose superblock has already been validated by the
    /// caller's probe of sector zero. Performs the FAT sanity checks, seeds
    /// the free-cluster accounting and locates the volume label.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        device_path: &str,
        flags: VolumeFlags,
        info: SuperBlockInfo,
    ) -> FsResult<Arc<FatVolume>> {
        let cache = BlockCache::new(
            Arc::clone(&device),
            info.total_sectors as u64,
            info.bytes_per_sector as usize,
        )?;

        let root_inode = Arc::new(Mutex::new(FatInode {
            inode_id: inode::dir_cluster_id(info.root_cluster, info.root_cluster),
            parent_inode_id: inode::dir_cluster_id(info.root_cluster, info.root_cluster),
            dir_start_index: None,
            dir_end_index: None,
            start_cluster: info.root_cluster,
            end_cluster: info.root_cluster,
            size: info.root_sector_count as u64 * info.bytes_per_sector as u64,
            time: 0,
            dos_attribs: DosAttribs::SUBDIR,
            iteration: 0,
            deleted: false,
        }));

        let volume = FatVolume {
            cache,
            device_path: device_path.to_owned(),
            flags,
            state: Mutex::new(VolumeState {
                free_clusters: 0,
                last_allocated_cluster: FIRST_DATA_CLUSTER,
                volume_label: *b"           ",
                label_location: LabelLocation::None,
            }),
            maps: RwLock::new(InodeMaps {
                current_artificial_id: inode::ARTIFICIAL_ID_BITS,
                ..InodeMaps::default()
            }),
            inode_cache: Mutex::new(AHashMap::new()),
            root_inode,
            op_lock: Mutex::new(()),
            info,
        };

        volume.check_fat_media_bytes()?;

        if let Some(label) = volume.info.bpb_volume_label {
            let mut state = volume.state.lock().unwrap();
            state.volume_label = label;
            state.label_location = LabelLocation::Bpb;
        }

        // Seed the free-cluster accounting: from the FS-info sector when it
        // is present and intact, by scanning the FAT otherwise. Read-only
        // mounts skip the scan; nothing will consume the numbers.
        if !volume.flags.contains(VolumeFlags::READ_ONLY) {
            let mut seeded = false;
            if let Some(fs_info_sector) = volume.info.fs_info_sector {
                let guard = volume.cache.get_block(fs_info_sector as u64, true)?;
                match guard.with(|data| super_block::parse_fs_info(data)) {
                    Some(fs_info) => {
                        let mut state = volume.state.lock().unwrap();
                        state.free_clusters = fs_info.free_clusters;
                        state.last_allocated_cluster = fs_info.last_allocated_cluster;
                        seeded = true;
                    }
                    None => {
                        error!(target: "fat", sector = fs_info_sector, "fsinfo sector has invalid magic");
                    }
                }
            }
            if !seeded {
                let free = table::count_free_clusters(&volume)?;
                volume.state.lock().unwrap().free_clusters = free;
            }
        }

        if volume.info.fat_bits == 32 {
            // The root chain length is only discoverable once the cache is
            // up; fix up the placeholder size.
            let root_start = volume.root_inode.lock().unwrap().start_cluster;
            let chain_len = table::get_chain_length(&volume, root_start)?;
            let bytes = chain_len as u64 * volume.bytes_per_cluster() as u64;
            let end = table::get_chain_entry(&volume, root_start, chain_len as u32 - 1)?;
            let mut root = volume.root_inode.lock().unwrap();
            root.size = bytes;
            root.end_cluster = end;
        }

        {
            let root_id = volume.root_inode.lock().unwrap().inode_id;
            volume.add_directory_mapping(root_id);
        }

        volume.scan_root_for_label()?;

        {
            let state = volume.state.lock().unwrap();
            info!(
                target: "fat",
                device = device_path,
                fat_bits = volume.info.fat_bits,
                total_clusters = volume.info.total_clusters,
                free_clusters = state.free_clusters,
                label = %String::from_utf8_lossy(&state.volume_label),
                "mounted"
            );
        }
        Ok(Arc::new(volume))
    }

    /// The media descriptor in each FAT must match the BPB's. Content
    /// mismatch between mirrored FATs is tolerated with a warning; a
    /// corrupted mirror should not block mounting.
    fn check_fat_media_bytes(&self) -> FsResult<()> {
        let active_first = self.info.reserved_sectors + self.info.active_fat * self.info.sectors_per_fat;
        let active = self.cache.get_block(active_first as u64, true)?.read();
        if active[0] != self.info.media_descriptor {
            error!(
                target: "fat",
                fat_byte = active[0],
                bpb_byte = self.info.media_descriptor,
                "media descriptor mismatch"
            );
            return Err(FsError::IoError);
        }
        if self.info.fat_mirrored {
            for i in 0..self.info.fat_count {
                if i == self.info.active_fat {
                    continue;
                }
                let sector = self.info.reserved_sectors + i * self.info.sectors_per_fat;
                let mirror = self.cache.get_block(sector as u64, true)?.read();
                if mirror[0] != self.info.media_descriptor {
                    error!(target: "fat", fat = i, "media descriptor mismatch in mirror");
                    return Err(FsError::IoError);
                }
                if mirror != active {
                    warn!(target: "fat", fat = i, "mirror FAT differs from active FAT");
                }
            }
        }
        Ok(())
    }

    /// A root-directory volume entry supersedes any label in the BPB.
    fn scan_root_for_label(&self) -> FsResult<()> {
        let root_cluster = self.root_inode.lock().unwrap().start_cluster;
        let mut iter = dir_iter::DirectoryIterator::new(self, root_cluster, 0)?;
        while let Some(entry) = iter.current_raw()? {
            let attribs = entry[11];
            if attribs & DosAttribs::VOLUME.bits() != 0 && attribs != 0x0f && entry[0] != 0xe5 {
                let mut state = self.state.lock().unwrap();
                state.volume_label.copy_from_slice(&entry[0..11]);
                state.label_location = LabelLocation::RootIndex(iter.current_index());
                break;
            }
            if entry[0] == 0 {
                break;
            }
            if iter.next_raw()?.is_none() {
                break;
            }
        }
        iter.finish()?;
        Ok(())
    }

    pub fn flags(&self) -> VolumeFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(VolumeFlags::READ_ONLY)
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn info(&self) -> &SuperBlockInfo {
        &self.info
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.info.bytes_per_sector * self.info.sectors_per_cluster
    }

    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= FIRST_DATA_CLUSTER && cluster < self.info.total_clusters + FIRST_DATA_CLUSTER
    }

    pub fn root_inode(&self) -> Arc<Mutex<FatInode>> {
        Arc::clone(&self.root_inode)
    }

    /// Derived from the mount-time geometry, so callers may hold inode
    /// locks while asking.
    pub fn root_inode_id(&self) -> InodeId {
        inode::dir_cluster_id(self.info.root_cluster, self.info.root_cluster)
    }

    /// Persist free-cluster accounting to the FS-info sector if the volume
    /// carries one and is writable. Invalid magics are logged, not fatal.
    pub fn update_fs_info(&self) -> FsResult<()> {
        let Some(sector) = self.info.fs_info_sector else {
            return Ok(());
        };
        if self.is_read_only() {
            return Ok(());
        }
        let guard = self.cache.get_block(sector as u64, true)?;
        let valid = guard.with(|data| super_block::parse_fs_info(data).is_some());
        if !valid {
            error!(target: "fat", sector, "fsinfo sector has invalid magic; not updating");
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        guard.with_mut(|data| {
            super_block::write_fs_info(
                data,
                super_block::FsInfo {
                    free_clusters: state.free_clusters,
                    last_allocated_cluster: state.last_allocated_cluster,
                },
            )
        });
        guard.mark_dirty();
        Ok(())
    }

    // ---- inode-ID <-> location maps -------------------------------------

    pub(crate) fn alloc_artificial_id(&self) -> InodeId {
        let mut maps = self.maps.write().unwrap();
        let id = maps.current_artificial_id;
        maps.current_artificial_id += 1;
        id
    }

    /// Bind `inode_id` to `location_id`. A binding to itself removes any
    /// existing indirection.
    pub(crate) fn set_inode_location(&self, inode_id: InodeId, location_id: InodeId) {
        let mut maps = self.maps.write().unwrap();
        if let Some(old) = maps.inode_to_location.remove(&inode_id) {
            maps.location_to_inode.remove(&old);
        }
        if inode_id != location_id {
            maps.inode_to_location.insert(inode_id, location_id);
            maps.location_to_inode.insert(location_id, inode_id);
        }
    }

    pub(crate) fn remove_inode_location(&self, inode_id: InodeId) -> bool {
        let mut maps = self.maps.write().unwrap();
        match maps.inode_to_location.remove(&inode_id) {
            Some(location) => {
                maps.location_to_inode.remove(&location);
                true
            }
            None => false,
        }
    }

    pub(crate) fn location_for_inode(&self, inode_id: InodeId) -> Option<InodeId> {
        self.maps.read().unwrap().inode_to_location.get(&inode_id).copied()
    }

    pub(crate) fn inode_for_location(&self, location_id: InodeId) -> Option<InodeId> {
        self.maps.read().unwrap().location_to_inode.get(&location_id).copied()
    }

    pub(crate) fn has_inode_mapping(&self, inode_id: InodeId) -> bool {
        self.maps.read().unwrap().inode_to_location.contains_key(&inode_id)
    }

    pub(crate) fn has_location_mapping(&self, location_id: InodeId) -> bool {
        self.maps.read().unwrap().location_to_inode.contains_key(&location_id)
    }

    // ---- directory cluster -> directory inode map -----------------------

    pub(crate) fn add_directory_mapping(&self, inode_id: InodeId) {
        let mut maps = self.maps.write().unwrap();
        maps.directory_map.insert(inode::cluster_of(inode_id), inode_id);
    }

    /// Used when the directory's inode ID is artificial and its own start
    /// cluster cannot be recovered from the ID.
    pub(crate) fn add_directory_mapping_for(&self, start_cluster: u32, inode_id: InodeId) {
        let mut maps = self.maps.write().unwrap();
        maps.directory_map.insert(start_cluster, inode_id);
    }

    pub(crate) fn remove_directory_mapping(&self, inode_id: InodeId) {
        let mut maps = self.maps.write().unwrap();
        maps.directory_map.remove(&inode::cluster_of(inode_id));
    }

    pub(crate) fn directory_mapping(&self, start_cluster: u32) -> Option<InodeId> {
        self.maps.read().unwrap().directory_map.get(&start_cluster).copied()
    }

    // ---- live-inode cache -----------------------------------------------

    pub(crate) fn cached_inode(&self, inode_id: InodeId) -> Option<Arc<Mutex<FatInode>>> {
        self.inode_cache
            .lock()
            .unwrap()
            .get(&inode_id)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn insert_cached_inode(&self, inode_id: InodeId, inode: &Arc<Mutex<FatInode>>) {
        let mut cache = self.inode_cache.lock().unwrap();
        cache.retain(|_, weak| weak.strong_count() > 0);
        cache.insert(inode_id, Arc::downgrade(inode));
    }

    pub(crate) fn forget_cached_inode(&self, inode_id: InodeId) {
        self.inode_cache.lock().unwrap().remove(&inode_id);
    }

    /// Diagnostic dump of the indirection maps.
    pub fn dump_inode_map(&self) {
        let maps = self.maps.read().unwrap();
        for (inode, location) in &maps.inode_to_location {
            info!(target: "fat", inode = format_args!("{inode:#x}"), location = format_args!("{location:#x}"), "inode map entry");
        }
    }

    /// Diagnostic dump of the directory-cluster map.
    pub fn dump_directory_map(&self) {
        let maps = self.maps.read().unwrap();
        for (cluster, inode) in &maps.directory_map {
            info!(target: "fat", cluster, inode = format_args!("{inode:#x}"), "directory map entry");
        }
    }
}
