//! VFS operations over a mounted FAT volume.
//!
//! Every public entry point takes the per-volume operation lock, logs the
//! outcome and returns one of the `FsError` kinds; internal helpers never
//! take that lock. Operations that allocate clusters, write directory
//! entries or touch the ID maps roll their partial state back before
//! surfacing an error.

use crate::dir_iter::{self, DirectoryIterator, DIR_ENTRY_SIZE};
use crate::inode::{self, fat_time_to_unix_time, unix_time_to_fat_time, DosAttribs, FatInode};
use crate::volume::{FatVolume, LabelLocation};
use crate::{cluster_iter::ClusterSectorIterator, super_block, table, FAT_MAX_FILE_SIZE};
use core_vfs::{
    BlockDevice, DeviceControlReply, DirEntry, Filesystem, FsError, FsResult, FsStat, InodeId,
    OpenFlags, StatInfo, StatUpdate, VolumeFlags,
};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Characters allowed in a volume label (spaces included).
const LABEL_ALPHABET: &[u8] = b"!#$%&'()-0123456789@ABCDEFGHIJKLMNOPQRSTUVWXYZ^_`{}~ ";

pub struct FatFilesystem;

/// Open-file state: a sticky cursor into the FAT chain so sequential IO
/// does not re-walk the chain from the start.
pub struct FatFileHandle {
    pub(crate) inode: Arc<Mutex<FatInode>>,
    open_flags: OpenFlags,
    fat_iteration: u32,
    fat_chain_index: u32,
    cached_cluster: u32,
}

impl FatFileHandle {
    pub fn inode(&self) -> Arc<Mutex<FatInode>> {
        Arc::clone(&self.inode)
    }
}

pub struct FatDirHandle {
    pub(crate) inode: Arc<Mutex<FatInode>>,
    current_index: u32,
}

struct NewDirEntryInfo {
    cluster: u32,
    size: u32,
    time: i64,
    dos_attribs: DosAttribs,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl FatFilesystem {
    pub fn new() -> Self {
        FatFilesystem
    }

    // ---- inode loading ---------------------------------------------------

    /// Resolve an inode ID to its live in-memory inode, loading it from the
    /// directory entry when no open path references it yet.
    fn get_inode(&self, vol: &Arc<FatVolume>, inode_id: InodeId) -> FsResult<Arc<Mutex<FatInode>>> {
        if inode_id == vol.root_inode_id() {
            return Ok(vol.root_inode());
        }
        if let Some(inode) = vol.cached_inode(inode_id) {
            return Ok(inode);
        }
        let inode = Arc::new(Mutex::new(self.load_inode_impl(vol, inode_id)?));
        vol.insert_cached_inode(inode_id, &inode);
        Ok(inode)
    }

    /// Read the inode's directory entry back from disk following the
    /// ID-to-location indirection.
    fn load_inode_impl(&self, vol: &Arc<FatVolume>, inode_id: InodeId) -> FsResult<FatInode> {
        let location = vol.location_for_inode(inode_id).unwrap_or(inode_id);
        if inode::is_artificial_id(location) || inode::is_invalid_id(location) {
            error!(
                target: "fat",
                inode = format_args!("{inode_id:#x}"),
                location = format_args!("{location:#x}"),
                "unknown inode ID"
            );
            return Err(FsError::IoError);
        }
        let dir_cluster = inode::dir_of(location);
        let Some(parent_inode_id) = vol.directory_mapping(dir_cluster) else {
            error!(target: "fat", dir_cluster, "no directory known at cluster");
            return Err(FsError::IoError);
        };

        let start_at = if inode::is_dir_cluster_id(location) {
            0
        } else {
            inode::index_of(location)
        };
        let mut iter = DirectoryIterator::new(vol, dir_cluster, start_at)?;
        let info = loop {
            let Some((info, _)) = iter.next_lfn_entry(false)? else {
                error!(
                    target: "fat",
                    inode = format_args!("{inode_id:#x}"),
                    "inode not found in parent directory"
                );
                return Err(FsError::IoError);
            };
            if inode::is_dir_cluster_id(location) {
                if info.start_cluster == inode::cluster_of(location) {
                    break info;
                }
            } else {
                // An index-form lookup starts at the entry itself; the
                // first run must match.
                if info.start_index == inode::index_of(location) {
                    break info;
                }
                error!(
                    target: "fat",
                    inode = format_args!("{inode_id:#x}"),
                    "directory entry moved from its recorded index"
                );
                return Err(FsError::IoError);
            }
        };

        let attribs = DosAttribs::from_bits_truncate(info.dos_attribs);
        let mut size = info.size as u64;
        if attribs.contains(DosAttribs::SUBDIR) {
            let chain = table::get_chain_length(vol, info.start_cluster)?;
            size = chain as u64 * vol.bytes_per_cluster() as u64;
        }
        let end_cluster = if info.start_cluster != 0 {
            let bpc = vol.bytes_per_cluster() as u64;
            let clusters = ((size + bpc - 1) / bpc).max(1) as u32;
            table::get_chain_entry(vol, info.start_cluster, clusters - 1)?
        } else {
            0
        };
        Ok(FatInode {
            inode_id,
            parent_inode_id,
            dir_start_index: Some(info.start_index),
            dir_end_index: Some(info.end_index),
            start_cluster: info.start_cluster,
            end_cluster,
            size,
            time: fat_time_to_unix_time(info.fat_time),
            dos_attribs: attribs,
            iteration: 0,
            deleted: false,
        })
    }

    /// Case-sensitive lookup of `name` in `dir`.
    fn do_locate(
        &self,
        vol: &Arc<FatVolume>,
        dir: &Arc<Mutex<FatInode>>,
        name: &str,
    ) -> FsResult<Option<Arc<Mutex<FatInode>>>> {
        let (dir_id, dir_parent_id, dir_cluster) = {
            let dir = dir.lock().unwrap();
            (dir.inode_id, dir.parent_inode_id, dir.start_cluster)
        };
        let inode_id = if name == "." && dir_id == vol.root_inode_id() {
            dir_id
        } else if name == ".." && dir_id == vol.root_inode_id() {
            dir_parent_id
        } else {
            let mut iter = DirectoryIterator::new(vol, dir_cluster, 0)?;
            let mut found = None;
            while let Some((inode_id, entry_name, _)) =
                iter.next_directory_entry(dir_id, dir_parent_id)?
            {
                if entry_name == name {
                    found = Some(inode_id);
                    break;
                }
            }
            match found {
                Some(id) => id,
                None => return Ok(None),
            }
        };
        Ok(Some(self.get_inode(vol, inode_id)?))
    }

    /// Whether `raw_short_name` already exists in `dir_cluster`.
    fn find_short_name(
        &self,
        vol: &FatVolume,
        dir_cluster: u32,
        raw_short_name: &[u8; 11],
    ) -> FsResult<bool> {
        let mut iter = DirectoryIterator::new(vol, dir_cluster, 0)?;
        while let Some(entry) = iter.current_raw()? {
            if entry[0] == 0 {
                break;
            }
            if entry[11] != 0x0f && &entry[0..11] == raw_short_name {
                return Ok(true);
            }
            if iter.next_raw()?.is_none() {
                break;
            }
        }
        Ok(false)
    }

    // ---- directory entry creation ---------------------------------------

    /// Encode and place a new directory entry for `name`: short-name
    /// generation, `~N` collision munging, blacklist check, then the
    /// on-disk write. Returns the entry run's index range.
    fn create_directory_entry(
        &self,
        vol: &Arc<FatVolume>,
        parent: &Arc<Mutex<FatInode>>,
        entry: &NewDirEntryInfo,
        name: &str,
    ) -> FsResult<(u32, u32)> {
        if self.do_locate(vol, parent, name)?.is_some() {
            return Err(FsError::Exist);
        }

        let long_name: Vec<u16> = name.encode_utf16().collect();
        if long_name.len() > 255 {
            error!(target: "fat.dir", name, "name does not fit 255 UTF-16 units");
            return Err(FsError::NameTooLong);
        }

        let parent_cluster = parent.lock().unwrap().start_cluster;
        let mut short_name = dir_iter::generate_short_name(&long_name);

        let needs_long_name = dir_iter::requires_long_name(&long_name);
        if needs_long_name {
            let base = short_name;
            let mut found_free = false;
            for i in 1..=10u32 {
                dir_iter::munge_short_name(&mut short_name, i);
                if !self.find_short_name(vol, parent_cluster, &short_name)? {
                    found_free = true;
                    break;
                }
                short_name = base;
            }
            if !found_free {
                // The sequential namespace is exhausted; sample from the
                // clock until a free slot turns up.
                for _ in 0..1000 {
                    short_name = base;
                    let micros = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_micros() as u32)
                        .unwrap_or(0);
                    let value = (micros / 1024) % 99_999 + 1;
                    dir_iter::munge_short_name(&mut short_name, value);
                    if !self.find_short_name(vol, parent_cluster, &short_name)? {
                        found_free = true;
                        break;
                    }
                }
            }
            if !found_free {
                return Err(FsError::NoSpace);
            }
        }

        info!(
            target: "fat.dir",
            short = %String::from_utf8_lossy(&short_name),
            name,
            "creating directory entry"
        );
        let long_name = if needs_long_name { long_name } else { Vec::new() };
        self.do_create_directory_entry(vol, parent, entry, &short_name, &long_name)
    }

    /// Find a free run, grow the directory when necessary and write the
    /// long-entry run plus the short entry.
    fn do_create_directory_entry(
        &self,
        vol: &Arc<FatVolume>,
        parent: &Arc<Mutex<FatInode>>,
        entry: &NewDirEntryInfo,
        short_name: &[u8; 11],
        long_name: &[u16],
    ) -> FsResult<(u32, u32)> {
        if dir_iter::is_dos_device_name(short_name) {
            return Err(FsError::NoPermission);
        }
        if entry.cluster != 0 && !vol.is_data_cluster(entry.cluster) {
            error!(target: "fat.dir", cluster = entry.cluster, "entry for bad cluster");
            return Err(FsError::IoError);
        }

        let lfn_run = if long_name.is_empty() {
            Vec::new()
        } else {
            dir_iter::build_lfn_run(short_name, long_name)
        };
        let required_entries = lfn_run.len() as u32 + 1;

        let (parent_cluster, parent_size) = {
            let parent = parent.lock().unwrap();
            (parent.start_cluster, parent.size)
        };

        // Find a contiguous run of free slots.
        let mut start_index = 0u32;
        {
            let mut iter = DirectoryIterator::new(vol, parent_cluster, 0)?;
            let mut guard = 0;
            while iter.current_raw()?.is_some() {
                if guard > 100_000 {
                    error!(target: "fat.dir", "directory scan does not terminate");
                    break;
                }
                guard += 1;
                match iter.next_lfn_entry(false)? {
                    Some((info, _)) => {
                        if info.start_index - start_index >= required_entries {
                            break;
                        }
                        start_index = iter.current_index();
                    }
                    None => break, // End-of-directory marker.
                }
            }
        }
        let end_index = start_index + required_entries - 1;

        // Expand the directory when the run does not fit.
        let mut was_expanded = false;
        if (end_index as u64 + 1) * DIR_ENTRY_SIZE as u64 > parent_size {
            if crate::is_fixed_root(parent_cluster) {
                warn!(target: "fat.dir", "out of space in fixed root directory");
                return Err(FsError::NoSpace);
            }
            let bpc = vol.bytes_per_cluster() as u64;
            let clusters_needed =
                (((end_index as u64 + 1) * DIR_ENTRY_SIZE as u64 + bpc - 1) / bpc) as u32;
            let mut parent_guard = parent.lock().unwrap();
            table::set_chain_length(vol, &mut parent_guard, clusters_needed, true)?;
            parent_guard.size = bpc * clusters_needed as u64;
            parent_guard.iteration += 1;
            was_expanded = true;
        }

        // Write the run: long entries first (highest sequence leading), the
        // short entry last, then end-of-directory markers if we grew.
        let mut iter = DirectoryIterator::new(vol, parent_cluster, start_index)?;
        for lfn_entry in &lfn_run {
            if iter.current_raw()?.is_none() {
                error!(target: "fat.dir", "directory ended while writing long entries");
                return Err(FsError::IoError);
            }
            iter.write_current(lfn_entry)?;
            iter.next_raw()?;
        }
        if iter.current_raw()?.is_none() {
            error!(target: "fat.dir", "directory ended while writing short entry");
            return Err(FsError::IoError);
        }
        let recorded_size = if entry.dos_attribs.contains(DosAttribs::SUBDIR) {
            0
        } else {
            entry.size
        };
        // Zero-byte entries record cluster zero.
        let recorded_cluster = if entry.size == 0 { 0 } else { entry.cluster };
        let short_entry = dir_iter::build_short_entry(
            short_name,
            entry.dos_attribs.bits(),
            unix_time_to_fat_time(entry.time),
            recorded_cluster,
            recorded_size,
        );
        iter.write_current(&short_entry)?;

        if was_expanded {
            let zero = [0u8; 32];
            while iter.next_raw()?.is_some() {
                iter.write_current(&zero)?;
            }
        }
        Ok((start_index, end_index))
    }

    /// Mark every slot of the inode's entry run erased (0xe5), after
    /// verifying the run still is where the inode says it is.
    fn erase_directory_entry(&self, vol: &Arc<FatVolume>, node: &Arc<Mutex<FatInode>>) -> FsResult<()> {
        let (parent_id, start, end) = {
            let node = node.lock().unwrap();
            (
                node.parent_inode_id,
                node.dir_start_index.ok_or(FsError::InvalidArg)?,
                node.dir_end_index.ok_or(FsError::InvalidArg)?,
            )
        };
        let dir_cluster = inode::cluster_of(parent_id);
        {
            let mut iter = DirectoryIterator::new(vol, dir_cluster, start)?;
            if iter.current_raw()?.is_none() {
                error!(target: "fat.dir", "error reading directory for erase");
                return Err(FsError::IoError);
            }
            let Some((info, _)) = iter.next_lfn_entry(false)? else {
                return Err(FsError::NoEntry);
            };
            if info.start_index != start || info.end_index != end {
                // The other attributes may be mid-update; the run position
                // is the part that must agree.
                error!(target: "fat.dir", "directory entry does not match inode position");
                return Err(FsError::IoError);
            }
        }
        let mut iter = DirectoryIterator::new(vol, dir_cluster, start)?;
        for _ in start..=end {
            let Some(mut entry) = iter.current_raw()? else {
                break;
            };
            entry[0] = 0xe5;
            iter.write_current(&entry)?;
            iter.next_raw()?;
        }
        Ok(())
    }

    /// Shrink `dir`'s chain to cover its last meaningful entry. Erased
    /// entries and (in the root) the volume label do not count. Fixed roots
    /// never shrink; a FAT32 root keeps at least one cluster.
    fn compact_directory(&self, vol: &Arc<FatVolume>, dir: &Arc<Mutex<FatInode>>) -> FsResult<()> {
        let (dir_cluster, dir_id, dir_size) = {
            let dir = dir.lock().unwrap();
            (dir.start_cluster, dir.inode_id, dir.size)
        };
        if crate::is_fixed_root(dir_cluster) {
            return Ok(());
        }
        let is_root = dir_id == vol.root_inode_id();
        let mut last = 0u32;
        let mut iter = DirectoryIterator::new(vol, dir_cluster, 0)?;
        let mut guard = 0;
        while iter.current_raw()?.is_some() {
            if guard > 100_000 {
                error!(target: "fat.dir", "directory scan does not terminate");
                break;
            }
            guard += 1;
            match iter.next_lfn_entry(false)? {
                Some((info, _)) => {
                    let is_label = info.dos_attribs & DosAttribs::VOLUME.bits() != 0;
                    if !is_label || !is_root {
                        last = iter.current_index();
                    }
                }
                None => {
                    let entries_per_cluster =
                        vol.bytes_per_cluster() / DIR_ENTRY_SIZE as u32;
                    let mut clusters = (last + entries_per_cluster - 1) / entries_per_cluster;
                    if clusters == 0 {
                        clusters = 1;
                    }
                    if (clusters as u64) * (vol.bytes_per_cluster() as u64) < dir_size {
                        info!(target: "fat.dir", clusters, "shrinking directory");
                        let mut dir_guard = dir.lock().unwrap();
                        table::set_chain_length(vol, &mut dir_guard, clusters, true)?;
                        dir_guard.size = clusters as u64 * vol.bytes_per_cluster() as u64;
                        dir_guard.iteration += 1;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Directory emptiness: nothing besides the `.` and `..` entries.
    fn is_directory_empty(&self, vol: &Arc<FatVolume>, dir: &Arc<Mutex<FatInode>>) -> FsResult<bool> {
        let (dir_cluster, dir_id) = {
            let dir = dir.lock().unwrap();
            (dir.start_cluster, dir.inode_id)
        };
        let mut iter = DirectoryIterator::new(vol, dir_cluster, 0)?;
        if iter.current_raw()?.is_none() {
            error!(target: "fat.dir", "error opening directory for emptiness check");
            return Err(FsError::IoError);
        }
        let start = if dir_id == vol.root_inode_id() { 2 } else { 0 };
        for i in start..3 {
            let Some((_, name)) = iter.next_lfn_entry(true)? else {
                return Ok(i == 2);
            };
            let dot_ok = match i {
                0 => name == ".",
                1 => name == "..",
                _ => true,
            };
            if !dot_ok || (i < 2 && iter.current_index() != i + 1) {
                error!(target: "fat.dir", "malformed directory");
                return Err(FsError::NotDirectory);
            }
        }
        Ok(false)
    }

    fn do_unlink(
        &self,
        vol: &Arc<FatVolume>,
        dir: &Arc<Mutex<FatInode>>,
        name: &str,
        remove_file: bool,
    ) -> FsResult<()> {
        if name == "." || name == ".." {
            return Err(FsError::NoPermission);
        }
        if vol.is_read_only() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        let Some(file) = self.do_locate(vol, dir, name)? else {
            return Err(FsError::NoEntry);
        };
        {
            let file_guard = file.lock().unwrap();
            if remove_file {
                if file_guard.is_directory() {
                    return Err(FsError::IsDirectory);
                }
            } else {
                if !file_guard.is_directory() {
                    return Err(FsError::NotDirectory);
                }
                if file_guard.inode_id == vol.root_inode_id() {
                    error!(target: "fat", "attempt to remove the root directory");
                    return Err(FsError::NoPermission);
                }
            }
        }
        if !remove_file && !self.is_directory_empty(vol, &file)? {
            return Err(FsError::NotEmpty);
        }

        self.erase_directory_entry(vol, &file)?;
        self.compact_directory(vol, dir)?;

        // Re-key the inode to a fresh artificial ID: the old location stops
        // resolving while the inode stays live until the last handle goes.
        // The FAT chain is cleared on release, not here.
        let mut file_guard = file.lock().unwrap();
        vol.set_inode_location(file_guard.inode_id, vol.alloc_artificial_id());
        file_guard.deleted = true;
        Ok(())
    }

    fn label_to_display(label: &[u8; 11], present: bool) -> String {
        if !present {
            return "no name".to_owned();
        }
        let trimmed: Vec<u8> = {
            let mut end = label.len();
            while end > 0 && label[end - 1] == b' ' {
                end -= 1;
            }
            label[..end].to_vec()
        };
        String::from_utf8_lossy(&trimmed).to_ascii_lowercase()
    }

    fn fs_stat(&self, vol: &Arc<FatVolume>) -> FsStat {
        let state = vol.state.lock().unwrap();
        let has_label = state.label_location != LabelLocation::None;
        FsStat {
            flags: vol.flags(),
            block_size: vol.bytes_per_cluster(),
            io_size: 65536,
            total_blocks: vol.info().total_clusters as u64,
            free_blocks: state.free_clusters as u64,
            volume_name: Self::label_to_display(&state.volume_label, has_label),
            device_path: vol.device_path().to_owned(),
        }
    }
}

impl Default for FatFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for FatFilesystem {
    type Volume = FatVolume;
    type Inode = Mutex<FatInode>;
    type FileHandle = FatFileHandle;
    type DirHandle = FatDirHandle;

    fn probe(&self, device: Arc<dyn BlockDevice>, device_path: &str) -> FsResult<FsStat> {
        let volume = self.mount(device, device_path, VolumeFlags::empty())?;
        let mut stat = self.fs_stat(&volume);
        stat.flags |= VolumeFlags::CAN_MOUNT;
        self.unmount(&volume)?;
        Ok(stat)
    }

    fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        device_path: &str,
        flags: VolumeFlags,
    ) -> FsResult<Arc<FatVolume>> {
        let geometry = device.geometry().ok_or_else(|| {
            error!(target: "fat", device_path, "device reports no geometry");
            FsError::IoError
        })?;
        if !matches!(geometry.bytes_per_sector, 512 | 1024 | 2048) {
            error!(
                target: "fat",
                bytes_per_sector = geometry.bytes_per_sector,
                "unsupported device block size"
            );
            return Err(FsError::IoError);
        }

        let mut volume_flags = VolumeFlags::PERSISTENT | VolumeFlags::BLOCK_BASED;
        if geometry.removable {
            volume_flags |= VolumeFlags::REMOVABLE;
        }
        if geometry.read_only || flags.contains(VolumeFlags::READ_ONLY) {
            info!(target: "fat", device_path, "mounting read-only");
            volume_flags |= VolumeFlags::READ_ONLY;
        }

        let mut boot = vec![0u8; 512];
        let read = device.read_at(0, &mut boot)?;
        if read != boot.len() {
            error!(target: "fat", device_path, "error reading boot sector");
            return Err(FsError::IoError);
        }
        let sb = super_block::parse_super_block(&boot)?;
        if sb.total_sectors as u64 > geometry.sector_count {
            error!(
                target: "fat",
                volume_sectors = sb.total_sectors,
                device_sectors = geometry.sector_count,
                "volume extends past the end of the partition"
            );
            return Err(FsError::IoError);
        }

        FatVolume::mount(device, device_path, volume_flags, sb)
    }

    fn unmount(&self, volume: &Arc<FatVolume>) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        info!(target: "fat", device = volume.device_path(), "unmount");
        volume.update_fs_info()?;
        volume.cache.flush()
    }

    fn sync(&self, volume: &Arc<FatVolume>) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        volume.update_fs_info()?;
        volume.cache.flush()
    }

    fn read_fs_stat(&self, volume: &Arc<FatVolume>) -> FsResult<FsStat> {
        let _guard = volume.op_lock.lock().unwrap();
        Ok(self.fs_stat(volume))
    }

    fn write_fs_stat(&self, volume: &Arc<FatVolume>, name: Option<&str>) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        if volume.is_read_only() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        let Some(name) = name else {
            return Ok(());
        };

        // Sanitize into the label alphabet, up-casing as we go.
        let mut label = [b' '; 11];
        let mut i = 0;
        for c in name.bytes() {
            if i == 11 {
                break;
            }
            let c = c.to_ascii_uppercase();
            if LABEL_ALPHABET.contains(&c) {
                label[i] = c;
                i += 1;
            }
        }
        if i == 0 {
            return Err(FsError::InvalidArg);
        }
        info!(target: "fat", label = %String::from_utf8_lossy(&label), "setting volume label");

        let location = volume.state.lock().unwrap().label_location;
        match location {
            LabelLocation::Bpb => {
                let current = volume.state.lock().unwrap().volume_label;
                let guard = volume.cache.get_block(0, true)?;
                let matches =
                    guard.with(|data| data[0x26] == 0x29 && data[0x2b..0x36] == current);
                if !matches {
                    error!(target: "fat", "BPB label does not match cached label");
                    return Err(FsError::InvalidArg);
                }
                guard.with_mut(|data| data[0x2b..0x36].copy_from_slice(&label));
                guard.mark_dirty();
            }
            LabelLocation::RootIndex(index) => {
                let root_cluster = volume.root_inode().lock().unwrap().start_cluster;
                let mut iter = DirectoryIterator::new(volume, root_cluster, index)?;
                let Some(mut entry) = iter.current_raw()? else {
                    return Err(FsError::InvalidArg);
                };
                let current = volume.state.lock().unwrap().volume_label;
                if entry[0..11] != current {
                    error!(target: "fat", "root label entry does not match cached label");
                    return Err(FsError::InvalidArg);
                }
                entry[0..11].copy_from_slice(&label);
                iter.write_current(&entry)?;
            }
            LabelLocation::None => {
                let root = volume.root_inode();
                let root_cluster = root.lock().unwrap().start_cluster;
                if self.find_short_name(volume, root_cluster, &label)? {
                    return Err(FsError::Exist);
                }
                let info = NewDirEntryInfo {
                    cluster: 0,
                    size: 0,
                    time: now_unix(),
                    dos_attribs: DosAttribs::ARCHIVE | DosAttribs::VOLUME,
                };
                let (index, _) =
                    self.do_create_directory_entry(volume, &root, &info, &label, &[])?;
                volume.state.lock().unwrap().label_location = LabelLocation::RootIndex(index);
            }
        }
        volume.state.lock().unwrap().volume_label = label;
        Ok(())
    }

    fn locate_inode(
        &self,
        volume: &Arc<FatVolume>,
        parent: &Arc<Mutex<FatInode>>,
        name: &str,
    ) -> FsResult<Arc<Mutex<FatInode>>> {
        if name.encode_utf16().count() > 255 {
            return Err(FsError::NameTooLong);
        }
        let _guard = volume.op_lock.lock().unwrap();
        match self.do_locate(volume, parent, name)? {
            Some(inode) => Ok(inode),
            None => Err(FsError::NoEntry),
        }
    }

    fn load_inode(&self, volume: &Arc<FatVolume>, inode_id: InodeId) -> FsResult<Arc<Mutex<FatInode>>> {
        let _guard = volume.op_lock.lock().unwrap();
        self.get_inode(volume, inode_id)
    }

    fn release_inode(&self, volume: &Arc<FatVolume>, inode: &Arc<Mutex<FatInode>>) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        let (inode_id, deleted, start_cluster, size, is_directory) = {
            let node = inode.lock().unwrap();
            (
                node.inode_id,
                node.deleted,
                node.start_cluster,
                node.size,
                node.is_directory(),
            )
        };
        if deleted {
            info!(target: "fat.file", inode = format_args!("{inode_id:#x}"), "releasing deleted inode");
            if volume.is_read_only() {
                error!(target: "fat", "deleted inode on read-only volume");
                return Err(FsError::ReadOnlyFilesystem);
            }
            if start_cluster != 0 && !volume.is_data_cluster(start_cluster) {
                error!(target: "fat", start_cluster, "deleted inode has invalid start cluster");
            }
            if start_cluster == 0 && size != 0 {
                error!(target: "fat", "deleted inode has data but no start cluster");
            }
            if start_cluster != 0 {
                table::clear_fat_chain(volume, start_cluster)?;
            }
            if volume.has_inode_mapping(inode_id) {
                volume.remove_inode_location(inode_id);
            }
            if is_directory {
                volume.remove_directory_mapping(inode_id);
            }
        }
        volume.forget_cached_inode(inode_id);
        Ok(())
    }

    fn open_file(
        &self,
        volume: &Arc<FatVolume>,
        inode: &Arc<Mutex<FatInode>>,
        mut flags: OpenFlags,
    ) -> FsResult<FatFileHandle> {
        let _guard = volume.op_lock.lock().unwrap();
        if flags.contains(OpenFlags::CREATE) {
            error!(target: "fat.file", "open_file called with CREATE");
            return Err(FsError::InvalidArg);
        }
        let mut node = inode.lock().unwrap();
        if volume.is_read_only()
            || node.dos_attribs.contains(DosAttribs::READ_ONLY)
            || node.is_directory()
        {
            flags.remove(OpenFlags::WRITE);
        }
        if flags.contains(OpenFlags::TRUNC) && !flags.contains(OpenFlags::WRITE) {
            return Err(FsError::NoPermission);
        }
        if flags.contains(OpenFlags::TRUNC) {
            info!(target: "fat.file", inode = format_args!("{:#x}", node.inode_id), "truncating on open");
            table::set_chain_length(volume, &mut node, 0, true)?;
            node.size = 0;
            node.dos_attribs = DosAttribs::empty();
            node.iteration += 1;
            node.flush_to_disk(volume)?;
        }
        Ok(FatFileHandle {
            inode: Arc::clone(inode),
            open_flags: flags,
            fat_iteration: node.iteration,
            fat_chain_index: 0,
            cached_cluster: node.start_cluster,
        })
    }

    fn create_file(
        &self,
        volume: &Arc<FatVolume>,
        parent: &Arc<Mutex<FatInode>>,
        name: &str,
        flags: OpenFlags,
    ) -> FsResult<FatFileHandle> {
        if name.encode_utf16().count() > 255 {
            return Err(FsError::NameTooLong);
        }
        let _guard = volume.op_lock.lock().unwrap();
        if volume.is_read_only() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        {
            let parent = parent.lock().unwrap();
            if parent.deleted {
                error!(target: "fat.file", "create in removed directory");
                return Err(FsError::NoPermission);
            }
        }
        if !flags.contains(OpenFlags::WRITE) {
            error!(target: "fat.file", "create_file requires write access");
            return Err(FsError::NoPermission);
        }

        let file = if let Some(existing) = self.do_locate(volume, parent, name)? {
            if flags.contains(OpenFlags::EXCL) {
                return Err(FsError::Exist);
            }
            {
                let mut node = existing.lock().unwrap();
                if node.is_directory() {
                    return Err(FsError::NoPermission);
                }
                if flags.contains(OpenFlags::TRUNC) {
                    table::set_chain_length(volume, &mut node, 0, true)?;
                    node.size = 0;
                    node.iteration += 1;
                    node.flush_to_disk(volume)?;
                }
            }
            existing
        } else {
            let parent_id = parent.lock().unwrap().inode_id;
            let entry = NewDirEntryInfo {
                cluster: 0,
                size: 0,
                time: now_unix(),
                dos_attribs: DosAttribs::empty(),
            };
            let (start_index, _end_index) =
                self.create_directory_entry(volume, parent, &entry, name)?;

            let mut inode_id = inode::dir_index_id(inode::cluster_of(parent_id), start_index);
            if volume.has_inode_mapping(inode_id) {
                let artificial = volume.alloc_artificial_id();
                volume.set_inode_location(
                    artificial,
                    inode::dir_index_id(inode::cluster_of(parent_id), start_index),
                );
                inode_id = artificial;
            }
            self.get_inode(volume, inode_id)?
        };

        let node = file.lock().unwrap();
        let handle = FatFileHandle {
            inode: Arc::clone(&file),
            open_flags: flags,
            fat_iteration: node.iteration,
            fat_chain_index: 0,
            cached_cluster: node.start_cluster,
        };
        drop(node);
        Ok(handle)
    }

    fn close_file(&self, volume: &Arc<FatVolume>, file: &mut FatFileHandle) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        let node = file.inode.lock().unwrap();
        info!(target: "fat.file", inode = format_args!("{:#x}", node.inode_id), "close");
        Ok(())
    }

    fn open_directory(
        &self,
        volume: &Arc<FatVolume>,
        inode: &Arc<Mutex<FatInode>>,
    ) -> FsResult<FatDirHandle> {
        let _guard = volume.op_lock.lock().unwrap();
        let node = inode.lock().unwrap();
        if !node.is_directory() {
            return Err(FsError::NotDirectory);
        }
        drop(node);
        Ok(FatDirHandle {
            inode: Arc::clone(inode),
            current_index: 0,
        })
    }

    fn create_directory(
        &self,
        volume: &Arc<FatVolume>,
        parent: &Arc<Mutex<FatInode>>,
        name: &str,
    ) -> FsResult<()> {
        if name.encode_utf16().count() > 255 {
            return Err(FsError::NameTooLong);
        }
        let _guard = volume.op_lock.lock().unwrap();
        if volume.is_read_only() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        let (parent_id, parent_is_dir, parent_deleted, parent_time, parent_cluster, parent_is_root) = {
            let parent = parent.lock().unwrap();
            (
                parent.inode_id,
                parent.is_directory(),
                parent.deleted,
                parent.time,
                parent.start_cluster,
                parent.inode_id == volume.root_inode_id(),
            )
        };
        if parent_deleted {
            error!(target: "fat.dir", "create_directory in removed directory");
            return Err(FsError::NoPermission);
        }
        if !parent_is_dir {
            return Err(FsError::NotDirectory);
        }

        let start_cluster = table::allocate_clusters(volume, 1)?;
        let time = now_unix();
        let inode_id = inode::dir_cluster_id(inode::cluster_of(parent_id), start_cluster);

        let result = (|| -> FsResult<()> {
            if volume.has_inode_mapping(inode_id) || volume.has_location_mapping(inode_id) {
                error!(
                    target: "fat.dir",
                    inode = format_args!("{inode_id:#x}"),
                    "new directory collides with an existing ID mapping"
                );
                return Err(FsError::IoError);
            }
            volume.add_directory_mapping(inode_id);

            let inner = (|| -> FsResult<()> {
                let entry = NewDirEntryInfo {
                    cluster: start_cluster,
                    size: volume.bytes_per_cluster(),
                    time,
                    dos_attribs: DosAttribs::SUBDIR,
                };
                self.create_directory_entry(volume, parent, &entry, name)?;

                // Seed the new cluster: `.` and `..` entries followed by
                // end-of-directory markers.
                let bps = volume.info().bytes_per_sector as usize;
                let mut sector = vec![0u8; bps];
                let dot = dir_iter::build_short_entry(
                    b".          ",
                    DosAttribs::SUBDIR.bits(),
                    unix_time_to_fat_time(time),
                    start_cluster,
                    0,
                );
                // The root is always recorded as cluster zero in `..`.
                let dotdot_cluster = if parent_is_root { 0 } else { parent_cluster };
                let dotdot = dir_iter::build_short_entry(
                    b"..         ",
                    DosAttribs::SUBDIR.bits(),
                    unix_time_to_fat_time(parent_time),
                    dotdot_cluster,
                    0,
                );
                sector[0..32].copy_from_slice(&dot);
                sector[32..64].copy_from_slice(&dotdot);

                let mut csi = ClusterSectorIterator::new(volume, start_cluster, 0)?;
                csi.write_block(volume, &sector)?;
                sector.fill(0);
                for _ in 1..volume.info().sectors_per_cluster {
                    csi.advance(volume, 1)?;
                    let guard = csi.get_block(volume, false)?;
                    guard.with_mut(|data| data.fill(0));
                    guard.mark_dirty();
                }
                Ok(())
            })();
            if inner.is_err() {
                volume.remove_directory_mapping(inode_id);
            }
            inner
        })();

        if result.is_err() {
            let _ = table::clear_fat_chain(volume, start_cluster);
        }
        result
    }

    fn close_directory(&self, _volume: &Arc<FatVolume>, _dir: &mut FatDirHandle) -> FsResult<()> {
        Ok(())
    }

    fn read_directory(
        &self,
        volume: &Arc<FatVolume>,
        dir: &mut FatDirHandle,
    ) -> FsResult<Option<DirEntry>> {
        let _guard = volume.op_lock.lock().unwrap();
        let (dir_id, dir_parent_id, dir_cluster) = {
            let node = dir.inode.lock().unwrap();
            (node.inode_id, node.parent_inode_id, node.start_cluster)
        };
        let is_root = dir_id == volume.root_inode_id();

        let mut index = dir.current_index;
        if is_root {
            // The root directory has no on-disk dot entries; synthesize
            // them for the first two reads.
            if index < 2 {
                dir.current_index += 1;
                let name = if index == 0 { "." } else { ".." };
                return Ok(Some(DirEntry {
                    inode_id: dir_id,
                    name: name.to_owned(),
                    is_directory: true,
                }));
            }
            index -= 2;
        }

        let mut iter = DirectoryIterator::new(volume, dir_cluster, index)?;
        let entry = iter.next_directory_entry(dir_id, dir_parent_id)?;
        dir.current_index = iter.current_index() + if is_root { 2 } else { 0 };
        Ok(entry.map(|(inode_id, name, attribs)| DirEntry {
            inode_id,
            name,
            is_directory: attribs & DosAttribs::SUBDIR.bits() != 0,
        }))
    }

    fn rewind_directory(&self, volume: &Arc<FatVolume>, dir: &mut FatDirHandle) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        dir.current_index = 0;
        Ok(())
    }

    fn read(
        &self,
        volume: &Arc<FatVolume>,
        file: &mut FatFileHandle,
        buffer: &mut [u8],
        position: u64,
    ) -> FsResult<usize> {
        let _guard = volume.op_lock.lock().unwrap();
        let node = file.inode.lock().unwrap();
        if node.is_directory() {
            return Err(FsError::IsDirectory);
        }
        if node.size == 0 || buffer.is_empty() || position >= node.size {
            return Ok(0);
        }
        let len = buffer.len().min((node.size - position) as usize);

        let bps = volume.info().bytes_per_sector as u64;
        let bpc = volume.bytes_per_cluster() as u64;

        let (start_cluster, diff) = if file.fat_iteration == node.iteration
            && position >= file.fat_chain_index as u64 * bpc
        {
            if !volume.is_data_cluster(file.cached_cluster) {
                error!(target: "fat.file", cluster = file.cached_cluster, "invalid cached cluster");
                return Err(FsError::InvalidArg);
            }
            (file.cached_cluster, position - file.fat_chain_index as u64 * bpc)
        } else {
            // The chain changed under the handle; start over.
            (node.start_cluster, position)
        };

        let mut iter = ClusterSectorIterator::new(volume, start_cluster, 0)?;
        if diff / bps > 0 {
            iter.advance(volume, (diff / bps) as u32)?;
        }

        let mut bytes_read = 0usize;
        let in_sector = (position % bps) as usize;
        if in_sector != 0 {
            let guard = iter.get_block(volume, true)?;
            let amount = len.min(bps as usize - in_sector);
            guard.with(|data| buffer[..amount].copy_from_slice(&data[in_sector..in_sector + amount]));
            bytes_read += amount;
            if bytes_read < len {
                iter.advance(volume, 1)?;
            }
        }
        while bytes_read + bps as usize <= len {
            iter.read_block(volume, &mut buffer[bytes_read..bytes_read + bps as usize])?;
            bytes_read += bps as usize;
            if bytes_read < len {
                iter.advance(volume, 1)?;
            }
        }
        if bytes_read < len {
            let guard = iter.get_block(volume, true)?;
            let amount = len - bytes_read;
            guard.with(|data| buffer[bytes_read..len].copy_from_slice(&data[..amount]));
            bytes_read += amount;
        }

        file.fat_iteration = node.iteration;
        file.fat_chain_index = ((position + len as u64 - 1) / bpc) as u32;
        file.cached_cluster = iter.current_cluster;
        Ok(bytes_read)
    }

    fn write(
        &self,
        volume: &Arc<FatVolume>,
        file: &mut FatFileHandle,
        buffer: &[u8],
        position: u64,
    ) -> FsResult<usize> {
        let _guard = volume.op_lock.lock().unwrap();
        let mut node = file.inode.lock().unwrap();
        if node.is_directory() {
            return Err(FsError::IsDirectory);
        }
        if !file.open_flags.contains(OpenFlags::WRITE) {
            error!(target: "fat.file", "write on read-only handle");
            return Err(FsError::NoPermission);
        }
        let mut position = position;
        if file.open_flags.contains(OpenFlags::APPEND) {
            position = node.size;
        }
        if position >= FAT_MAX_FILE_SIZE {
            error!(target: "fat.file", position, "write position exceeds FAT limits");
            return Err(FsError::FileTooLarge);
        }
        let len = buffer.len().min((FAT_MAX_FILE_SIZE - position) as usize);
        if len == 0 {
            return Ok(0);
        }

        let bps = volume.info().bytes_per_sector as u64;
        let bpc = volume.bytes_per_cluster() as u64;

        let mut cursor = if node.size != 0
            && file.fat_iteration == node.iteration
            && position >= file.fat_chain_index as u64 * bpc
        {
            if !volume.is_data_cluster(file.cached_cluster) {
                error!(target: "fat.file", cluster = file.cached_cluster, "invalid cached cluster");
                return Err(FsError::InvalidArg);
            }
            Some((
                file.cached_cluster,
                position - file.fat_chain_index as u64 * bpc,
            ))
        } else {
            None
        };

        // Grow the chain first so the copy below never runs off the end.
        if position + len as u64 > node.size {
            let clusters = ((position + len as u64 + bpc - 1) / bpc) as u32;
            if node.size <= (clusters as u64 - 1) * bpc {
                table::set_chain_length(volume, &mut node, clusters, true)?;
                node.iteration += 1;
                cursor = None;
            }
            node.size = position + len as u64;
            // Persist now so directory-entry readers see the new size.
            node.flush_to_disk(volume)?;
            info!(target: "fat.file", size = node.size, clusters, "extended file");
        }

        let (start_cluster, diff) = cursor.unwrap_or((node.start_cluster, position));

        let mut iter = ClusterSectorIterator::new(volume, start_cluster, 0)?;
        if diff / bps > 0 {
            iter.advance(volume, (diff / bps) as u32)?;
        }

        let mut written = 0usize;
        let in_sector = (position % bps) as usize;
        if in_sector != 0 {
            let guard = iter.get_block(volume, true)?;
            let amount = len.min(bps as usize - in_sector);
            guard.with_mut(|data| data[in_sector..in_sector + amount].copy_from_slice(&buffer[..amount]));
            guard.mark_dirty();
            written += amount;
            if written < len {
                iter.advance(volume, 1)?;
            }
        }
        while written + bps as usize <= len {
            iter.write_block(volume, &buffer[written..written + bps as usize])?;
            written += bps as usize;
            if written < len {
                iter.advance(volume, 1)?;
            }
        }
        if written < len {
            let guard = iter.get_block(volume, true)?;
            let amount = len - written;
            guard.with_mut(|data| data[..amount].copy_from_slice(&buffer[written..len]));
            guard.mark_dirty();
            written += amount;
        }

        file.fat_iteration = node.iteration;
        file.fat_chain_index = ((position + len as u64 - 1) / bpc) as u32;
        file.cached_cluster = iter.current_cluster;
        Ok(written)
    }

    fn rename(
        &self,
        volume: &Arc<FatVolume>,
        old_parent: &Arc<Mutex<FatInode>>,
        old_name: &str,
        new_parent: &Arc<Mutex<FatInode>>,
        new_name: &str,
    ) -> FsResult<()> {
        if old_name.encode_utf16().count() > 255 || new_name.encode_utf16().count() > 255 {
            return Err(FsError::NameTooLong);
        }
        let _guard = volume.op_lock.lock().unwrap();
        if volume.is_read_only() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        info!(target: "fat.file", old_name, new_name, "rename");

        let Some(file) = self.do_locate(volume, old_parent, old_name)? else {
            error!(target: "fat.file", old_name, "rename source not found");
            return Err(FsError::NoEntry);
        };

        // A file already at the destination is replaced; its chain goes
        // away when the last handle closes.
        let target = self.do_locate(volume, new_parent, new_name)?;
        let (start_index, end_index) = match target {
            Some(existing) if !Arc::ptr_eq(&existing, &file) => {
                let mut existing = existing.lock().unwrap();
                if existing.is_directory() {
                    error!(target: "fat.file", new_name, "rename target is a directory");
                    return Err(FsError::NoPermission);
                }
                let indices = (
                    existing.dir_start_index.ok_or(FsError::InvalidArg)?,
                    existing.dir_end_index.ok_or(FsError::InvalidArg)?,
                );
                existing.deleted = true;
                indices
            }
            Some(_) => {
                // Renaming onto itself is a no-op.
                return Ok(());
            }
            None => {
                let entry = {
                    let node = file.lock().unwrap();
                    NewDirEntryInfo {
                        cluster: node.start_cluster,
                        size: node.size as u32,
                        time: node.time,
                        dos_attribs: node.dos_attribs,
                    }
                };
                self.create_directory_entry(volume, new_parent, &entry, new_name)?
            }
        };

        self.erase_directory_entry(volume, &file)?;
        self.compact_directory(volume, old_parent)?;

        let new_parent_id = new_parent.lock().unwrap().inode_id;
        let (is_directory, file_start_cluster) = {
            let mut node = file.lock().unwrap();
            node.parent_inode_id = new_parent_id;
            node.dir_start_index = Some(start_index);
            node.dir_end_index = Some(end_index);
            let location = if node.size != 0 {
                inode::dir_cluster_id(inode::cluster_of(new_parent_id), node.start_cluster)
            } else {
                inode::dir_index_id(inode::cluster_of(new_parent_id), start_index)
            };
            volume.set_inode_location(node.inode_id, location);
            node.flush_to_disk(volume)?;
            (node.is_directory(), node.start_cluster)
        };

        if is_directory {
            // Keep the moved directory's `..` entry pointing at its new
            // parent.
            let (new_parent_cluster, parent_is_root) = {
                let parent = new_parent.lock().unwrap();
                (
                    parent.start_cluster,
                    parent.inode_id == volume.root_inode_id(),
                )
            };
            let mut iter = DirectoryIterator::new(volume, file_start_cluster, 1)?;
            let Some(mut entry) = iter.current_raw()? else {
                error!(target: "fat.file", "error opening renamed directory");
                return Err(FsError::IoError);
            };
            if &entry[0..11] != b"..         " {
                error!(target: "fat.file", "renamed directory is missing its dot-dot entry");
                return Err(FsError::IoError);
            }
            let cluster = if parent_is_root { 0 } else { new_parent_cluster };
            entry[26..28].copy_from_slice(&((cluster & 0xffff) as u16).to_le_bytes());
            entry[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
            iter.write_current(&entry)?;
        }
        Ok(())
    }

    fn unlink(&self, volume: &Arc<FatVolume>, parent: &Arc<Mutex<FatInode>>, name: &str) -> FsResult<()> {
        if name.encode_utf16().count() > 255 {
            return Err(FsError::NameTooLong);
        }
        let _guard = volume.op_lock.lock().unwrap();
        self.do_unlink(volume, parent, name, true)
    }

    fn remove_directory(
        &self,
        volume: &Arc<FatVolume>,
        parent: &Arc<Mutex<FatInode>>,
        name: &str,
    ) -> FsResult<()> {
        if name.encode_utf16().count() > 255 {
            return Err(FsError::NameTooLong);
        }
        let _guard = volume.op_lock.lock().unwrap();
        self.do_unlink(volume, parent, name, false)
    }

    fn read_link(&self, _volume: &Arc<FatVolume>, _inode: &Arc<Mutex<FatInode>>) -> FsResult<String> {
        // No links on FAT.
        warn!(target: "fat", "read_link called");
        Err(FsError::InvalidArg)
    }

    fn check_access(
        &self,
        volume: &Arc<FatVolume>,
        inode: &Arc<Mutex<FatInode>>,
        write: bool,
    ) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        if write {
            if volume.is_read_only() {
                return Err(FsError::ReadOnlyFilesystem);
            }
            if inode.lock().unwrap().dos_attribs.contains(DosAttribs::READ_ONLY) {
                return Err(FsError::NoPermission);
            }
        }
        Ok(())
    }

    fn read_stat(&self, volume: &Arc<FatVolume>, inode: &Arc<Mutex<FatInode>>) -> FsResult<StatInfo> {
        let _guard = volume.op_lock.lock().unwrap();
        let node = inode.lock().unwrap();
        Ok(StatInfo {
            inode_id: node.inode_id,
            size: node.size,
            is_directory: node.is_directory(),
            writable: !volume.is_read_only()
                && !node.dos_attribs.contains(DosAttribs::READ_ONLY),
            time: node.time,
        })
    }

    fn write_stat(
        &self,
        volume: &Arc<FatVolume>,
        inode: &Arc<Mutex<FatInode>>,
        update: &StatUpdate,
    ) -> FsResult<()> {
        let _guard = volume.op_lock.lock().unwrap();
        if volume.is_read_only() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        let mut node = inode.lock().unwrap();
        let mut dirty = false;

        if let Some(read_only) = update.read_only {
            node.dos_attribs.set(DosAttribs::READ_ONLY, read_only);
            dirty = true;
        }
        if let Some(size) = update.size {
            if node.is_directory() {
                error!(target: "fat.file", "cannot set the size of a directory");
                return Err(FsError::IsDirectory);
            }
            if size > FAT_MAX_FILE_SIZE {
                return Err(FsError::FileTooLarge);
            }
            let bpc = volume.bytes_per_cluster() as u64;
            let clusters = ((size + bpc - 1) / bpc) as u32;
            table::set_chain_length(volume, &mut node, clusters, true)?;
            node.size = size;
            node.iteration += 1;
            dirty = true;
        }
        if let Some(time) = update.time {
            node.time = time;
            dirty = true;
        }
        if dirty {
            node.flush_to_disk(volume)?;
        }
        Ok(())
    }

    fn device_control(
        &self,
        volume: &Arc<FatVolume>,
        inode: &Arc<Mutex<FatInode>>,
        request: u32,
    ) -> FsResult<DeviceControlReply> {
        use core_vfs::device_control as ctl;
        let _guard = volume.op_lock.lock().unwrap();
        match request {
            ctl::GET_CREATION_TIME => Ok(DeviceControlReply::CreationTime(
                inode.lock().unwrap().time,
            )),
            ctl::DUMP_VOLUME_INFO => {
                let info = volume.info();
                let state = volume.state.lock().unwrap();
                info!(
                    target: "fat",
                    device = volume.device_path(),
                    bytes_per_sector = info.bytes_per_sector,
                    sectors_per_cluster = info.sectors_per_cluster,
                    fat_bits = info.fat_bits,
                    total_clusters = info.total_clusters,
                    free_clusters = state.free_clusters,
                    last_allocated = state.last_allocated_cluster,
                    "volume info"
                );
                Ok(DeviceControlReply::None)
            }
            ctl::DUMP_FAT_CHAIN => {
                let start = inode.lock().unwrap().start_cluster;
                table::dump_chain(volume, start);
                Ok(DeviceControlReply::None)
            }
            ctl::DUMP_INODE_MAP => {
                volume.dump_inode_map();
                Ok(DeviceControlReply::None)
            }
            ctl::DUMP_DIRECTORY_MAP => {
                volume.dump_directory_map();
                Ok(DeviceControlReply::None)
            }
            _ => {
                error!(target: "fat", request, "unknown device_control request");
                Err(FsError::InvalidArg)
            }
        }
    }
}
