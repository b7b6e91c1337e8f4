//! The VFS boundary: error codes, stat structures, flag words, the
//! block-device abstraction and the trait a filesystem driver implements.
//!
//! The trait mirrors the kernel's filesystem interface one to one; each
//! driver supplies its own volume/inode/handle types and every operation
//! takes the volume explicitly, so a driver instance itself holds no
//! per-mount state.

pub mod device;
pub mod error;

pub use device::{BlockDevice, DeviceGeometry, DiskImage, MemDevice};
pub use error::{FsError, FsResult};

use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// How a file is opened. Read access is implied; `WRITE` grants write
    /// access on top of it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITE  = 0x01;
        const CREATE = 0x02;
        const EXCL   = 0x04;
        const TRUNC  = 0x08;
        const APPEND = 0x10;
    }
}

bitflags! {
    /// Identity of a mounted volume.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFlags: u32 {
        const PERSISTENT  = 0x01;
        const BLOCK_BASED = 0x02;
        const READ_ONLY   = 0x04;
        const REMOVABLE   = 0x08;
        const CAN_MOUNT   = 0x10;
    }
}

/// Stable inode identifier. The encoding is driver private; the VFS only
/// requires that it stays valid across renames while the inode is live.
pub type InodeId = u64;

#[derive(Debug, Clone)]
pub struct FsStat {
    pub flags: VolumeFlags,
    /// Allocation unit in bytes.
    pub block_size: u32,
    /// Preferred IO transfer size for file copies.
    pub io_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub volume_name: String,
    pub device_path: String,
}

#[derive(Debug, Clone, Copy)]
pub struct StatInfo {
    pub inode_id: InodeId,
    pub size: u64,
    pub is_directory: bool,
    pub writable: bool,
    /// Seconds since the Unix epoch.
    pub time: i64,
}

/// Partial stat update; only the populated fields are applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatUpdate {
    pub read_only: Option<bool>,
    pub size: Option<u64>,
    pub time: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode_id: InodeId,
    pub name: String,
    pub is_directory: bool,
}

/// Driver-specific maintenance requests, addressed by code the way the
/// kernel's device_control path does.
pub mod device_control {
    /// Returns the entry's real creation time.
    pub const GET_CREATION_TIME: u32 = 10_002;
    pub const DUMP_VOLUME_INFO: u32 = 100_000;
    pub const DUMP_FAT_CHAIN: u32 = 100_001;
    pub const DUMP_INODE_MAP: u32 = 100_004;
    pub const DUMP_DIRECTORY_MAP: u32 = 100_005;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceControlReply {
    None,
    CreationTime(i64),
}

/// The operation set a filesystem driver exposes to the VFS layer.
pub trait Filesystem {
    type Volume;
    type Inode;
    type FileHandle;
    type DirHandle;

    /// Identify the filesystem on `device` without keeping it mounted.
    fn probe(&self, device: Arc<dyn BlockDevice>, device_path: &str) -> FsResult<FsStat>;

    fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        device_path: &str,
        flags: VolumeFlags,
    ) -> FsResult<Arc<Self::Volume>>;
    fn unmount(&self, volume: &Arc<Self::Volume>) -> FsResult<()>;
    fn sync(&self, volume: &Arc<Self::Volume>) -> FsResult<()>;

    fn read_fs_stat(&self, volume: &Arc<Self::Volume>) -> FsResult<FsStat>;
    fn write_fs_stat(&self, volume: &Arc<Self::Volume>, name: Option<&str>) -> FsResult<()>;

    fn locate_inode(
        &self,
        volume: &Arc<Self::Volume>,
        parent: &Arc<Self::Inode>,
        name: &str,
    ) -> FsResult<Arc<Self::Inode>>;
    fn load_inode(&self, volume: &Arc<Self::Volume>, inode_id: InodeId)
        -> FsResult<Arc<Self::Inode>>;
    fn release_inode(&self, volume: &Arc<Self::Volume>, inode: &Arc<Self::Inode>) -> FsResult<()>;

    fn open_file(
        &self,
        volume: &Arc<Self::Volume>,
        inode: &Arc<Self::Inode>,
        flags: OpenFlags,
    ) -> FsResult<Self::FileHandle>;
    fn create_file(
        &self,
        volume: &Arc<Self::Volume>,
        parent: &Arc<Self::Inode>,
        name: &str,
        flags: OpenFlags,
    ) -> FsResult<Self::FileHandle>;
    fn close_file(&self, volume: &Arc<Self::Volume>, file: &mut Self::FileHandle) -> FsResult<()>;

    fn open_directory(
        &self,
        volume: &Arc<Self::Volume>,
        inode: &Arc<Self::Inode>,
    ) -> FsResult<Self::DirHandle>;
    fn create_directory(
        &self,
        volume: &Arc<Self::Volume>,
        parent: &Arc<Self::Inode>,
        name: &str,
    ) -> FsResult<()>;
    fn close_directory(&self, volume: &Arc<Self::Volume>, dir: &mut Self::DirHandle)
        -> FsResult<()>;
    fn read_directory(
        &self,
        volume: &Arc<Self::Volume>,
        dir: &mut Self::DirHandle,
    ) -> FsResult<Option<DirEntry>>;
    fn rewind_directory(&self, volume: &Arc<Self::Volume>, dir: &mut Self::DirHandle)
        -> FsResult<()>;

    fn read(
        &self,
        volume: &Arc<Self::Volume>,
        file: &mut Self::FileHandle,
        buffer: &mut [u8],
        position: u64,
    ) -> FsResult<usize>;
    fn write(
        &self,
        volume: &Arc<Self::Volume>,
        file: &mut Self::FileHandle,
        buffer: &[u8],
        position: u64,
    ) -> FsResult<usize>;

    fn rename(
        &self,
        volume: &Arc<Self::Volume>,
        old_parent: &Arc<Self::Inode>,
        old_name: &str,
        new_parent: &Arc<Self::Inode>,
        new_name: &str,
    ) -> FsResult<()>;
    fn unlink(
        &self,
        volume: &Arc<Self::Volume>,
        parent: &Arc<Self::Inode>,
        name: &str,
    ) -> FsResult<()>;
    fn remove_directory(
        &self,
        volume: &Arc<Self::Volume>,
        parent: &Arc<Self::Inode>,
        name: &str,
    ) -> FsResult<()>;

    fn read_link(&self, volume: &Arc<Self::Volume>, inode: &Arc<Self::Inode>) -> FsResult<String>;
    fn check_access(
        &self,
        volume: &Arc<Self::Volume>,
        inode: &Arc<Self::Inode>,
        write: bool,
    ) -> FsResult<()>;
    fn read_stat(&self, volume: &Arc<Self::Volume>, inode: &Arc<Self::Inode>)
        -> FsResult<StatInfo>;
    fn write_stat(
        &self,
        volume: &Arc<Self::Volume>,
        inode: &Arc<Self::Inode>,
        update: &StatUpdate,
    ) -> FsResult<()>;

    fn device_control(
        &self,
        volume: &Arc<Self::Volume>,
        inode: &Arc<Self::Inode>,
        request: u32,
    ) -> FsResult<DeviceControlReply>;
}
