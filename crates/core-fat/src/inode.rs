//! Inode identity and in-memory inode state.
//!
//! Disk positions cannot serve as stable inode IDs because rename moves a
//! file's directory entry. Three encodings share one 64-bit space, told
//! apart by the top nibble:
//!
//! * DIR_CLUSTER (`0x4 << 60`): parent directory cluster + the entry's
//!   first data cluster. Used whenever the entry owns data.
//! * DIR_INDEX (`0x0 << 60`): parent directory cluster + the entry's index
//!   in the directory. Used for zero-size entries with no data cluster.
//! * ARTIFICIAL (`0x6 << 60`): counter-allocated when two files would
//!   otherwise collide on the same encoded ID.
//!
//! Bit 63 and bit 60 may never both be clear/set in other combinations;
//! such IDs are rejected as malformed.

use crate::volume::FatVolume;
use bitflags::bitflags;
use core_vfs::{FsError, FsResult, InodeId};

pub const ARTIFICIAL_ID_BITS: u64 = 0x6 << 60;
pub const DIR_CLUSTER_ID_BITS: u64 = 0x4 << 60;
pub const DIR_INDEX_ID_BITS: u64 = 0;
const INVALID_ID_MASK: u64 = 0x9 << 60;

pub fn dir_index_id(dir_cluster: u32, index: u32) -> InodeId {
    DIR_INDEX_ID_BITS | ((dir_cluster as u64) << 32) | index as u64
}

pub fn dir_cluster_id(dir_cluster: u32, file_cluster: u32) -> InodeId {
    DIR_CLUSTER_ID_BITS | ((dir_cluster as u64) << 32) | file_cluster as u64
}

pub fn is_dir_cluster_id(id: InodeId) -> bool {
    (id & ARTIFICIAL_ID_BITS) == DIR_CLUSTER_ID_BITS
}

pub fn is_dir_index_id(id: InodeId) -> bool {
    (id & ARTIFICIAL_ID_BITS) == DIR_INDEX_ID_BITS
}

pub fn is_artificial_id(id: InodeId) -> bool {
    (id & ARTIFICIAL_ID_BITS) == ARTIFICIAL_ID_BITS
}

pub fn is_invalid_id(id: InodeId) -> bool {
    (!is_dir_cluster_id(id) && !is_dir_index_id(id) && !is_artificial_id(id))
        || (id & INVALID_ID_MASK) != 0
}

/// Low half: the entry's first data cluster (DIR_CLUSTER form).
pub fn cluster_of(id: InodeId) -> u32 {
    (id & 0xffff_ffff) as u32
}

/// Low half: the entry's directory index (DIR_INDEX form).
pub fn index_of(id: InodeId) -> u32 {
    (id & 0xffff_ffff) as u32
}

/// The parent directory cluster carried in the upper half, with the type
/// nibble masked off.
pub fn dir_of(id: InodeId) -> u32 {
    (((id >> 32) as u32) & !0xf000_0000) as u32
}

bitflags! {
    /// DOS directory-entry attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DosAttribs: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME    = 0x08;
        const SUBDIR    = 0x10;
        const ARCHIVE   = 0x20;
    }
}

/// In-memory inode. Fields mirroring the directory entry are written back
/// to disk immediately after any change so the directory iterator keeps
/// seeing consistent data.
#[derive(Debug)]
pub struct FatInode {
    pub inode_id: InodeId,
    /// Inode of the directory containing this entry.
    pub parent_inode_id: InodeId,
    /// Index range of the entry run (LFN entries plus the short entry).
    /// `None` on the root inode, which has no backing entry.
    pub dir_start_index: Option<u32>,
    pub dir_end_index: Option<u32>,
    /// First data cluster; 0 iff the file is empty.
    pub start_cluster: u32,
    /// Last data cluster; 0 iff the file is empty.
    pub end_cluster: u32,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub time: i64,
    pub dos_attribs: DosAttribs,
    /// Bumped whenever the FAT chain changes so file-handle cursors can
    /// detect staleness.
    pub iteration: u32,
    pub deleted: bool,
}

impl FatInode {
    pub fn is_directory(&self) -> bool {
        self.dos_attribs.contains(DosAttribs::SUBDIR)
    }

    /// Persist the directory-entry fields (attributes, time, first cluster,
    /// size) to the short entry on disk. No-op for deleted inodes.
    pub fn flush_to_disk(&self, vol: &FatVolume) -> FsResult<()> {
        use crate::dir_iter::DirectoryIterator;

        if self.deleted {
            return Ok(());
        }
        if self.start_cluster != 0 && !vol.is_data_cluster(self.start_cluster) {
            tracing::error!(
                target: "fat",
                start_cluster = self.start_cluster,
                "inode flush with invalid start cluster"
            );
            return Err(FsError::InvalidArg);
        }
        // The root directory has no backing entry to update.
        let Some(end_index) = self.dir_end_index else {
            return Ok(());
        };
        let mut iter = DirectoryIterator::new(vol, cluster_of(self.parent_inode_id), end_index)?;
        let Some(mut entry) = iter.current_raw()? else {
            return Err(FsError::NoEntry);
        };
        entry[11] = self.dos_attribs.bits();
        entry[22..26].copy_from_slice(&unix_time_to_fat_time(self.time).to_le_bytes());
        entry[26..28].copy_from_slice(&((self.start_cluster & 0xffff) as u16).to_le_bytes());
        entry[20..22].copy_from_slice(&((self.start_cluster >> 16) as u16).to_le_bytes());
        let recorded_size = if self.is_directory() { 0 } else { self.size as u32 };
        entry[28..32].copy_from_slice(&recorded_size.to_le_bytes());
        iter.write_current(&entry)?;
        iter.finish()?;
        Ok(())
    }
}

// MS-DOS timestamps are local time with a fixed 120-minute offset and no
// daylight-saving correction; files written across a DST boundary come back
// one hour off. Kept as is so images round-trip byte-identically with the
// device firmware.
const TZ_OFFSET_MINUTES: i64 = 120;

/// Cumulative day count at the start of each 1-based month.
const DAZE: [i64; 16] = [0, 0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 0, 0, 0];

fn is_leap_year(years_since_1900: i64) -> bool {
    years_since_1900 % 4 == 0 && years_since_1900 % 100 != 0
}

/// Leap days between 1970 and `year` years after 1970, up to `month`
/// (0-based) of that year.
fn leap_days(year: i64, month: i64) -> i64 {
    let mut result = (year + 2) / 4 - (year + 70) / 100;
    if is_leap_year(year + 70) && month < 2 {
        result -= 1;
    }
    result
}

/// Unpack an MS-DOS timestamp (date in the high 16 bits, 2-second time in
/// the low 16) into Unix seconds.
pub fn fat_time_to_unix_time(fat_time: u32) -> i64 {
    let fat_time = fat_time as i64;
    let month = (fat_time >> 21) & 15;
    let years_since_1980 = fat_time >> 25;
    let days = DAZE[month as usize]
        + (years_since_1980 + 10) * 365
        + leap_days(years_since_1980 + 10, month - 1)
        + ((fat_time >> 16) & 31)
        - 1;
    (((days * 24) + ((fat_time >> 11) & 31)) * 60 + ((fat_time >> 5) & 63) + TZ_OFFSET_MINUTES) * 60
        + 2 * (fat_time & 31)
}

/// Pack Unix seconds into an MS-DOS timestamp. Sub-2-second precision is
/// lost.
pub fn unix_time_to_fat_time(unix_time: i64) -> u32 {
    let mut t = unix_time;
    let mut fat_time = ((t % 60) / 2) as u32;
    t /= 60;
    t -= TZ_OFFSET_MINUTES;
    fat_time += ((t % 60) as u32) << 5;
    t /= 60;
    fat_time += ((t % 24) as u32) << 11;
    t /= 24;

    // Convert from 1970-based days to 1980-based days.
    t -= 10 * 365 + 2;

    let mut year = 0i64;
    loop {
        let days = if is_leap_year(80 + year) { 366 } else { 365 };
        if t < days {
            break;
        }
        t -= days;
        year += 1;
    }

    let date;
    if is_leap_year(80 + year) && t == 59 {
        // February 29th, 0-based.
        date = (1 << 5) + 28;
    } else {
        if is_leap_year(80 + year) && t > 59 {
            t -= 1;
        }
        let mut month = 0i64;
        while month < 11 {
            if DAZE[(month + 2) as usize] > t {
                break;
            }
            month += 1;
        }
        date = (month << 5) + (t - DAZE[(month + 1) as usize]);
    }
    // Make day and month 1-based.
    let date = date + (1 << 5) + 1;

    fat_time + ((date as u32) << 16) + ((year as u32) << 25)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_encodings_are_distinguishable() {
        let a = dir_cluster_id(7, 42);
        let b = dir_index_id(7, 42);
        let c = ARTIFICIAL_ID_BITS | 1;
        assert!(is_dir_cluster_id(a) && !is_dir_index_id(a) && !is_artificial_id(a));
        assert!(is_dir_index_id(b) && !is_dir_cluster_id(b));
        assert!(is_artificial_id(c));
        assert_eq!(dir_of(a), 7);
        assert_eq!(cluster_of(a), 42);
        assert_eq!(index_of(b), 42);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(is_invalid_id(0x9 << 60));
        assert!(is_invalid_id(0x2 << 60));
        assert!(!is_invalid_id(dir_cluster_id(3, 9)));
        assert!(!is_invalid_id(dir_index_id(3, 9)));
    }

    fn pack(year: u32, month: u32, day: u32, hour: u32, min: u32, sec2: u32) -> u32 {
        (year << 25) | (month << 21) | (day << 16) | (hour << 11) | (min << 5) | sec2
    }

    #[test]
    fn fat_time_round_trips() {
        let samples = [
            pack(15, 7, 20, 10, 30, 12), // 1995-07-20 10:30:24
            pack(0, 1, 1, 0, 0, 0),      // 1980-01-01 00:00:00
            pack(40, 12, 31, 23, 59, 29),
            pack(24, 2, 29, 6, 1, 1), // leap day 2004-02-29
        ];
        for &t in &samples {
            let unix = fat_time_to_unix_time(t);
            assert_eq!(unix_time_to_fat_time(unix), t, "fat {t:#x}");
        }
    }

    #[test]
    fn unix_round_trip_loses_only_seconds_parity() {
        let unix = 1_600_000_000i64;
        let fat = unix_time_to_fat_time(unix);
        let back = fat_time_to_unix_time(fat);
        assert_eq!(back, unix - (unix % 2));
    }

    #[test]
    fn leap_day_encodes() {
        // 2020-02-29 00:00:00 in FAT's frame of reference.
        let fat = unix_time_to_fat_time(1_582_934_400 + TZ_OFFSET_MINUTES * 60);
        let day = (fat >> 16) & 31;
        let month = (fat >> 21) & 15;
        assert_eq!((month, day), (2, 29));
    }
}
