//! Volume initialization: lay down a fresh FAT12/16/32 filesystem on a
//! block device. Used by the `pados mkfs` subcommand and the integration
//! tests; the device build formats removable media with the same code.

use crate::super_block::{
    FSINFO_SIGNATURE1, FSINFO_SIGNATURE2, FSINFO_SIGNATURE3, MBR_SIGNATURE,
};
use crate::{CHAIN_TERMINATOR, FIRST_DATA_CLUSTER};
use core_vfs::{BlockDevice, FsError, FsResult};
use tracing::info;

#[derive(Debug, Clone)]
pub struct FormatParams {
    pub fat_bits: u8,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u32,
    /// FAT12/16 fixed-root capacity; ignored for FAT32.
    pub root_entries: u32,
    pub media_descriptor: u8,
    pub volume_label: Option<[u8; 11]>,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            fat_bits: 16,
            bytes_per_sector: 512,
            sectors_per_cluster: 4,
            total_sectors: 20480,
            root_entries: 512,
            media_descriptor: 0xf8,
            volume_label: None,
        }
    }
}

struct Layout {
    reserved_sectors: u32,
    sectors_per_fat: u32,
    root_sectors: u32,
    first_data_sector: u32,
    total_clusters: u32,
}

fn compute_layout(p: &FormatParams) -> FsResult<Layout> {
    let reserved_sectors = if p.fat_bits == 32 { 32 } else { 1 };
    let root_sectors = if p.fat_bits == 32 {
        0
    } else {
        p.root_entries * 32 / p.bytes_per_sector
    };
    let mut sectors_per_fat = 1u32;
    loop {
        let first_data = reserved_sectors + 2 * sectors_per_fat + root_sectors;
        if first_data >= p.total_sectors {
            return Err(FsError::InvalidArg);
        }
        let clusters = (p.total_sectors - first_data) / p.sectors_per_cluster;
        let fat_bytes = ((clusters as u64 + 2) * p.fat_bits as u64 + 7) / 8;
        let needed = fat_bytes.div_ceil(p.bytes_per_sector as u64) as u32;
        if needed <= sectors_per_fat {
            let first_data_sector = reserved_sectors + 2 * sectors_per_fat + root_sectors;
            return Ok(Layout {
                reserved_sectors,
                sectors_per_fat,
                root_sectors,
                first_data_sector,
                total_clusters: (p.total_sectors - first_data_sector) / p.sectors_per_cluster,
            });
        }
        sectors_per_fat = needed;
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write a fresh filesystem. The requested FAT width must agree with the
/// cluster count the geometry produces, since mounting re-derives the width
/// from that count.
pub fn format_volume(device: &dyn BlockDevice, p: &FormatParams) -> FsResult<()> {
    if !matches!(p.fat_bits, 12 | 16 | 32) {
        return Err(FsError::InvalidArg);
    }
    if !matches!(p.bytes_per_sector, 512 | 1024 | 2048)
        || !p.sectors_per_cluster.is_power_of_two()
        || p.sectors_per_cluster > 128
    {
        return Err(FsError::InvalidArg);
    }
    if p.fat_bits != 32 && p.root_entries % (p.bytes_per_sector / 32) != 0 {
        return Err(FsError::InvalidArg);
    }
    let layout = compute_layout(p)?;
    let derived_bits = if p.fat_bits == 32 {
        32
    } else if layout.total_clusters > 0xff1 {
        16
    } else {
        12
    };
    if derived_bits != p.fat_bits {
        return Err(FsError::InvalidArg);
    }

    let bps = p.bytes_per_sector as usize;
    let mut boot = vec![0u8; bps];
    boot[0] = 0xeb;
    boot[1] = 0x3c;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"PADOS1.0");
    put_u16(&mut boot, 0x0b, p.bytes_per_sector as u16);
    boot[0x0d] = p.sectors_per_cluster as u8;
    put_u16(&mut boot, 0x0e, layout.reserved_sectors as u16);
    boot[0x10] = 2; // FAT count
    boot[0x15] = p.media_descriptor;
    put_u16(&mut boot, 0x18, 63); // sectors per track (geometry is nominal)
    put_u16(&mut boot, 0x1a, 255); // head count

    let label = p.volume_label.unwrap_or(*b"NO NAME    ");
    if p.fat_bits == 32 {
        put_u32(&mut boot, 0x20, p.total_sectors);
        put_u32(&mut boot, 0x24, layout.sectors_per_fat);
        put_u16(&mut boot, 0x28, 0); // mirrored, active FAT 0
        put_u32(&mut boot, 0x2c, FIRST_DATA_CLUSTER); // root cluster
        put_u16(&mut boot, 0x30, 1); // fsinfo sector
        put_u16(&mut boot, 0x32, 6); // backup boot sector
        boot[0x42] = 0x29;
        put_u32(&mut boot, 0x43, 0x50_41_44_53);
        boot[0x47..0x52].copy_from_slice(&label);
        boot[0x52..0x5a].copy_from_slice(b"FAT32   ");
    } else {
        put_u16(&mut boot, 0x11, p.root_entries as u16);
        if p.total_sectors <= u16::MAX as u32 {
            put_u16(&mut boot, 0x13, p.total_sectors as u16);
        } else {
            put_u32(&mut boot, 0x20, p.total_sectors);
        }
        put_u16(&mut boot, 0x16, layout.sectors_per_fat as u16);
        boot[0x26] = 0x29;
        put_u32(&mut boot, 0x27, 0x50_41_44_53);
        boot[0x2b..0x36].copy_from_slice(&label);
        boot[0x36..0x3e].copy_from_slice(if p.fat_bits == 16 {
            b"FAT16   "
        } else {
            b"FAT12   "
        });
    }
    put_u16(&mut boot, 0x1fe, MBR_SIGNATURE);
    device.write_at(0, &boot)?;

    // Empty FATs: the media entry, the end-of-chain entry and (FAT32) the
    // root directory's single cluster.
    let mut fat = vec![0u8; layout.sectors_per_fat as usize * bps];
    match p.fat_bits {
        12 => {
            let packed = (p.media_descriptor as u32) | 0xfff_f00;
            fat[0] = (packed & 0xff) as u8;
            fat[1] = ((packed >> 8) & 0xff) as u8;
            fat[2] = ((packed >> 16) & 0xff) as u8;
        }
        16 => {
            put_u16(&mut fat, 0, 0xff00 | p.media_descriptor as u16);
            put_u16(&mut fat, 2, 0xffff);
        }
        _ => {
            put_u32(&mut fat, 0, 0x0fff_ff00 | p.media_descriptor as u32);
            put_u32(&mut fat, 4, 0x0fff_ffff);
            put_u32(&mut fat, 8, CHAIN_TERMINATOR);
        }
    }
    for copy in 0..2u64 {
        let sector = layout.reserved_sectors as u64 + copy * layout.sectors_per_fat as u64;
        device.write_at(sector * bps as u64, &fat)?;
    }

    // Zero the root directory.
    let zero = vec![0u8; bps];
    if p.fat_bits == 32 {
        // The root chain starts at the first data cluster.
        let root_first = layout.first_data_sector as u64;
        for s in 0..p.sectors_per_cluster as u64 {
            device.write_at((root_first + s) * bps as u64, &zero)?;
        }
    } else {
        let root_first = (layout.reserved_sectors + 2 * layout.sectors_per_fat) as u64;
        for s in 0..layout.root_sectors as u64 {
            device.write_at((root_first + s) * bps as u64, &zero)?;
        }
    }

    // FS-info and backup boot sector.
    if p.fat_bits == 32 {
        let mut fs_info = vec![0u8; bps];
        put_u32(&mut fs_info, 0, FSINFO_SIGNATURE1);
        put_u32(&mut fs_info, 484, FSINFO_SIGNATURE2);
        put_u32(&mut fs_info, 488, layout.total_clusters - 1); // root takes one
        put_u32(&mut fs_info, 492, FIRST_DATA_CLUSTER);
        put_u32(&mut fs_info, 508, FSINFO_SIGNATURE3);
        device.write_at(bps as u64, &fs_info)?;
        device.write_at(6 * bps as u64, &boot)?;
    }

    info!(
        target: "fat",
        fat_bits = p.fat_bits,
        total_clusters = layout.total_clusters,
        sectors_per_fat = layout.sectors_per_fat,
        "formatted volume"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::super_block::parse_super_block;
    use core_vfs::MemDevice;

    #[test]
    fn formatted_fat16_volume_parses_back() {
        let dev = MemDevice::new(512, 20480);
        format_volume(&dev, &FormatParams::default()).unwrap();
        let mut boot = vec![0u8; 512];
        dev.read_at(0, &mut boot).unwrap();
        let sb = parse_super_block(&boot).unwrap();
        assert_eq!(sb.fat_bits, 16);
        assert_eq!(sb.fat_count, 2);
        assert!(sb.total_clusters > 0xff1);
    }

    #[test]
    fn formatted_fat32_volume_parses_back() {
        let dev = MemDevice::new(512, 80000);
        let params = FormatParams {
            fat_bits: 32,
            sectors_per_cluster: 1,
            total_sectors: 80000,
            ..FormatParams::default()
        };
        format_volume(&dev, &params).unwrap();
        let mut boot = vec![0u8; 512];
        dev.read_at(0, &mut boot).unwrap();
        let sb = parse_super_block(&boot).unwrap();
        assert_eq!(sb.fat_bits, 32);
        assert_eq!(sb.root_cluster, 2);
        assert_eq!(sb.fs_info_sector, Some(1));
    }

    #[test]
    fn fat12_layout_fits_small_media() {
        let dev = MemDevice::new(512, 2880);
        let params = FormatParams {
            fat_bits: 12,
            sectors_per_cluster: 1,
            total_sectors: 2880,
            root_entries: 224,
            media_descriptor: 0xf0,
            ..FormatParams::default()
        };
        format_volume(&dev, &params).unwrap();
        let mut boot = vec![0u8; 512];
        dev.read_at(0, &mut boot).unwrap();
        let sb = parse_super_block(&boot).unwrap();
        assert_eq!(sb.fat_bits, 12);
        assert!(sb.total_clusters <= 0xff1);
    }

    #[test]
    fn mismatched_width_is_rejected() {
        let dev = MemDevice::new(512, 2880);
        let params = FormatParams {
            fat_bits: 16,
            sectors_per_cluster: 1,
            total_sectors: 2880,
            root_entries: 224,
            ..FormatParams::default()
        };
        assert!(matches!(
            format_volume(&dev, &params),
            Err(FsError::InvalidArg)
        ));
    }
}
