//! Shared helpers: freshly formatted in-memory volumes for each test.

use core_fat::format::{format_volume, FormatParams};
use core_fat::{FatFilesystem, FatVolume};
use core_vfs::{Filesystem, MemDevice, VolumeFlags};
use std::sync::Arc;

pub fn fat16_volume() -> (FatFilesystem, Arc<FatVolume>, Arc<MemDevice>) {
    volume(FormatParams::default())
}

pub fn fat32_volume() -> (FatFilesystem, Arc<FatVolume>, Arc<MemDevice>) {
    volume(FormatParams {
        fat_bits: 32,
        sectors_per_cluster: 1,
        total_sectors: 80000,
        ..FormatParams::default()
    })
}

pub fn fat12_volume() -> (FatFilesystem, Arc<FatVolume>, Arc<MemDevice>) {
    volume(FormatParams {
        fat_bits: 12,
        sectors_per_cluster: 1,
        total_sectors: 2880,
        root_entries: 224,
        media_descriptor: 0xf0,
        ..FormatParams::default()
    })
}

pub fn volume(params: FormatParams) -> (FatFilesystem, Arc<FatVolume>, Arc<MemDevice>) {
    let device = Arc::new(MemDevice::new(
        params.bytes_per_sector,
        params.total_sectors as u64,
    ));
    format_volume(device.as_ref(), &params).expect("format");
    let fs = FatFilesystem::new();
    let volume = fs
        .mount(
            Arc::clone(&device) as Arc<dyn core_vfs::BlockDevice>,
            "mem0",
            VolumeFlags::empty(),
        )
        .expect("mount");
    (fs, volume, device)
}
