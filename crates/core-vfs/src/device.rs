//! Block-device boundary consumed by the cache and the filesystem drivers.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct DeviceGeometry {
    pub bytes_per_sector: u32,
    pub sector_count: u64,
    pub read_only: bool,
    pub removable: bool,
}

/// Sector-addressed storage. Offsets are byte offsets; callers keep them
/// sector aligned. Implementations must tolerate concurrent calls (the
/// background flusher shares the device with the filesystem thread).
pub trait BlockDevice: Send + Sync {
    /// Device geometry, or `None` when the device cannot report one (the
    /// caller then falls back to disk-image conventions).
    fn geometry(&self) -> Option<DeviceGeometry>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;
}

/// A filesystem image in a regular file, mountable like a removable disk
/// with 512-byte sectors.
pub struct DiskImage {
    file: File,
    read_only: bool,
}

impl DiskImage {
    /// Open `path` read-write, falling back to read-only when the file mode
    /// does not allow writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok(Self {
                file,
                read_only: false,
            }),
            Err(_) => {
                let file = OpenOptions::new().read(true).open(path)?;
                Ok(Self {
                    file,
                    read_only: true,
                })
            }
        }
    }

    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }
}

impl BlockDevice for DiskImage {
    fn geometry(&self) -> Option<DeviceGeometry> {
        let len = self.file.metadata().ok()?.len();
        Some(DeviceGeometry {
            bytes_per_sector: 512,
            sector_count: len / 512,
            read_only: self.read_only,
            removable: true,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt;
            self.file.seek_read(buf, offset)
        }
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only image",
            ));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt;
            self.file.seek_write(buf, offset)
        }
    }
}

/// RAM-backed device for tests and the headless compositor demo.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    bytes_per_sector: u32,
    read_only: bool,
}

impl MemDevice {
    pub fn new(bytes_per_sector: u32, sector_count: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; (bytes_per_sector as u64 * sector_count) as usize]),
            bytes_per_sector,
            read_only: false,
        }
    }

    pub fn from_bytes(bytes_per_sector: u32, data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            bytes_per_sector,
            read_only: false,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDevice {
    fn geometry(&self) -> Option<DeviceGeometry> {
        let len = self.data.lock().unwrap().len() as u64;
        Some(DeviceGeometry {
            bytes_per_sector: self.bytes_per_sector,
            sector_count: len / self.bytes_per_sector as u64,
            read_only: self.read_only,
            removable: true,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of device",
            ));
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(buf.len())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end of device",
            ));
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn disk_image_geometry_from_file_length() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();
        let image = DiskImage::open(tmp.path()).unwrap();
        let geo = image.geometry().unwrap();
        assert_eq!(geo.bytes_per_sector, 512);
        assert_eq!(geo.sector_count, 8);
        assert!(geo.removable);
    }

    #[test]
    fn mem_device_round_trip() {
        let dev = MemDevice::new(512, 4);
        dev.write_at(512, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(dev.read_at(2048, &mut buf).is_err());
    }
}
