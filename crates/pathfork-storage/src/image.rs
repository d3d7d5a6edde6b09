use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::Path;

use crate::{DiskError, Result, SECTOR_SIZE};

/// Read-only sector source backing the root of a lineage tree.
///
/// Base images are never written through the lineage; every modification lands in an overlay.
pub trait BaseImage {
    fn sector_count(&self) -> u64;

    /// Fill `buf` (exactly [`SECTOR_SIZE`] bytes) with sector `index`.
    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<()>;
}

impl<T: BaseImage + ?Sized> BaseImage for Box<T> {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_sector(index, buf)
    }
}

fn check_request(index: u64, sector_count: u64, buf: &[u8]) -> Result<()> {
    if buf.len() != SECTOR_SIZE {
        return Err(DiskError::UnalignedLength {
            len: buf.len(),
            alignment: SECTOR_SIZE,
        });
    }
    if index >= sector_count {
        return Err(DiskError::Io(format!(
            "sector {index} beyond end of image ({sector_count} sectors)"
        )));
    }
    Ok(())
}

/// Base image held entirely in memory.
pub struct MemImage {
    data: Vec<u8>,
}

impl MemImage {
    /// Zero-filled image of `sector_count` sectors.
    pub fn zeroed(sector_count: u64) -> Result<Self> {
        let len = sector_count
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(DiskError::AllocationFailure {
                requested: usize::MAX,
            })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| DiskError::AllocationFailure { requested: len })?;
        data.resize(len, 0);
        Ok(Self { data })
    }

    /// Wrap existing image bytes. The length must be a whole number of sectors.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(DiskError::UnalignedLength {
                len: data.len(),
                alignment: SECTOR_SIZE,
            });
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BaseImage for MemImage {
    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_request(index, self.sector_count(), buf)?;
        let start = index as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data[start..start + SECTOR_SIZE]);
        Ok(())
    }
}

/// Synthetic all-zero image. Costs no memory regardless of its size.
#[derive(Debug, Clone, Copy)]
pub struct ZeroImage {
    sector_count: u64,
}

impl ZeroImage {
    pub fn new(sector_count: u64) -> Self {
        Self { sector_count }
    }
}

impl BaseImage for ZeroImage {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_request(index, self.sector_count, buf)?;
        buf.fill(0);
        Ok(())
    }
}

/// Read-only raw image file on the host filesystem.
///
/// A trailing partial sector is exposed as a full sector padded with zeroes.
pub struct FileImage {
    file: File,
    sector_count: u64,
}

impl FileImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            sector_count: len.div_ceil(SECTOR_SIZE as u64),
        })
    }
}

impl BaseImage for FileImage {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_request(index, self.sector_count, buf)?;
        let offset = index * SECTOR_SIZE as u64;

        let mut filled = 0;
        while filled < buf.len() {
            match read_at(&self.file, offset + filled as u64, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(not(any(unix, windows)))]
fn read_at(_file: &File, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positional file reads are not supported on this platform",
    ))
}
