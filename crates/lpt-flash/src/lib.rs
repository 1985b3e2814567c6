#![forbid(unsafe_code)]
//! LEB-addressed flash access.
//!
//! Provides the [`LebDevice`] trait — the narrow interface the LPT uses
//! to reach the flash-management layer below it — plus two
//! implementations: [`FileLebDevice`] mapping LEBs onto a flat image
//! file, and [`RamLebDevice`] for tests and tooling.
//!
//! Reads and writes are blocking; the device performs no retries. An I/O
//! failure propagates verbatim to the caller, and a read of a LEB that
//! was never written returns erased flash (all `0xFF`).

use lpt_error::{LptError, Result};
use lpt_types::Lnum;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Raw access to logical erase blocks.
pub trait LebDevice: Send + Sync {
    /// Size of every LEB in bytes.
    fn leb_size(&self) -> u32;

    /// Number of LEBs the device exposes.
    fn leb_cnt(&self) -> u32;

    /// Read exactly `buf.len()` bytes from `offs` within LEB `lnum`.
    fn leb_read(&self, lnum: Lnum, offs: u32, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offs` within LEB `lnum`.
    fn leb_write(&self, lnum: Lnum, offs: u32, data: &[u8]) -> Result<()>;
}

fn check_bounds(dev: &dyn LebDevice, lnum: Lnum, offs: u32, len: usize) -> Result<()> {
    let leb_size = dev.leb_size() as u64;
    let end = u64::from(offs) + len as u64;
    if lnum.0 >= dev.leb_cnt() {
        return Err(LptError::OutOfRange {
            lnum: lnum.0,
            offs,
            detail: format!("LEB number beyond device ({} LEBs)", dev.leb_cnt()),
        });
    }
    if end > leb_size {
        return Err(LptError::OutOfRange {
            lnum: lnum.0,
            offs,
            detail: format!("access of {len} bytes runs past LEB size {leb_size}"),
        });
    }
    Ok(())
}

/// Flash image backed by a regular file.
///
/// LEB `n` occupies bytes `[n * leb_size, (n + 1) * leb_size)`. Uses
/// `pread`/`pwrite` style positioned I/O, so no seek position is shared
/// between callers.
#[derive(Debug, Clone)]
pub struct FileLebDevice {
    file: Arc<File>,
    leb_size: u32,
    leb_cnt: u32,
}

impl FileLebDevice {
    /// Open an existing image. The file length must be a whole number of
    /// LEBs.
    pub fn open(path: impl AsRef<Path>, leb_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if leb_size == 0 || len % u64::from(leb_size) != 0 {
            return Err(LptError::InvalidGeometry(format!(
                "image length {len} is not a multiple of LEB size {leb_size}"
            )));
        }
        let leb_cnt = u32::try_from(len / u64::from(leb_size)).map_err(|_| {
            LptError::InvalidGeometry(format!("image of {len} bytes holds too many LEBs"))
        })?;
        Ok(Self {
            file: Arc::new(file),
            leb_size,
            leb_cnt,
        })
    }

    /// Create a fresh image of `leb_cnt` erased LEBs.
    pub fn create(path: impl AsRef<Path>, leb_size: u32, leb_cnt: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let erased = vec![0xFF_u8; leb_size as usize];
        for i in 0..leb_cnt {
            file.write_all_at(&erased, u64::from(i) * u64::from(leb_size))?;
        }
        Ok(Self {
            file: Arc::new(file),
            leb_size,
            leb_cnt,
        })
    }
}

impl LebDevice for FileLebDevice {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_cnt(&self) -> u32 {
        self.leb_cnt
    }

    fn leb_read(&self, lnum: Lnum, offs: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self, lnum, offs, buf.len())?;
        let pos = u64::from(lnum.0) * u64::from(self.leb_size) + u64::from(offs);
        self.file.read_exact_at(buf, pos)?;
        trace!(lnum = lnum.0, offs, len = buf.len(), "leb_read");
        Ok(())
    }

    fn leb_write(&self, lnum: Lnum, offs: u32, data: &[u8]) -> Result<()> {
        check_bounds(self, lnum, offs, data.len())?;
        let pos = u64::from(lnum.0) * u64::from(self.leb_size) + u64::from(offs);
        self.file.write_all_at(data, pos)?;
        trace!(lnum = lnum.0, offs, len = data.len(), "leb_write");
        Ok(())
    }
}

/// In-memory flash image.
///
/// LEBs that were never written read back as erased flash (`0xFF`).
#[derive(Debug)]
pub struct RamLebDevice {
    leb_size: u32,
    lebs: Mutex<Vec<Option<Vec<u8>>>>,
}

impl RamLebDevice {
    #[must_use]
    pub fn new(leb_size: u32, leb_cnt: u32) -> Self {
        Self {
            leb_size,
            lebs: Mutex::new(vec![None; leb_cnt as usize]),
        }
    }
}

impl LebDevice for RamLebDevice {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_cnt(&self) -> u32 {
        let lebs = self.lebs.lock();
        lebs.len() as u32
    }

    fn leb_read(&self, lnum: Lnum, offs: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self, lnum, offs, buf.len())?;
        let lebs = self.lebs.lock();
        match &lebs[lnum.0 as usize] {
            Some(data) => {
                let start = offs as usize;
                buf.copy_from_slice(&data[start..start + buf.len()]);
            }
            None => buf.fill(0xFF),
        }
        Ok(())
    }

    fn leb_write(&self, lnum: Lnum, offs: u32, data: &[u8]) -> Result<()> {
        check_bounds(self, lnum, offs, data.len())?;
        let mut lebs = self.lebs.lock();
        let leb = lebs[lnum.0 as usize].get_or_insert_with(|| vec![0xFF; self.leb_size as usize]);
        let start = offs as usize;
        leb[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_reads_erased_flash() {
        let dev = RamLebDevice::new(4096, 8);
        let mut buf = [0u8; 16];
        dev.leb_read(Lnum(3), 100, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn ram_device_round_trips_writes() {
        let dev = RamLebDevice::new(4096, 8);
        dev.leb_write(Lnum(2), 64, b"lpt node bytes").unwrap();
        let mut buf = [0u8; 14];
        dev.leb_read(Lnum(2), 64, &mut buf).unwrap();
        assert_eq!(&buf, b"lpt node bytes");
        // Bytes around the write stay erased.
        let mut edge = [0u8; 1];
        dev.leb_read(Lnum(2), 63, &mut edge).unwrap();
        assert_eq!(edge[0], 0xFF);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let dev = RamLebDevice::new(4096, 8);
        let mut buf = [0u8; 8];
        let err = dev.leb_read(Lnum(8), 0, &mut buf).unwrap_err();
        assert!(matches!(err, LptError::OutOfRange { lnum: 8, .. }));

        let err = dev.leb_write(Lnum(0), 4090, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, LptError::OutOfRange { .. }));
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let dev = FileLebDevice::create(&path, 2048, 4).unwrap();
        dev.leb_write(Lnum(1), 10, b"abc").unwrap();
        drop(dev);

        let dev = FileLebDevice::open(&path, 2048).unwrap();
        assert_eq!(dev.leb_cnt(), 4);
        let mut buf = [0u8; 3];
        dev.leb_read(Lnum(1), 10, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        let mut erased = [0u8; 4];
        dev.leb_read(Lnum(3), 0, &mut erased).unwrap();
        assert_eq!(erased, [0xFF; 4]);
    }

    #[test]
    fn file_device_rejects_ragged_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.img");
        std::fs::write(&path, vec![0u8; 3000]).unwrap();
        let err = FileLebDevice::open(&path, 2048).unwrap_err();
        assert!(matches!(err, LptError::InvalidGeometry(_)));
    }
}
